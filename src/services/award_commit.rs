//! Award commit: accepted offers become supplier-grouped purchase orders.
//!
//! Phase one creates one purchase order per supplier, each in its own transaction and
//! looked up by award batch first so a retried batch reuses what it already created.
//! Phase two is a single requisition-scoped transaction that raises the promise counters
//! (journaled under `award:<batch>`) and propagates quotation statuses.

use chrono::{Duration, NaiveDate, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseTransaction, EntityTrait, QueryFilter,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    audit::{self, AuditRecord, AuditSink},
    auth::Actor,
    db::{
        transaction::{self, retry_on_conflict, RetryPolicy},
        DbPool,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    integrations::{
        master_data::{require_active, require_all_active},
        MasterDataLookup, ReferenceKind,
    },
    models::{
        purchase_order, purchase_order_line, quotation, quotation_offer, PurchaseOrderStatus,
        RequisitionStatus,
    },
    services::{
        quotations::{apply_award_statuses, QuotationStatusUpdate},
        requisition_ledger::{self, LedgerMutation, ProductQuantity, RequisitionLedger, StagedLedger},
        requisitions::load_requisition_aggregate,
    },
};

/// An offer the operator decided to award, fully or in part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedOffer {
    pub product_id: Uuid,
    pub quotation_id: Uuid,
    pub supplier_id: Uuid,
    pub awarded_quantity: i32,
    pub unit_price: Decimal,
    pub estimated_delivery_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AwardCommitRequest {
    /// Chosen by the caller; retries of the same award must reuse it.
    pub award_batch_id: Uuid,
    pub requisition_id: Uuid,
    #[validate(length(min = 1, message = "At least one accepted offer is required"))]
    pub accepted_offers: Vec<AcceptedOffer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwardCommitResult {
    pub success: bool,
    pub message: String,
    pub award_batch_id: Uuid,
    pub created_purchase_orders: Vec<Uuid>,
    /// Orders found from an earlier attempt of the same batch.
    pub reused_purchase_orders: Vec<Uuid>,
    pub requisition_status: RequisitionStatus,
    pub quotation_updates: Vec<QuotationStatusUpdate>,
    /// False when the counters had already been raised by an earlier attempt.
    pub counters_applied: bool,
}

impl AwardCommitResult {
    pub fn purchase_order_ids(&self) -> Vec<Uuid> {
        self.created_purchase_orders
            .iter()
            .chain(self.reused_purchase_orders.iter())
            .copied()
            .collect()
    }
}

/// Offers awarded to one supplier, in request order.
#[derive(Debug, Clone)]
struct SupplierGroup<'a> {
    supplier_id: Uuid,
    offers: Vec<&'a AcceptedOffer>,
}

impl SupplierGroup<'_> {
    fn latest_delivery(&self) -> Option<NaiveDate> {
        self.offers
            .iter()
            .filter_map(|o| o.estimated_delivery_date)
            .max()
    }
}

fn group_by_supplier(offers: &[AcceptedOffer]) -> Vec<SupplierGroup<'_>> {
    let mut groups: BTreeMap<Uuid, Vec<&AcceptedOffer>> = BTreeMap::new();
    for offer in offers {
        groups.entry(offer.supplier_id).or_default().push(offer);
    }
    groups
        .into_iter()
        .map(|(supplier_id, offers)| SupplierGroup {
            supplier_id,
            offers,
        })
        .collect()
}

fn validate_offers(offers: &[AcceptedOffer]) -> Result<(), ServiceError> {
    let mut seen = HashSet::new();
    for offer in offers {
        if offer.awarded_quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "awarded quantity for product {} must be positive",
                offer.product_id
            )));
        }
        if offer.unit_price < Decimal::ZERO {
            return Err(ServiceError::ValidationError(format!(
                "unit price for product {} must not be negative",
                offer.product_id
            )));
        }
        if !seen.insert((offer.quotation_id, offer.product_id)) {
            return Err(ServiceError::ValidationError(format!(
                "offer for product {} on quotation {} is accepted twice",
                offer.product_id, offer.quotation_id
            )));
        }
    }
    Ok(())
}

fn purchase_order_number(id: Uuid) -> String {
    let short: String = id.simple().to_string().chars().take(12).collect();
    format!("PO-{}", short.to_uppercase())
}

enum GroupOutcome {
    Created(purchase_order::Model),
    Reused(purchase_order::Model),
}

#[derive(Clone)]
pub struct AwardCommitService {
    db: Arc<DbPool>,
    event_sender: EventSender,
    audit: Arc<dyn AuditSink>,
    master_data: Arc<dyn MasterDataLookup>,
    ledger: RequisitionLedger,
    retry: RetryPolicy,
    delivery_fallback_days: i64,
}

impl AwardCommitService {
    pub fn new(
        db: Arc<DbPool>,
        event_sender: EventSender,
        audit: Arc<dyn AuditSink>,
        master_data: Arc<dyn MasterDataLookup>,
        ledger: RequisitionLedger,
        retry: RetryPolicy,
        delivery_fallback_days: i64,
    ) -> Self {
        Self {
            db,
            event_sender,
            audit,
            master_data,
            ledger,
            retry,
            delivery_fallback_days,
        }
    }

    /// Converts accepted offers into purchase orders, one per supplier, then raises the
    /// requisition's pending counters and settles quotation statuses.
    ///
    /// Re-running a batch reuses its purchase orders and does not raise counters twice.
    /// A failure after some orders exist is reported as `ServiceError::PartialFailure`.
    #[instrument(skip(self, actor, request), fields(award_batch_id = %request.award_batch_id, requisition_id = %request.requisition_id))]
    pub async fn commit_award(
        &self,
        actor: &Actor,
        request: AwardCommitRequest,
    ) -> Result<AwardCommitResult, ServiceError> {
        request.validate()?;
        validate_offers(&request.accepted_offers)?;

        let (requisition, _) =
            load_requisition_aggregate(self.db.as_ref(), request.requisition_id).await?;
        if !requisition.status.accepts_procurement() {
            return Err(ServiceError::InvalidStatus(format!(
                "requisition {} is {}; awards are not accepted",
                requisition.id, requisition.status
            )));
        }
        let products: BTreeSet<Uuid> =
            request.accepted_offers.iter().map(|o| o.product_id).collect();
        require_all_active(self.master_data.as_ref(), ReferenceKind::Product, products).await?;

        let today = Utc::now().date_naive();
        let mut created = Vec::new();
        let mut reused = Vec::new();
        for group in group_by_supplier(&request.accepted_offers) {
            match self.create_group_order(actor, &request, &group, today).await {
                Ok(GroupOutcome::Created(po)) => {
                    counter!("stateset_procurement.purchase_orders.created", 1);
                    info!(purchase_order_id = %po.id, supplier_id = %po.supplier_id, "Purchase order created from award");
                    created.push(po);
                }
                Ok(GroupOutcome::Reused(po)) => {
                    info!(purchase_order_id = %po.id, supplier_id = %po.supplier_id, "Purchase order reused from earlier award attempt");
                    reused.push(po);
                }
                Err(e) => {
                    let ids: Vec<Uuid> = created.iter().chain(reused.iter()).map(|po| po.id).collect();
                    self.publish_created(&request, &created).await;
                    if ids.is_empty() {
                        return Err(e);
                    }
                    warn!(supplier_id = %group.supplier_id, error = %e, "Award commit stopped after partial progress");
                    counter!("stateset_procurement.award.partial_failure", 1);
                    return Err(ServiceError::PartialFailure {
                        created_purchase_orders: ids,
                        message: format!("supplier {}: {}", group.supplier_id, e),
                    });
                }
            }
        }
        self.publish_created(&request, &created).await;

        let referenced: BTreeSet<Uuid> =
            request.accepted_offers.iter().map(|o| o.quotation_id).collect();
        let mutation = LedgerMutation::AwardCommitted {
            award_batch_id: request.award_batch_id,
            awards: request
                .accepted_offers
                .iter()
                .map(|o| ProductQuantity {
                    product_id: o.product_id,
                    quantity: o.awarded_quantity,
                })
                .collect(),
        };

        let requisition_id = request.requisition_id;
        let (mutation_ref, referenced_ref) = (&mutation, &referenced);
        let phase_two = retry_on_conflict(&self.retry, "award_counters", move || {
            self.commit_counters_once(actor, requisition_id, mutation_ref, referenced_ref)
        })
        .await;

        let po_ids: Vec<Uuid> = created.iter().chain(reused.iter()).map(|po| po.id).collect();
        let (staged, updates, records) = match phase_two {
            Ok(done) => done,
            Err(e) => {
                error!(error = %e, "Award counters could not be applied");
                counter!("stateset_procurement.award.partial_failure", 1);
                return Err(ServiceError::PartialFailure {
                    created_purchase_orders: po_ids,
                    message: format!(
                        "purchase orders exist but requisition counters were not updated ({}); retry with the same award batch",
                        e
                    ),
                });
            }
        };

        let requisition_status = staged.outcome.status_after;
        let counters_applied = staged.outcome.applied;
        self.ledger.publish(staged).await;
        audit::emit_all(self.audit.as_ref(), records).await;
        for update in &updates {
            self.event_sender
                .send_or_log(Event::QuotationStatusChanged {
                    quotation_id: update.quotation_id,
                    old_status: update.old_status,
                    new_status: update.new_status,
                })
                .await;
        }
        self.event_sender
            .send_or_log(Event::AwardCommitted {
                award_batch_id: request.award_batch_id,
                requisition_id: request.requisition_id,
                purchase_order_ids: po_ids,
            })
            .await;

        let message = if reused.is_empty() {
            format!("{} purchase order(s) created", created.len())
        } else {
            format!(
                "{} purchase order(s) created, {} reused from an earlier attempt",
                created.len(),
                reused.len()
            )
        };
        info!(%message, requisition_status = %requisition_status, "Award committed");

        Ok(AwardCommitResult {
            success: true,
            message,
            award_batch_id: request.award_batch_id,
            created_purchase_orders: created.iter().map(|po| po.id).collect(),
            reused_purchase_orders: reused.iter().map(|po| po.id).collect(),
            requisition_status,
            quotation_updates: updates,
            counters_applied,
        })
    }

    async fn create_group_order(
        &self,
        actor: &Actor,
        request: &AwardCommitRequest,
        group: &SupplierGroup<'_>,
        today: NaiveDate,
    ) -> Result<GroupOutcome, ServiceError> {
        require_active(self.master_data.as_ref(), ReferenceKind::Supplier, group.supplier_id)
            .await?;

        let txn = transaction::begin(&self.db).await?;
        if let Some(existing) = purchase_order::Entity::find()
            .filter(purchase_order::Column::AwardBatchId.eq(request.award_batch_id))
            .filter(purchase_order::Column::RequisitionId.eq(request.requisition_id))
            .filter(purchase_order::Column::SupplierId.eq(group.supplier_id))
            .one(&txn)
            .await?
        {
            transaction::commit(txn).await?;
            return Ok(GroupOutcome::Reused(existing));
        }

        let first_quotation = self.check_group(&txn, request, group).await?;

        let now = Utc::now();
        let po_id = Uuid::new_v4();
        let expected_delivery_date = group
            .latest_delivery()
            .unwrap_or_else(|| today + Duration::days(self.delivery_fallback_days));

        let po = purchase_order::ActiveModel {
            id: Set(po_id),
            po_number: Set(purchase_order_number(po_id)),
            requisition_id: Set(request.requisition_id),
            quotation_id: Set(Some(first_quotation.id)),
            supplier_id: Set(group.supplier_id),
            award_batch_id: Set(Some(request.award_batch_id)),
            status: Set(PurchaseOrderStatus::Pending),
            additional_costs: Set(first_quotation.additional_costs),
            currency: Set(first_quotation.currency.clone()),
            expected_delivery_date: Set(expected_delivery_date),
            confirmed_at: Set(None),
            over_order_acknowledged: Set(false),
            created_by: Set(actor.id),
            version: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        for (index, offer) in group.offers.iter().enumerate() {
            purchase_order_line::ActiveModel {
                id: Set(Uuid::new_v4()),
                purchase_order_id: Set(po_id),
                line_number: Set(index as i32 + 1),
                product_id: Set(offer.product_id),
                quotation_id: Set(Some(offer.quotation_id)),
                ordered_quantity: Set(offer.awarded_quantity),
                received_quantity: Set(0),
                received_damaged_quantity: Set(0),
                received_missing_quantity: Set(0),
                unit_price: Set(offer.unit_price),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }

        transaction::commit(txn).await?;
        Ok(GroupOutcome::Created(po))
    }

    /// Checks every offer of the group against its quotation and the requisition.
    /// Returns the first referenced quotation.
    async fn check_group(
        &self,
        txn: &DatabaseTransaction,
        request: &AwardCommitRequest,
        group: &SupplierGroup<'_>,
    ) -> Result<quotation::Model, ServiceError> {
        let (requisition, lines) = load_requisition_aggregate(txn, request.requisition_id).await?;
        if !requisition.status.accepts_procurement() {
            return Err(ServiceError::InvalidStatus(format!(
                "requisition {} is {}",
                requisition.id, requisition.status
            )));
        }

        let mut first: Option<quotation::Model> = None;
        let mut loaded: BTreeMap<Uuid, quotation::Model> = BTreeMap::new();
        for offer in &group.offers {
            if !lines.iter().any(|l| l.product_id == offer.product_id) {
                return Err(ServiceError::ValidationError(format!(
                    "product {} is not required by requisition {}",
                    offer.product_id, requisition.id
                )));
            }

            let quote = match loaded.get(&offer.quotation_id) {
                Some(q) => q.clone(),
                None => {
                    let q = quotation::Entity::find_by_id(offer.quotation_id)
                        .one(txn)
                        .await?
                        .ok_or_else(|| {
                            ServiceError::NotFound(format!(
                                "Quotation {} not found",
                                offer.quotation_id
                            ))
                        })?;
                    loaded.insert(q.id, q.clone());
                    q
                }
            };
            if quote.requisition_id != request.requisition_id {
                return Err(ServiceError::ValidationError(format!(
                    "quotation {} belongs to another requisition",
                    quote.id
                )));
            }
            if quote.supplier_id != group.supplier_id {
                return Err(ServiceError::ValidationError(format!(
                    "quotation {} was not issued by supplier {}",
                    quote.id, group.supplier_id
                )));
            }
            if !quote.status.is_open() {
                return Err(ServiceError::InvalidStatus(format!(
                    "quotation {} is {} and cannot be awarded",
                    quote.id, quote.status
                )));
            }

            let quoted = quotation_offer::Entity::find()
                .filter(quotation_offer::Column::QuotationId.eq(quote.id))
                .filter(quotation_offer::Column::ProductId.eq(offer.product_id))
                .one(txn)
                .await?
                .ok_or_else(|| {
                    ServiceError::ValidationError(format!(
                        "quotation {} has no offer for product {}",
                        quote.id, offer.product_id
                    ))
                })?;
            if offer.awarded_quantity > quoted.quoted_quantity {
                return Err(ServiceError::ValidationError(format!(
                    "awarded {} of product {} but quotation {} only offers {}",
                    offer.awarded_quantity, offer.product_id, quote.id, quoted.quoted_quantity
                )));
            }

            if first.is_none() {
                first = Some(quote);
            }
        }

        first.ok_or_else(|| ServiceError::ValidationError("supplier group has no offers".to_string()))
    }

    async fn commit_counters_once(
        &self,
        actor: &Actor,
        requisition_id: Uuid,
        mutation: &LedgerMutation,
        referenced: &BTreeSet<Uuid>,
    ) -> Result<(StagedLedger, Vec<QuotationStatusUpdate>, Vec<AuditRecord>), ServiceError> {
        let txn = transaction::begin(&self.db).await?;
        let staged = requisition_ledger::apply_in_txn(&txn, actor, requisition_id, mutation).await?;
        let (updates, records) = apply_award_statuses(&txn, actor, requisition_id, referenced).await?;
        transaction::commit(txn).await?;
        Ok((staged, updates, records))
    }

    async fn publish_created(&self, request: &AwardCommitRequest, created: &[purchase_order::Model]) {
        for po in created {
            self.event_sender
                .send_or_log(Event::PurchaseOrderCreated {
                    purchase_order_id: po.id,
                    requisition_id: request.requisition_id,
                    supplier_id: po.supplier_id,
                    award_batch_id: Some(request.award_batch_id),
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    fn accepted(supplier_id: Uuid, quantity: i32, eta: Option<NaiveDate>) -> AcceptedOffer {
        AcceptedOffer {
            product_id: Uuid::new_v4(),
            quotation_id: Uuid::new_v4(),
            supplier_id,
            awarded_quantity: quantity,
            unit_price: dec!(10),
            estimated_delivery_date: eta,
        }
    }

    #[test]
    fn offers_are_grouped_per_supplier() {
        let (s1, s2) = (Uuid::new_v4(), Uuid::new_v4());
        let offers = vec![accepted(s1, 1, None), accepted(s2, 2, None), accepted(s1, 3, None)];
        let groups = group_by_supplier(&offers);
        assert_eq!(groups.len(), 2);
        let s1_group = groups.iter().find(|g| g.supplier_id == s1).unwrap();
        let quantities: Vec<i32> = s1_group.offers.iter().map(|o| o.awarded_quantity).collect();
        assert_eq!(quantities, vec![1, 3]);
    }

    #[test]
    fn group_delivery_is_the_latest_estimate() {
        let s = Uuid::new_v4();
        let early = NaiveDate::from_ymd_opt(2024, 5, 1);
        let late = NaiveDate::from_ymd_opt(2024, 5, 20);
        let offers = vec![accepted(s, 1, early), accepted(s, 1, None), accepted(s, 1, late)];
        let groups = group_by_supplier(&offers);
        assert_eq!(groups[0].latest_delivery(), late);

        let undated = vec![accepted(s, 1, None)];
        assert_eq!(group_by_supplier(&undated)[0].latest_delivery(), None);
    }

    #[test]
    fn invalid_awards_are_rejected_up_front() {
        let s = Uuid::new_v4();
        assert_matches!(
            validate_offers(&[accepted(s, 0, None)]),
            Err(ServiceError::ValidationError(_))
        );

        let mut negative = accepted(s, 5, None);
        negative.unit_price = dec!(-1);
        assert_matches!(validate_offers(&[negative]), Err(ServiceError::ValidationError(_)));

        let twice = accepted(s, 5, None);
        assert_matches!(
            validate_offers(&[twice.clone(), twice]),
            Err(ServiceError::ValidationError(_))
        );
    }

    #[test]
    fn po_numbers_are_short_and_uppercase() {
        let number = purchase_order_number(Uuid::new_v4());
        assert!(number.starts_with("PO-"));
        assert_eq!(number.len(), 15);
        assert_eq!(number, number.to_uppercase());
    }
}
