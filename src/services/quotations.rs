use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
    QueryOrder,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    audit::{self, AuditAggregate, AuditRecord, AuditSink},
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
        QuotationStatus,
    },
    services::{
        requisition_ledger::{LedgerMutation, RequisitionLedger},
        requisitions::load_requisition_aggregate,
    },
};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RegisterQuotationRequest {
    pub requisition_id: Uuid,
    pub supplier_id: Uuid,
    #[validate(length(equal = 3, message = "Currency must be 3 characters"))]
    pub currency: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct QuotationResponse {
    pub quotation_id: Uuid,
    /// Freight and handling quoted on top of the offer prices.
    pub additional_costs: Decimal,
    #[validate(length(min = 1, message = "A quotation response needs at least one offer"))]
    pub offers: Vec<OfferInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferInput {
    pub product_id: Uuid,
    pub quoted_quantity: i32,
    pub unit_price_quoted: Decimal,
    pub estimated_delivery_date: Option<NaiveDate>,
    pub conditions: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotationDetails {
    pub quotation: quotation::Model,
    pub offers: Vec<quotation_offer::Model>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotationStatusUpdate {
    pub quotation_id: Uuid,
    pub old_status: QuotationStatus,
    pub new_status: QuotationStatus,
}

/// What award propagation needs to know about one quotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotationAwardView {
    pub quotation_id: Uuid,
    pub status: QuotationStatus,
    pub offered_products: BTreeSet<Uuid>,
    /// Products of this quotation ordered on any live purchase order, this batch included.
    pub awarded_products: BTreeSet<Uuid>,
    pub referenced_by_batch: bool,
}

/// Derives quotation statuses after an award: referenced quotations become `Awarded` when
/// every offer has been accepted and `PartiallyAwarded` otherwise; open quotations left
/// without any accepted offer become `Lost`.
pub fn derive_award_statuses(views: &[QuotationAwardView]) -> Vec<QuotationStatusUpdate> {
    views
        .iter()
        .filter_map(|view| {
            let next = if view.referenced_by_batch && view.status.is_open() {
                if view.offered_products.is_subset(&view.awarded_products) {
                    QuotationStatus::Awarded
                } else {
                    QuotationStatus::PartiallyAwarded
                }
            } else if matches!(
                view.status,
                QuotationStatus::Received | QuotationStatus::PartiallyAwarded
            ) && view.awarded_products.is_empty()
            {
                QuotationStatus::Lost
            } else {
                view.status
            };
            (next != view.status).then_some(QuotationStatusUpdate {
                quotation_id: view.quotation_id,
                old_status: view.status,
                new_status: next,
            })
        })
        .collect()
}

/// Recomputes and writes the quotation statuses of a requisition on `conn` after an award.
pub(crate) async fn apply_award_statuses<C: ConnectionTrait>(
    conn: &C,
    actor: &Actor,
    requisition_id: Uuid,
    referenced: &BTreeSet<Uuid>,
) -> Result<(Vec<QuotationStatusUpdate>, Vec<AuditRecord>), ServiceError> {
    let quotations = quotation::Entity::find()
        .filter(quotation::Column::RequisitionId.eq(requisition_id))
        .order_by_asc(quotation::Column::CreatedAt)
        .order_by_asc(quotation::Column::Id)
        .all(conn)
        .await?;
    let quotation_ids: Vec<Uuid> = quotations.iter().map(|q| q.id).collect();

    let offers = quotation_offer::Entity::find()
        .filter(quotation_offer::Column::QuotationId.is_in(quotation_ids))
        .all(conn)
        .await?;

    let live_orders = purchase_order::Entity::find()
        .filter(purchase_order::Column::RequisitionId.eq(requisition_id))
        .filter(
            purchase_order::Column::Status
                .is_not_in([PurchaseOrderStatus::Canceled, PurchaseOrderStatus::RejectedBySupplier]),
        )
        .all(conn)
        .await?;
    let order_quotation: BTreeMap<Uuid, Uuid> = live_orders
        .iter()
        .filter_map(|po| po.quotation_id.map(|q| (po.id, q)))
        .collect();
    let order_lines = purchase_order_line::Entity::find()
        .filter(
            purchase_order_line::Column::PurchaseOrderId
                .is_in(order_quotation.keys().copied().collect::<Vec<_>>()),
        )
        .all(conn)
        .await?;

    let mut awarded: BTreeMap<Uuid, BTreeSet<Uuid>> = BTreeMap::new();
    for line in &order_lines {
        let source = line
            .quotation_id
            .or_else(|| order_quotation.get(&line.purchase_order_id).copied());
        if let Some(quotation_id) = source {
            awarded.entry(quotation_id).or_default().insert(line.product_id);
        }
    }
    let mut offered: BTreeMap<Uuid, BTreeSet<Uuid>> = BTreeMap::new();
    for offer in &offers {
        offered.entry(offer.quotation_id).or_default().insert(offer.product_id);
    }

    let views: Vec<QuotationAwardView> = quotations
        .iter()
        .map(|q| QuotationAwardView {
            quotation_id: q.id,
            status: q.status,
            offered_products: offered.remove(&q.id).unwrap_or_default(),
            awarded_products: awarded.remove(&q.id).unwrap_or_default(),
            referenced_by_batch: referenced.contains(&q.id),
        })
        .collect();

    let updates = derive_award_statuses(&views);
    let mut records = Vec::with_capacity(updates.len());
    for update in &updates {
        let Some(current) = quotations.iter().find(|q| q.id == update.quotation_id) else {
            continue;
        };
        quotation::save_versioned(
            conn,
            current,
            quotation::ActiveModel {
                status: Set(update.new_status),
                ..Default::default()
            },
        )
        .await?;
        records.push(AuditRecord::new(
            actor,
            AuditAggregate::Quotation,
            update.quotation_id,
            "status",
            update.old_status,
            update.new_status,
        ));
    }
    Ok((updates, records))
}

/// Supplier quotations: registration, responses, rejection and reads.
#[derive(Clone)]
pub struct QuotationService {
    db: Arc<DbPool>,
    event_sender: EventSender,
    audit: Arc<dyn AuditSink>,
    master_data: Arc<dyn MasterDataLookup>,
    ledger: RequisitionLedger,
    retry: RetryPolicy,
}

impl QuotationService {
    pub fn new(
        db: Arc<DbPool>,
        event_sender: EventSender,
        audit: Arc<dyn AuditSink>,
        master_data: Arc<dyn MasterDataLookup>,
        ledger: RequisitionLedger,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            event_sender,
            audit,
            master_data,
            ledger,
            retry,
        }
    }

    /// Records that a quotation was requested from a supplier.
    #[instrument(skip(self, actor, request), fields(requisition_id = %request.requisition_id, supplier_id = %request.supplier_id))]
    pub async fn register_quotation(
        &self,
        actor: &Actor,
        request: RegisterQuotationRequest,
    ) -> Result<quotation::Model, ServiceError> {
        request.validate()?;
        require_active(self.master_data.as_ref(), ReferenceKind::Supplier, request.supplier_id)
            .await?;

        let txn = transaction::begin(&self.db).await?;
        let (requisition, _) = load_requisition_aggregate(&txn, request.requisition_id).await?;
        if !requisition.status.accepts_procurement() {
            return Err(ServiceError::InvalidStatus(format!(
                "requisition {} is {}",
                requisition.id, requisition.status
            )));
        }

        let now = Utc::now();
        let model = quotation::ActiveModel {
            id: Set(Uuid::new_v4()),
            requisition_id: Set(request.requisition_id),
            supplier_id: Set(request.supplier_id),
            status: Set(QuotationStatus::Sent),
            additional_costs: Set(Decimal::ZERO),
            currency: Set(request.currency.to_uppercase()),
            notes: Set(request.notes),
            received_at: Set(None),
            created_by: Set(actor.id),
            version: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;
        transaction::commit(txn).await?;

        info!(quotation_id = %model.id, "Quotation registered");
        self.event_sender
            .send_or_log(Event::QuotationRegistered {
                quotation_id: model.id,
                requisition_id: model.requisition_id,
                supplier_id: model.supplier_id,
            })
            .await;
        Ok(model)
    }

    /// Moves a quotation from `Sent` to `Received` with the supplier's offers. The first
    /// response on a requisition moves it from `PendingQuotation` to `Quoted`.
    #[instrument(skip(self, actor, response), fields(quotation_id = %response.quotation_id, offers = response.offers.len()))]
    pub async fn record_quotation_response(
        &self,
        actor: &Actor,
        response: QuotationResponse,
    ) -> Result<QuotationDetails, ServiceError> {
        response.validate()?;
        validate_offers(&response)?;
        require_all_active(
            self.master_data.as_ref(),
            ReferenceKind::Product,
            response.offers.iter().map(|o| o.product_id),
        )
        .await?;

        let response = &response;
        let details = retry_on_conflict(&self.retry, "record_quotation_response", move || {
            self.record_response_once(response)
        })
        .await?;
        let quotation = &details.quotation;

        audit::emit_all(
            self.audit.as_ref(),
            vec![AuditRecord::new(
                actor,
                AuditAggregate::Quotation,
                quotation.id,
                "status",
                QuotationStatus::Sent,
                QuotationStatus::Received,
            )],
        )
        .await;
        self.event_sender
            .send_or_log(Event::QuotationStatusChanged {
                quotation_id: quotation.id,
                old_status: QuotationStatus::Sent,
                new_status: QuotationStatus::Received,
            })
            .await;

        self.ledger
            .apply(
                actor,
                quotation.requisition_id,
                LedgerMutation::QuotationReceived {
                    quotation_id: quotation.id,
                },
            )
            .await?;

        Ok(details)
    }

    async fn record_response_once(
        &self,
        response: &QuotationResponse,
    ) -> Result<QuotationDetails, ServiceError> {
        let txn = transaction::begin(&self.db).await?;
        let current = quotation::Entity::find_by_id(response.quotation_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Quotation {} not found", response.quotation_id))
            })?;
        if current.status != QuotationStatus::Sent {
            return Err(ServiceError::InvalidStatus(format!(
                "quotation {} is {}; only Sent quotations accept a response",
                current.id, current.status
            )));
        }

        let (requisition, lines) = load_requisition_aggregate(&txn, current.requisition_id).await?;
        if !requisition.status.accepts_procurement() {
            return Err(ServiceError::InvalidStatus(format!(
                "requisition {} is {}",
                requisition.id, requisition.status
            )));
        }
        let required: HashSet<Uuid> = lines.iter().map(|l| l.product_id).collect();
        if let Some(offer) = response.offers.iter().find(|o| !required.contains(&o.product_id)) {
            return Err(ServiceError::ValidationError(format!(
                "product {} is not required by requisition {}",
                offer.product_id, requisition.id
            )));
        }

        let now = Utc::now();
        let version = quotation::save_versioned(
            &txn,
            &current,
            quotation::ActiveModel {
                status: Set(QuotationStatus::Received),
                additional_costs: Set(response.additional_costs),
                received_at: Set(Some(now)),
                ..Default::default()
            },
        )
        .await?;

        let mut offers = Vec::with_capacity(response.offers.len());
        for input in &response.offers {
            let offer = quotation_offer::ActiveModel {
                id: Set(Uuid::new_v4()),
                quotation_id: Set(current.id),
                product_id: Set(input.product_id),
                quoted_quantity: Set(input.quoted_quantity),
                unit_price_quoted: Set(input.unit_price_quoted),
                estimated_delivery_date: Set(input.estimated_delivery_date),
                conditions: Set(input.conditions.clone()),
                created_at: Set(now),
            }
            .insert(&txn)
            .await?;
            offers.push(offer);
        }
        transaction::commit(txn).await?;

        Ok(QuotationDetails {
            quotation: quotation::Model {
                status: QuotationStatus::Received,
                additional_costs: response.additional_costs,
                received_at: Some(now),
                version,
                updated_at: now,
                ..current
            },
            offers,
        })
    }

    /// Declines a quotation outright. Only `Sent` and `Received` quotations can be rejected.
    #[instrument(skip(self, actor), fields(quotation_id = %quotation_id))]
    pub async fn reject_quotation(
        &self,
        actor: &Actor,
        quotation_id: Uuid,
    ) -> Result<quotation::Model, ServiceError> {
        let (model, old_status) = retry_on_conflict(&self.retry, "reject_quotation", move || {
            self.reject_once(quotation_id)
        })
        .await?;

        audit::emit_all(
            self.audit.as_ref(),
            vec![AuditRecord::new(
                actor,
                AuditAggregate::Quotation,
                quotation_id,
                "status",
                old_status,
                model.status,
            )],
        )
        .await;
        self.event_sender
            .send_or_log(Event::QuotationStatusChanged {
                quotation_id,
                old_status,
                new_status: model.status,
            })
            .await;
        Ok(model)
    }

    async fn reject_once(
        &self,
        quotation_id: Uuid,
    ) -> Result<(quotation::Model, QuotationStatus), ServiceError> {
        let txn = transaction::begin(&self.db).await?;
        let current = quotation::Entity::find_by_id(quotation_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Quotation {} not found", quotation_id)))?;
        if !matches!(current.status, QuotationStatus::Sent | QuotationStatus::Received) {
            warn!(quotation_id = %quotation_id, status = %current.status, "Rejected quotation in non-rejectable status");
            return Err(ServiceError::InvalidStatus(format!(
                "quotation {} is {} and can no longer be rejected",
                quotation_id, current.status
            )));
        }
        let version = quotation::save_versioned(
            &txn,
            &current,
            quotation::ActiveModel {
                status: Set(QuotationStatus::Rejected),
                ..Default::default()
            },
        )
        .await?;
        transaction::commit(txn).await?;

        let old_status = current.status;
        Ok((
            quotation::Model {
                status: QuotationStatus::Rejected,
                version,
                updated_at: Utc::now(),
                ..current
            },
            old_status,
        ))
    }

    #[instrument(skip(self))]
    pub async fn get_quotation(&self, quotation_id: Uuid) -> Result<QuotationDetails, ServiceError> {
        let db = self.db.as_ref();
        let quotation = quotation::Entity::find_by_id(quotation_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Quotation {} not found", quotation_id)))?;
        let offers = quotation_offer::Entity::find()
            .filter(quotation_offer::Column::QuotationId.eq(quotation_id))
            .order_by_asc(quotation_offer::Column::CreatedAt)
            .order_by_asc(quotation_offer::Column::Id)
            .all(db)
            .await?;
        Ok(QuotationDetails { quotation, offers })
    }

    #[instrument(skip(self))]
    pub async fn list_quotations(
        &self,
        requisition_id: Uuid,
    ) -> Result<Vec<quotation::Model>, ServiceError> {
        Ok(quotation::Entity::find()
            .filter(quotation::Column::RequisitionId.eq(requisition_id))
            .order_by_asc(quotation::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?)
    }
}

fn validate_offers(response: &QuotationResponse) -> Result<(), ServiceError> {
    if response.additional_costs < Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "additional costs must not be negative".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for offer in &response.offers {
        if offer.quoted_quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "quoted quantity for product {} must be positive",
                offer.product_id
            )));
        }
        if offer.unit_price_quoted < Decimal::ZERO {
            return Err(ServiceError::ValidationError(format!(
                "quoted price for product {} must not be negative",
                offer.product_id
            )));
        }
        if !seen.insert(offer.product_id) {
            return Err(ServiceError::ValidationError(format!(
                "product {} is offered more than once",
                offer.product_id
            )));
        }
    }
    Ok(())
}
