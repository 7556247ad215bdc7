//! Requisition counter reconciliation.
//!
//! `pending_po_quantity` is the promise counter and `purchased_quantity` the fulfillment
//! counter of a required product line. Every change to either goes through a
//! [`LedgerMutation`]: the arithmetic lives in [`compute`], which is pure, and
//! [`RequisitionLedger`] applies the result inside one version-checked requisition
//! transaction that also journals the mutation key, so a replayed step is a no-op.

use chrono::Utc;
use metrics::counter;
use sea_orm::{ActiveModelTrait, ActiveValue::Set, ConnectionTrait, EntityTrait};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    audit::{self, AuditAggregate, AuditRecord, AuditSink},
    auth::Actor,
    db::{
        transaction::{self, retry_on_conflict, RetryPolicy},
        DbPool,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    models::{
        ledger_entry, purchase_order_line, required_product_line, requisition, RequisitionStatus,
    },
    services::requisitions::load_requisition_aggregate,
};

/// A quantity of one product. Signed where the mutation allows negative deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductQuantity {
    pub product_id: Uuid,
    pub quantity: i32,
}

/// Receiving counters of one purchase order line as seen by the requisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoLineQuantities {
    pub product_id: Uuid,
    pub ordered: i32,
    pub received: i32,
    pub damaged: i32,
    pub missing: i32,
}

impl PoLineQuantities {
    pub fn net_outstanding(&self) -> i32 {
        self.ordered
            .saturating_sub(self.received)
            .saturating_sub(self.damaged)
            .saturating_sub(self.missing)
    }
}

/// Adds `delta` to a quantity of `product_id`, refusing results outside `i32`.
pub(crate) fn add_quantity(product_id: Uuid, current: i32, delta: i32) -> Result<i32, ServiceError> {
    current.checked_add(delta).ok_or_else(|| {
        ServiceError::ConsistencyViolation(format!(
            "quantity of product {} overflows ({} + {})",
            product_id, current, delta
        ))
    })
}

impl From<&purchase_order_line::Model> for PoLineQuantities {
    fn from(line: &purchase_order_line::Model) -> Self {
        Self {
            product_id: line.product_id,
            ordered: line.ordered_quantity,
            received: line.received_quantity,
            damaged: line.received_damaged_quantity,
            missing: line.received_missing_quantity,
        }
    }
}

/// One reconciliation step against a requisition's counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LedgerMutation {
    /// A first supplier response arrived.
    QuotationReceived { quotation_id: Uuid },
    /// Accepted offers were turned into purchase orders.
    AwardCommitted {
        award_batch_id: Uuid,
        awards: Vec<ProductQuantity>,
    },
    /// Ordered quantities of a not-yet-confirmed purchase order were edited.
    PurchaseOrderAmended {
        purchase_order_id: Uuid,
        revision: i32,
        deltas: Vec<ProductQuantity>,
    },
    PurchaseOrderConfirmed {
        purchase_order_id: Uuid,
        lines: Vec<PoLineQuantities>,
    },
    /// Good quantity received on an already-confirmed purchase order.
    ReceiptCredited {
        purchase_order_id: Uuid,
        receipt_event_id: Uuid,
        credits: Vec<ProductQuantity>,
    },
    /// The purchase order was canceled or rejected.
    PurchaseOrderReversed {
        purchase_order_id: Uuid,
        reached_confirmation: bool,
        lines: Vec<PoLineQuantities>,
    },
}

impl LedgerMutation {
    /// Journal key; identical steps share it.
    pub fn key(&self) -> String {
        match self {
            Self::QuotationReceived { quotation_id } => format!("quoted:{}", quotation_id),
            Self::AwardCommitted { award_batch_id, .. } => format!("award:{}", award_batch_id),
            Self::PurchaseOrderAmended {
                purchase_order_id,
                revision,
                ..
            } => format!("amend:{}:{}", purchase_order_id, revision),
            Self::PurchaseOrderConfirmed {
                purchase_order_id, ..
            } => format!("confirm:{}", purchase_order_id),
            Self::ReceiptCredited {
                receipt_event_id, ..
            } => format!("receipt:{}", receipt_event_id),
            Self::PurchaseOrderReversed {
                purchase_order_id, ..
            } => format!("reverse:{}", purchase_order_id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::QuotationReceived { .. } => "quotation_received",
            Self::AwardCommitted { .. } => "award_committed",
            Self::PurchaseOrderAmended { .. } => "purchase_order_amended",
            Self::PurchaseOrderConfirmed { .. } => "purchase_order_confirmed",
            Self::ReceiptCredited { .. } => "receipt_credited",
            Self::PurchaseOrderReversed { .. } => "purchase_order_reversed",
        }
    }
}

/// Working copy of one required product line's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineCounters {
    pub line_id: Uuid,
    pub product_id: Uuid,
    pub required: i32,
    pub purchased: i32,
    pub pending: i32,
}

impl LineCounters {
    pub fn is_satisfied(&self) -> bool {
        self.purchased >= self.required
    }
}

impl From<&required_product_line::Model> for LineCounters {
    fn from(line: &required_product_line::Model) -> Self {
        Self {
            line_id: line.id,
            product_id: line.product_id,
            required: line.required_quantity,
            purchased: line.purchased_quantity,
            pending: line.pending_po_quantity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum CounterField {
    #[strum(serialize = "purchased_quantity")]
    PurchasedQuantity,
    #[strum(serialize = "pending_po_quantity")]
    PendingPoQuantity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterChange {
    pub line_id: Uuid,
    pub product_id: Uuid,
    pub field: CounterField,
    pub before: i32,
    pub after: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerComputation {
    pub lines: Vec<LineCounters>,
    pub status: RequisitionStatus,
    pub changes: Vec<CounterChange>,
}

fn line_for_product(
    lines: &mut [LineCounters],
    product_id: Uuid,
) -> Result<&mut LineCounters, ServiceError> {
    lines
        .iter_mut()
        .find(|l| l.product_id == product_id)
        .ok_or_else(|| {
            ServiceError::ValidationError(format!(
                "product {} is not required by this requisition",
                product_id
            ))
        })
}

fn all_satisfied(lines: &[LineCounters]) -> bool {
    lines.iter().all(LineCounters::is_satisfied)
}

/// Applies `mutation` to a copy of the counters and derives the requisition status.
pub fn compute(
    mutation: &LedgerMutation,
    current: &[LineCounters],
    status: RequisitionStatus,
) -> Result<LedgerComputation, ServiceError> {
    let mut lines = current.to_vec();
    let mut next_status = status;

    match mutation {
        LedgerMutation::QuotationReceived { .. } => {
            if status == RequisitionStatus::PendingQuotation {
                next_status = RequisitionStatus::Quoted;
            }
        }
        LedgerMutation::AwardCommitted { awards, .. } => {
            if !status.accepts_procurement() {
                return Err(ServiceError::InvalidStatus(format!(
                    "requisition is {}; awards are not accepted",
                    status
                )));
            }
            let mut awarded = false;
            for award in awards {
                if award.quantity <= 0 {
                    return Err(ServiceError::ValidationError(format!(
                        "awarded quantity for product {} must be positive",
                        award.product_id
                    )));
                }
                let line = line_for_product(&mut lines, award.product_id)?;
                line.pending = add_quantity(award.product_id, line.pending, award.quantity)?;
                awarded = true;
            }
            if awarded
                && !all_satisfied(&lines)
                && matches!(
                    status,
                    RequisitionStatus::PendingQuotation
                        | RequisitionStatus::Quoted
                        | RequisitionStatus::POInProgress
                )
            {
                next_status = RequisitionStatus::POInProgress;
            }
        }
        LedgerMutation::PurchaseOrderAmended { deltas, .. } => {
            for delta in deltas {
                let line = line_for_product(&mut lines, delta.product_id)?;
                line.pending = add_quantity(delta.product_id, line.pending, delta.quantity)?.max(0);
            }
        }
        LedgerMutation::PurchaseOrderConfirmed { lines: po_lines, .. } => {
            for po_line in po_lines {
                let line = line_for_product(&mut lines, po_line.product_id)?;
                line.purchased = add_quantity(po_line.product_id, line.purchased, po_line.received)?;
                line.pending = (line.pending - po_line.ordered).max(0);
            }
            if all_satisfied(&lines) && status != RequisitionStatus::Canceled {
                next_status = RequisitionStatus::Completed;
            }
        }
        LedgerMutation::ReceiptCredited { credits, .. } => {
            for credit in credits {
                if credit.quantity < 0 {
                    return Err(ServiceError::ValidationError(format!(
                        "received quantity for product {} must not be negative",
                        credit.product_id
                    )));
                }
                let line = line_for_product(&mut lines, credit.product_id)?;
                line.purchased = add_quantity(credit.product_id, line.purchased, credit.quantity)?;
            }
            if all_satisfied(&lines) && status != RequisitionStatus::Canceled {
                next_status = RequisitionStatus::Completed;
            }
        }
        LedgerMutation::PurchaseOrderReversed {
            reached_confirmation,
            lines: po_lines,
            ..
        } => {
            for po_line in po_lines {
                let line = line_for_product(&mut lines, po_line.product_id)?;
                if *reached_confirmation {
                    line.purchased = (line.purchased - po_line.received).max(0);
                    line.pending = add_quantity(
                        po_line.product_id,
                        line.pending,
                        po_line.net_outstanding().max(0),
                    )?;
                } else {
                    line.pending = (line.pending - po_line.ordered).max(0);
                }
            }
            if !all_satisfied(&lines)
                && matches!(
                    status,
                    RequisitionStatus::Completed | RequisitionStatus::POInProgress
                )
            {
                next_status = RequisitionStatus::Quoted;
            }
        }
    }

    if let Some(line) = lines.iter().find(|l| l.purchased < 0 || l.pending < 0) {
        return Err(ServiceError::ConsistencyViolation(format!(
            "counters of product {} would become negative (purchased={}, pending={})",
            line.product_id, line.purchased, line.pending
        )));
    }

    let mut changes = Vec::new();
    for (before, after) in current.iter().zip(lines.iter()) {
        if before.purchased != after.purchased {
            changes.push(CounterChange {
                line_id: after.line_id,
                product_id: after.product_id,
                field: CounterField::PurchasedQuantity,
                before: before.purchased,
                after: after.purchased,
            });
        }
        if before.pending != after.pending {
            changes.push(CounterChange {
                line_id: after.line_id,
                product_id: after.product_id,
                field: CounterField::PendingPoQuantity,
                before: before.pending,
                after: after.pending,
            });
        }
    }

    Ok(LedgerComputation {
        lines,
        status: next_status,
        changes,
    })
}

/// Result of applying (or replaying) one ledger mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerOutcome {
    pub requisition_id: Uuid,
    pub key: String,
    /// False when the key was already journaled and nothing changed.
    pub applied: bool,
    pub status_before: RequisitionStatus,
    pub status_after: RequisitionStatus,
    pub changes: Vec<CounterChange>,
}

/// A committed-or-about-to-commit ledger application and the audit trail it owes.
#[derive(Debug, Clone)]
pub(crate) struct StagedLedger {
    pub kind: &'static str,
    pub outcome: LedgerOutcome,
    pub audit: Vec<AuditRecord>,
}

/// Applies `mutation` on `conn`, which must be a transaction the caller commits.
pub(crate) async fn apply_in_txn<C: ConnectionTrait>(
    conn: &C,
    actor: &Actor,
    requisition_id: Uuid,
    mutation: &LedgerMutation,
) -> Result<StagedLedger, ServiceError> {
    let key = mutation.key();
    let (header, line_models) = load_requisition_aggregate(conn, requisition_id).await?;

    if ledger_entry::Entity::find_by_id(key.clone())
        .one(conn)
        .await?
        .is_some()
    {
        return Ok(StagedLedger {
            kind: mutation.kind(),
            outcome: LedgerOutcome {
                requisition_id,
                key,
                applied: false,
                status_before: header.status,
                status_after: header.status,
                changes: Vec::new(),
            },
            audit: Vec::new(),
        });
    }

    let counters: Vec<LineCounters> = line_models.iter().map(LineCounters::from).collect();
    let computed = compute(mutation, &counters, header.status)?;

    requisition::save_versioned(
        conn,
        &header,
        requisition::ActiveModel {
            status: Set(computed.status),
            ..Default::default()
        },
    )
    .await?;

    let now = Utc::now();
    for (model, next) in line_models.iter().zip(computed.lines.iter()) {
        if model.purchased_quantity == next.purchased && model.pending_po_quantity == next.pending
        {
            continue;
        }
        let mut active: required_product_line::ActiveModel = model.clone().into();
        active.purchased_quantity = Set(next.purchased);
        active.pending_po_quantity = Set(next.pending);
        active.updated_at = Set(now);
        active.update(conn).await?;
    }

    ledger_entry::ActiveModel {
        key: Set(key.clone()),
        requisition_id: Set(requisition_id),
        kind: Set(mutation.kind().to_string()),
        changes: Set(serde_json::to_value(&computed.changes)?),
        applied_by: Set(actor.id),
        applied_at: Set(now),
    }
    .insert(conn)
    .await?;

    let mut records: Vec<AuditRecord> = computed
        .changes
        .iter()
        .map(|c| {
            AuditRecord::new(
                actor,
                AuditAggregate::RequiredProductLine,
                c.line_id,
                c.field.to_string(),
                c.before,
                c.after,
            )
        })
        .collect();
    if computed.status != header.status {
        records.push(AuditRecord::new(
            actor,
            AuditAggregate::Requisition,
            requisition_id,
            "status",
            header.status,
            computed.status,
        ));
    }

    Ok(StagedLedger {
        kind: mutation.kind(),
        outcome: LedgerOutcome {
            requisition_id,
            key,
            applied: true,
            status_before: header.status,
            status_after: computed.status,
            changes: computed.changes,
        },
        audit: records,
    })
}

/// Applies ledger mutations in their own requisition-scoped transactions.
#[derive(Clone)]
pub struct RequisitionLedger {
    db: Arc<DbPool>,
    event_sender: EventSender,
    audit: Arc<dyn AuditSink>,
    retry: RetryPolicy,
}

impl RequisitionLedger {
    pub fn new(
        db: Arc<DbPool>,
        event_sender: EventSender,
        audit: Arc<dyn AuditSink>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            event_sender,
            audit,
            retry,
        }
    }

    /// Applies one mutation, retrying on version conflicts. Replays of an already
    /// journaled mutation return `applied == false` and change nothing.
    #[instrument(skip(self, actor, mutation), fields(requisition_id = %requisition_id, kind = mutation.kind()))]
    pub async fn apply(
        &self,
        actor: &Actor,
        requisition_id: Uuid,
        mutation: LedgerMutation,
    ) -> Result<LedgerOutcome, ServiceError> {
        let mutation = &mutation;
        let staged = retry_on_conflict(&self.retry, mutation.kind(), move || {
            self.apply_once(actor, requisition_id, mutation)
        })
        .await?;

        self.publish(staged.clone()).await;
        Ok(staged.outcome)
    }

    async fn apply_once(
        &self,
        actor: &Actor,
        requisition_id: Uuid,
        mutation: &LedgerMutation,
    ) -> Result<StagedLedger, ServiceError> {
        let txn = transaction::begin(&self.db).await?;
        let staged = apply_in_txn(&txn, actor, requisition_id, mutation).await?;
        transaction::commit(txn).await?;
        Ok(staged)
    }

    /// Emits the audit records and status event of a committed application.
    pub(crate) async fn publish(&self, staged: StagedLedger) {
        let outcome = staged.outcome;
        if outcome.applied {
            counter!("stateset_procurement.ledger.applied", 1, "kind" => staged.kind);
            info!(
                requisition_id = %outcome.requisition_id,
                key = %outcome.key,
                changes = outcome.changes.len(),
                status = %outcome.status_after,
                "Requisition counters reconciled"
            );
        } else {
            info!(requisition_id = %outcome.requisition_id, key = %outcome.key, "Ledger step already applied");
        }

        if outcome.status_before != outcome.status_after {
            self.event_sender
                .send_or_log(Event::RequisitionStatusChanged {
                    requisition_id: outcome.requisition_id,
                    old_status: outcome.status_before,
                    new_status: outcome.status_after,
                })
                .await;
        }
        audit::emit_all(self.audit.as_ref(), staged.audit).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn counters(required: i32, purchased: i32, pending: i32) -> LineCounters {
        LineCounters {
            line_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            required,
            purchased,
            pending,
        }
    }

    fn po_line(product_id: Uuid, ordered: i32, received: i32, damaged: i32, missing: i32) -> PoLineQuantities {
        PoLineQuantities {
            product_id,
            ordered,
            received,
            damaged,
            missing,
        }
    }

    #[test]
    fn award_raises_pending_and_moves_to_in_progress() {
        let line = counters(100, 0, 0);
        let result = compute(
            &LedgerMutation::AwardCommitted {
                award_batch_id: Uuid::new_v4(),
                awards: vec![ProductQuantity {
                    product_id: line.product_id,
                    quantity: 60,
                }],
            },
            &[line],
            RequisitionStatus::Quoted,
        )
        .unwrap();

        assert_eq!(result.lines[0].pending, 60);
        assert_eq!(result.status, RequisitionStatus::POInProgress);
        assert_eq!(result.changes.len(), 1);
        assert_eq!(result.changes[0].field, CounterField::PendingPoQuantity);
    }

    #[test]
    fn award_for_unknown_product_is_rejected() {
        let result = compute(
            &LedgerMutation::AwardCommitted {
                award_batch_id: Uuid::new_v4(),
                awards: vec![ProductQuantity {
                    product_id: Uuid::new_v4(),
                    quantity: 5,
                }],
            },
            &[counters(10, 0, 0)],
            RequisitionStatus::Quoted,
        );
        assert_matches!(result, Err(ServiceError::ValidationError(_)));
    }

    #[test]
    fn award_on_canceled_requisition_is_rejected() {
        let line = counters(10, 0, 0);
        let result = compute(
            &LedgerMutation::AwardCommitted {
                award_batch_id: Uuid::new_v4(),
                awards: vec![ProductQuantity {
                    product_id: line.product_id,
                    quantity: 5,
                }],
            },
            &[line],
            RequisitionStatus::Canceled,
        );
        assert_matches!(result, Err(ServiceError::InvalidStatus(_)));
    }

    #[test]
    fn confirmation_moves_promise_to_fulfillment() {
        let line = counters(100, 0, 60);
        let result = compute(
            &LedgerMutation::PurchaseOrderConfirmed {
                purchase_order_id: Uuid::new_v4(),
                lines: vec![po_line(line.product_id, 60, 0, 0, 0)],
            },
            &[line],
            RequisitionStatus::POInProgress,
        )
        .unwrap();

        assert_eq!(result.lines[0].purchased, 0);
        assert_eq!(result.lines[0].pending, 0);
        assert_eq!(result.status, RequisitionStatus::POInProgress);
    }

    #[test]
    fn confirmation_completes_when_every_line_is_fulfilled() {
        let line = counters(10, 0, 10);
        let result = compute(
            &LedgerMutation::PurchaseOrderConfirmed {
                purchase_order_id: Uuid::new_v4(),
                lines: vec![po_line(line.product_id, 10, 10, 0, 0)],
            },
            &[line],
            RequisitionStatus::POInProgress,
        )
        .unwrap();
        assert_eq!(result.lines[0].purchased, 10);
        assert_eq!(result.status, RequisitionStatus::Completed);
    }

    #[test]
    fn pending_never_goes_negative() {
        let line = counters(10, 0, 3);
        let result = compute(
            &LedgerMutation::PurchaseOrderReversed {
                purchase_order_id: Uuid::new_v4(),
                reached_confirmation: false,
                lines: vec![po_line(line.product_id, 10, 0, 0, 0)],
            },
            &[line],
            RequisitionStatus::POInProgress,
        )
        .unwrap();
        assert_eq!(result.lines[0].pending, 0);
        assert_eq!(result.status, RequisitionStatus::Quoted);
    }

    #[test]
    fn post_confirmation_reversal_restores_outstanding_promise() {
        let line = counters(100, 60, 0);
        let result = compute(
            &LedgerMutation::PurchaseOrderReversed {
                purchase_order_id: Uuid::new_v4(),
                reached_confirmation: true,
                lines: vec![po_line(line.product_id, 100, 60, 5, 5)],
            },
            &[line],
            RequisitionStatus::POInProgress,
        )
        .unwrap();
        assert_eq!(result.lines[0].purchased, 0);
        assert_eq!(result.lines[0].pending, 30);
        assert_eq!(result.status, RequisitionStatus::Quoted);
    }

    #[test]
    fn reversal_leaves_unrelated_statuses_alone() {
        let line = counters(10, 0, 10);
        let result = compute(
            &LedgerMutation::PurchaseOrderReversed {
                purchase_order_id: Uuid::new_v4(),
                reached_confirmation: false,
                lines: vec![po_line(line.product_id, 10, 0, 0, 0)],
            },
            &[line],
            RequisitionStatus::Canceled,
        )
        .unwrap();
        assert_eq!(result.status, RequisitionStatus::Canceled);
    }

    #[test]
    fn first_quotation_moves_requisition_to_quoted() {
        let mutation = LedgerMutation::QuotationReceived {
            quotation_id: Uuid::new_v4(),
        };
        let from_pending = compute(&mutation, &[counters(1, 0, 0)], RequisitionStatus::PendingQuotation).unwrap();
        assert_eq!(from_pending.status, RequisitionStatus::Quoted);
        let from_progress = compute(&mutation, &[counters(1, 0, 1)], RequisitionStatus::POInProgress).unwrap();
        assert_eq!(from_progress.status, RequisitionStatus::POInProgress);
        assert!(from_progress.changes.is_empty());
    }

    #[test]
    fn amendment_deltas_are_floored() {
        let line = counters(10, 0, 4);
        let result = compute(
            &LedgerMutation::PurchaseOrderAmended {
                purchase_order_id: Uuid::new_v4(),
                revision: 2,
                deltas: vec![ProductQuantity {
                    product_id: line.product_id,
                    quantity: -6,
                }],
            },
            &[line],
            RequisitionStatus::POInProgress,
        )
        .unwrap();
        assert_eq!(result.lines[0].pending, 0);
    }

    #[test]
    fn counter_overflow_is_a_consistency_violation() {
        let line = counters(100, i32::MAX - 10, i32::MAX - 5);
        let credit = compute(
            &LedgerMutation::ReceiptCredited {
                purchase_order_id: Uuid::new_v4(),
                receipt_event_id: Uuid::new_v4(),
                credits: vec![ProductQuantity {
                    product_id: line.product_id,
                    quantity: 20,
                }],
            },
            &[line],
            RequisitionStatus::POInProgress,
        );
        assert_matches!(credit, Err(ServiceError::ConsistencyViolation(_)));

        let award = compute(
            &LedgerMutation::AwardCommitted {
                award_batch_id: Uuid::new_v4(),
                awards: vec![ProductQuantity {
                    product_id: line.product_id,
                    quantity: i32::MAX,
                }],
            },
            &[line],
            RequisitionStatus::POInProgress,
        );
        assert_matches!(award, Err(ServiceError::ConsistencyViolation(_)));
    }

    #[test]
    fn keys_identify_the_step() {
        let po = Uuid::new_v4();
        let confirm = LedgerMutation::PurchaseOrderConfirmed {
            purchase_order_id: po,
            lines: vec![],
        };
        let reverse = LedgerMutation::PurchaseOrderReversed {
            purchase_order_id: po,
            reached_confirmation: true,
            lines: vec![],
        };
        assert_eq!(confirm.key(), format!("confirm:{}", po));
        assert_ne!(confirm.key(), reverse.key());
        assert_eq!(reverse.kind(), "purchase_order_reversed");
    }
}
