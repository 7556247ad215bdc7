//! Receipt reconciliation.
//!
//! A receipt event applies (ok, damaged, missing) deltas to purchase order lines, writes
//! the physical quantities to the stock ledger and derives the order's receiving status.
//! The caller-supplied event id makes the whole step idempotent.

use chrono::Utc;
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, EntityTrait, QueryFilter, QueryOrder,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{info, instrument, warn};
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
    integrations::{
        master_data::require_active, MasterDataLookup, ReferenceKind, StockCondition,
        StockDeltaOutcome, StockLedger,
    },
    models::{
        purchase_order,
        purchase_order_line::{self, LineQuantities, ReceiptDelta},
        receipt_event::{self, RecordedReceiptLine},
        PurchaseOrderStatus,
    },
    services::requisition_ledger::{
        add_quantity, LedgerMutation, LedgerOutcome, ProductQuantity, RequisitionLedger,
    },
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptEventRequest {
    /// Idempotency key; re-sending the same event returns the recorded outcome.
    pub event_id: Uuid,
    pub purchase_order_id: Uuid,
    pub warehouse_id: Uuid,
    pub lines: Vec<ReceiptLineInput>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReceiptLineInput {
    pub purchase_order_line_id: Uuid,
    pub ok: i32,
    pub damaged: i32,
    pub missing: i32,
}

impl ReceiptLineInput {
    fn delta(&self) -> ReceiptDelta {
        ReceiptDelta {
            ok: self.ok,
            damaged: self.damaged,
            missing: self.missing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub product_id: Uuid,
    pub condition: StockCondition,
    pub quantity: i32,
    pub outcome: StockDeltaOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptOutcome {
    pub receipt_event_id: Uuid,
    pub purchase_order_id: Uuid,
    pub status_before: PurchaseOrderStatus,
    pub status_after: PurchaseOrderStatus,
    /// True when the event id had already been applied and nothing changed.
    pub replayed: bool,
    pub lines: Vec<RecordedReceiptLine>,
    pub stock_movements: Vec<StockMovement>,
    /// Fulfillment credited to the requisition for the good quantity received.
    pub ledger: Option<LedgerOutcome>,
}

/// Receiving status implied by the accumulated line quantities.
///
/// Any line short of its ordered quantity keeps the order partially delivered; otherwise
/// it is fully received unless something went missing, which completes it as is.
pub fn derive_receipt_status(lines: &[LineQuantities]) -> PurchaseOrderStatus {
    if lines.is_empty() {
        return PurchaseOrderStatus::Completed;
    }
    if lines.iter().any(|l| l.accounted() < l.ordered) {
        PurchaseOrderStatus::PartiallyDelivered
    } else if lines.iter().all(|l| l.missing == 0) {
        PurchaseOrderStatus::FullyReceived
    } else {
        PurchaseOrderStatus::Completed
    }
}

fn validate_request(request: &ReceiptEventRequest) -> Result<(), ServiceError> {
    let mut seen = HashSet::new();
    for line in &request.lines {
        if line.ok < 0 || line.damaged < 0 || line.missing < 0 {
            return Err(ServiceError::ValidationError(format!(
                "receipt quantities for line {} must be non-negative",
                line.purchase_order_line_id
            )));
        }
        if !seen.insert(line.purchase_order_line_id) {
            return Err(ServiceError::ValidationError(format!(
                "line {} appears more than once in receipt {}",
                line.purchase_order_line_id, request.event_id
            )));
        }
    }
    Ok(())
}

fn good_quantity_credits(lines: &[RecordedReceiptLine]) -> Result<Vec<ProductQuantity>, ServiceError> {
    let mut by_product: BTreeMap<Uuid, i32> = BTreeMap::new();
    for line in lines {
        if line.delta.ok > 0 {
            let total = by_product.entry(line.product_id).or_default();
            *total = add_quantity(line.product_id, *total, line.delta.ok)?;
        }
    }
    Ok(by_product
        .into_iter()
        .map(|(product_id, quantity)| ProductQuantity {
            product_id,
            quantity,
        })
        .collect())
}

struct CommittedReceipt {
    outcome: ReceiptOutcome,
    requisition_id: Uuid,
    reached_confirmation: bool,
    audit: Vec<AuditRecord>,
}

#[derive(Clone)]
pub struct ReceiptService {
    db: Arc<DbPool>,
    event_sender: EventSender,
    audit: Arc<dyn AuditSink>,
    master_data: Arc<dyn MasterDataLookup>,
    stock_ledger: Arc<dyn StockLedger>,
    ledger: RequisitionLedger,
    retry: RetryPolicy,
}

impl ReceiptService {
    pub fn new(
        db: Arc<DbPool>,
        event_sender: EventSender,
        audit: Arc<dyn AuditSink>,
        master_data: Arc<dyn MasterDataLookup>,
        stock_ledger: Arc<dyn StockLedger>,
        ledger: RequisitionLedger,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            event_sender,
            audit,
            master_data,
            stock_ledger,
            ledger,
            retry,
        }
    }

    /// Applies one receiving event. Re-sending an event id that was already applied
    /// returns the recorded outcome with `replayed == true` and credits nothing twice.
    #[instrument(skip(self, actor, request), fields(receipt_event_id = %request.event_id, purchase_order_id = %request.purchase_order_id))]
    pub async fn apply_receipt(
        &self,
        actor: &Actor,
        request: ReceiptEventRequest,
    ) -> Result<ReceiptOutcome, ServiceError> {
        validate_request(&request)?;
        require_active(self.master_data.as_ref(), ReferenceKind::Warehouse, request.warehouse_id)
            .await?;

        let request_ref = &request;
        let committed = retry_on_conflict(&self.retry, "apply_receipt", move || {
            self.apply_once(actor, request_ref)
        })
        .await?;
        let mut outcome = committed.outcome;

        if !outcome.replayed {
            counter!("stateset_procurement.receipts.applied", 1);
            info!(
                status_before = %outcome.status_before,
                status_after = %outcome.status_after,
                lines = outcome.lines.len(),
                "Receipt applied"
            );
            audit::emit_all(self.audit.as_ref(), committed.audit).await;
            self.event_sender
                .send_or_log(Event::ReceiptApplied {
                    receipt_event_id: outcome.receipt_event_id,
                    purchase_order_id: outcome.purchase_order_id,
                    status: outcome.status_after,
                })
                .await;
            if outcome.status_before != outcome.status_after {
                self.event_sender
                    .send_or_log(Event::PurchaseOrderStatusChanged {
                        purchase_order_id: outcome.purchase_order_id,
                        old_status: outcome.status_before,
                        new_status: outcome.status_after,
                    })
                    .await;
            }
        } else {
            info!("Receipt event already applied");
        }

        let credits = good_quantity_credits(&outcome.lines)?;
        if committed.reached_confirmation && !credits.is_empty() {
            outcome.ledger = Some(
                self.ledger
                    .apply(
                        actor,
                        committed.requisition_id,
                        LedgerMutation::ReceiptCredited {
                            purchase_order_id: outcome.purchase_order_id,
                            receipt_event_id: outcome.receipt_event_id,
                            credits,
                        },
                    )
                    .await?,
            );
        }
        Ok(outcome)
    }

    async fn apply_once(
        &self,
        actor: &Actor,
        request: &ReceiptEventRequest,
    ) -> Result<CommittedReceipt, ServiceError> {
        let txn = transaction::begin(&self.db).await?;

        let order = purchase_order::Entity::find_by_id(request.purchase_order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "Purchase order {} not found",
                    request.purchase_order_id
                ))
            })?;

        if let Some(recorded) = receipt_event::Entity::find_by_id(request.event_id)
            .one(&txn)
            .await?
        {
            return Self::replay(recorded, &order);
        }

        let lines = purchase_order_line::Entity::find()
            .filter(purchase_order_line::Column::PurchaseOrderId.eq(order.id))
            .order_by_asc(purchase_order_line::Column::LineNumber)
            .all(&txn)
            .await?;

        let nothing_reported = request.lines.iter().all(|l| l.delta().is_empty());
        if !order.status.accepts_receipts() {
            if order.status == PurchaseOrderStatus::FullyReceived && nothing_reported {
                return Ok(CommittedReceipt {
                    outcome: ReceiptOutcome {
                        receipt_event_id: request.event_id,
                        purchase_order_id: order.id,
                        status_before: order.status,
                        status_after: order.status,
                        replayed: false,
                        lines: Vec::new(),
                        stock_movements: Vec::new(),
                        ledger: None,
                    },
                    requisition_id: order.requisition_id,
                    reached_confirmation: false,
                    audit: Vec::new(),
                });
            }
            return Err(ServiceError::InvalidStatus(format!(
                "purchase order {} is {} and does not accept receipts",
                order.id, order.status
            )));
        }

        let now = Utc::now();
        let mut recorded = Vec::new();
        let mut audit_records = Vec::new();
        let mut quantities: BTreeMap<Uuid, LineQuantities> =
            lines.iter().map(|l| (l.id, l.quantities())).collect();

        for input in &request.lines {
            let Some(line) = lines.iter().find(|l| l.id == input.purchase_order_line_id) else {
                return Err(ServiceError::ValidationError(format!(
                    "line {} does not belong to purchase order {}",
                    input.purchase_order_line_id, order.id
                )));
            };
            let delta = input.delta();
            if delta.is_empty() {
                continue;
            }
            let before = line.quantities();
            let after = before.apply(&delta)?;
            quantities.insert(line.id, after);

            let mut active: purchase_order_line::ActiveModel = line.clone().into();
            active.received_quantity = Set(after.received);
            active.received_damaged_quantity = Set(after.damaged);
            active.received_missing_quantity = Set(after.missing);
            active.updated_at = Set(now);
            active.update(&txn).await?;

            for (field, old, new) in [
                ("received_quantity", before.received, after.received),
                ("received_damaged_quantity", before.damaged, after.damaged),
                ("received_missing_quantity", before.missing, after.missing),
            ] {
                if old != new {
                    audit_records.push(AuditRecord::new(
                        actor,
                        AuditAggregate::PurchaseOrderLine,
                        line.id,
                        field,
                        old,
                        new,
                    ));
                }
            }
            recorded.push(RecordedReceiptLine {
                purchase_order_line_id: line.id,
                product_id: line.product_id,
                delta,
            });
        }

        let accumulated: Vec<LineQuantities> = quantities.values().copied().collect();
        if accumulated.is_empty() {
            warn!(purchase_order_id = %order.id, "Receipt on purchase order without lines; completing it");
        }
        let status_after = derive_receipt_status(&accumulated);

        purchase_order::save_versioned(
            &txn,
            &order,
            purchase_order::ActiveModel {
                status: Set(status_after),
                ..Default::default()
            },
        )
        .await?;
        if status_after != order.status {
            audit_records.push(AuditRecord::new(
                actor,
                AuditAggregate::PurchaseOrder,
                order.id,
                "status",
                order.status,
                status_after,
            ));
        }

        receipt_event::ActiveModel {
            id: Set(request.event_id),
            purchase_order_id: Set(order.id),
            warehouse_id: Set(request.warehouse_id),
            lines: Set(serde_json::to_value(&recorded)?),
            status_before: Set(order.status),
            status_after: Set(status_after),
            received_by: Set(actor.id),
            received_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let stock_movements = self.move_stock(request.warehouse_id, &recorded).await?;
        transaction::commit(txn).await?;

        Ok(CommittedReceipt {
            outcome: ReceiptOutcome {
                receipt_event_id: request.event_id,
                purchase_order_id: order.id,
                status_before: order.status,
                status_after,
                replayed: false,
                lines: recorded,
                stock_movements,
                ledger: None,
            },
            requisition_id: order.requisition_id,
            reached_confirmation: order.reached_confirmation(),
            audit: audit_records,
        })
    }

    /// Writes good and damaged quantities to the stock ledger. Runs after the order's
    /// version check so a lost race never touches stock.
    async fn move_stock(
        &self,
        warehouse_id: Uuid,
        recorded: &[RecordedReceiptLine],
    ) -> Result<Vec<StockMovement>, ServiceError> {
        let mut movements = Vec::new();
        for line in recorded {
            for (condition, quantity) in [
                (StockCondition::Good, line.delta.ok),
                (StockCondition::Damaged, line.delta.damaged),
            ] {
                if quantity == 0 {
                    continue;
                }
                let outcome = self
                    .stock_ledger
                    .apply_stock_delta(line.product_id, warehouse_id, quantity, condition)
                    .await?;
                movements.push(StockMovement {
                    product_id: line.product_id,
                    condition,
                    quantity,
                    outcome,
                });
            }
        }
        Ok(movements)
    }

    fn replay(
        recorded: receipt_event::Model,
        order: &purchase_order::Model,
    ) -> Result<CommittedReceipt, ServiceError> {
        if recorded.purchase_order_id != order.id {
            return Err(ServiceError::ValidationError(format!(
                "receipt event {} was recorded for purchase order {}",
                recorded.id, recorded.purchase_order_id
            )));
        }
        let lines: Vec<RecordedReceiptLine> = serde_json::from_value(recorded.lines)?;
        Ok(CommittedReceipt {
            outcome: ReceiptOutcome {
                receipt_event_id: recorded.id,
                purchase_order_id: order.id,
                status_before: recorded.status_before,
                status_after: recorded.status_after,
                replayed: true,
                lines,
                stock_movements: Vec::new(),
                ledger: None,
            },
            requisition_id: order.requisition_id,
            reached_confirmation: order.reached_confirmation(),
            audit: Vec::new(),
        })
    }
}
