use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
    QueryOrder,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
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
    models::{
        purchase_order, purchase_order_line,
        purchase_order_snapshot::{self, SnapshotLine},
        PurchaseOrderStatus,
    },
    services::{
        requisition_ledger::{
            self, LedgerMutation, LedgerOutcome, LineCounters, PoLineQuantities, ProductQuantity,
            RequisitionLedger, StagedLedger,
        },
        requisitions::load_requisition_aggregate,
    },
};

/// A purchase order with its lines, ordered by line number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseOrderDetails {
    pub order: purchase_order::Model,
    pub lines: Vec<purchase_order_line::Model>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub purchase_order_id: Uuid,
    pub target: PurchaseOrderStatus,
    /// Required when confirming would leave a product over-ordered.
    #[serde(default)]
    pub acknowledge_over_order: bool,
    pub reason: Option<String>,
}

impl TransitionRequest {
    pub fn new(purchase_order_id: Uuid, target: PurchaseOrderStatus) -> Self {
        Self {
            purchase_order_id,
            target,
            acknowledge_over_order: false,
            reason: None,
        }
    }

    pub fn acknowledging_over_order(mut self) -> Self {
        self.acknowledge_over_order = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub purchase_order: purchase_order::Model,
    pub old_status: PurchaseOrderStatus,
    /// False when the order already was in the requested status.
    pub changed: bool,
    /// Counter reconciliation triggered by the transition, if any.
    pub ledger: Option<LedgerOutcome>,
    pub over_ordered_products: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EditLinesRequest {
    pub purchase_order_id: Uuid,
    pub lines: Vec<LineEdit>,
    pub additional_costs: Option<Decimal>,
}

/// Changes one existing line (`line_id` set) or appends a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineEdit {
    pub line_id: Option<Uuid>,
    pub product_id: Uuid,
    pub ordered_quantity: i32,
    pub unit_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditOutcome {
    pub purchase_order: PurchaseOrderDetails,
    pub snapshot_taken: bool,
    pub ledger: Option<LedgerOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineDiff {
    pub product_id: Uuid,
    pub before: Option<SnapshotLine>,
    pub after: Option<SnapshotLine>,
}

/// Differences between the pre-edit snapshot and the current purchase order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseOrderDiff {
    pub purchase_order_id: Uuid,
    pub additional_costs_before: Decimal,
    pub additional_costs_after: Decimal,
    pub lines: Vec<LineDiff>,
}

impl PurchaseOrderDiff {
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.additional_costs_before == self.additional_costs_after
    }
}

fn snapshot_lines(lines: &[purchase_order_line::Model]) -> Vec<SnapshotLine> {
    lines
        .iter()
        .map(|l| SnapshotLine {
            product_id: l.product_id,
            ordered_quantity: l.ordered_quantity,
            unit_price: l.unit_price,
        })
        .collect()
}

/// Compares snapshot and current lines per product, keeping only changed products.
pub fn diff_lines(before: &[SnapshotLine], after: &[SnapshotLine]) -> Vec<LineDiff> {
    let mut products: BTreeMap<Uuid, (Option<SnapshotLine>, Option<SnapshotLine>)> =
        BTreeMap::new();
    for line in before {
        products.entry(line.product_id).or_default().0 = Some(line.clone());
    }
    for line in after {
        products.entry(line.product_id).or_default().1 = Some(line.clone());
    }
    products
        .into_iter()
        .filter(|(_, (b, a))| b != a)
        .map(|(product_id, (before, after))| LineDiff {
            product_id,
            before,
            after,
        })
        .collect()
}

/// Products whose fulfilled plus promised quantity exceeds the requirement.
pub fn over_ordered_products(lines: &[LineCounters], products: &BTreeSet<Uuid>) -> Vec<Uuid> {
    lines
        .iter()
        .filter(|l| products.contains(&l.product_id) && l.purchased + l.pending > l.required)
        .map(|l| l.product_id)
        .collect()
}

async fn load_order<C: ConnectionTrait>(
    conn: &C,
    purchase_order_id: Uuid,
) -> Result<PurchaseOrderDetails, ServiceError> {
    let order = purchase_order::Entity::find_by_id(purchase_order_id)
        .one(conn)
        .await?
        .ok_or_else(|| {
            ServiceError::NotFound(format!("Purchase order {} not found", purchase_order_id))
        })?;
    let lines = purchase_order_line::Entity::find()
        .filter(purchase_order_line::Column::PurchaseOrderId.eq(purchase_order_id))
        .order_by_asc(purchase_order_line::Column::LineNumber)
        .all(conn)
        .await?;
    Ok(PurchaseOrderDetails { order, lines })
}

struct CommittedTransition {
    order: purchase_order::Model,
    lines: Vec<purchase_order_line::Model>,
    old_status: PurchaseOrderStatus,
    changed: bool,
    over_ordered: Vec<Uuid>,
}

struct CommittedEdit {
    details: PurchaseOrderDetails,
    snapshot_taken: bool,
    ledger: Option<StagedLedger>,
    audit: Vec<AuditRecord>,
}

/// Purchase order lifecycle: manual transitions, pre-confirmation edits and reads.
#[derive(Clone)]
pub struct PurchaseOrderService {
    db: Arc<DbPool>,
    event_sender: EventSender,
    audit: Arc<dyn AuditSink>,
    ledger: RequisitionLedger,
    retry: RetryPolicy,
}

impl PurchaseOrderService {
    pub fn new(
        db: Arc<DbPool>,
        event_sender: EventSender,
        audit: Arc<dyn AuditSink>,
        ledger: RequisitionLedger,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            event_sender,
            audit,
            ledger,
            retry,
        }
    }

    #[instrument(skip(self))]
    pub async fn get_purchase_order(
        &self,
        purchase_order_id: Uuid,
    ) -> Result<PurchaseOrderDetails, ServiceError> {
        load_order(self.db.as_ref(), purchase_order_id).await
    }

    #[instrument(skip(self))]
    pub async fn list_purchase_orders(
        &self,
        requisition_id: Uuid,
    ) -> Result<Vec<purchase_order::Model>, ServiceError> {
        Ok(purchase_order::Entity::find()
            .filter(purchase_order::Column::RequisitionId.eq(requisition_id))
            .order_by_asc(purchase_order::Column::CreatedAt)
            .order_by_asc(purchase_order::Column::Id)
            .all(self.db.as_ref())
            .await?)
    }

    /// Moves a purchase order to `target` and runs the counter reconciliation the
    /// transition implies: confirmation credits the requisition, cancellation and
    /// rejection reverse what the order contributed.
    ///
    /// Requesting the status the order already has changes nothing but still replays the
    /// reconciliation step, which is itself idempotent.
    #[instrument(skip(self, actor, request), fields(purchase_order_id = %request.purchase_order_id, target = %request.target))]
    pub async fn transition(
        &self,
        actor: &Actor,
        request: TransitionRequest,
    ) -> Result<TransitionOutcome, ServiceError> {
        if request.target.is_derived() {
            return Err(ServiceError::ValidationError(format!(
                "{} is derived from receipts and cannot be requested",
                request.target
            )));
        }

        let request_ref = &request;
        let committed = retry_on_conflict(&self.retry, "transition_purchase_order", move || {
            self.transition_once(request_ref)
        })
        .await?;
        let order = &committed.order;

        if committed.changed {
            info!(
                purchase_order_id = %order.id,
                from = %committed.old_status,
                to = %order.status,
                "Purchase order status changed"
            );
            let mut records = vec![AuditRecord::new(
                actor,
                AuditAggregate::PurchaseOrder,
                order.id,
                "status",
                committed.old_status,
                order.status,
            )];
            if order.over_order_acknowledged && !committed.over_ordered.is_empty() {
                records.push(AuditRecord::new(
                    actor,
                    AuditAggregate::PurchaseOrder,
                    order.id,
                    "over_order_acknowledged",
                    false,
                    true,
                ));
            }
            audit::emit_all(self.audit.as_ref(), records).await;
            self.event_sender
                .send_or_log(Event::PurchaseOrderStatusChanged {
                    purchase_order_id: order.id,
                    old_status: committed.old_status,
                    new_status: order.status,
                })
                .await;
            if order.over_order_acknowledged && !committed.over_ordered.is_empty() {
                self.event_sender
                    .send_or_log(Event::OverOrderAcknowledged {
                        purchase_order_id: order.id,
                        requisition_id: order.requisition_id,
                        product_ids: committed.over_ordered.clone(),
                    })
                    .await;
            }
        }

        let quantities: Vec<PoLineQuantities> =
            committed.lines.iter().map(PoLineQuantities::from).collect();
        let mutation = match order.status {
            PurchaseOrderStatus::ConfirmedBySupplier => Some(LedgerMutation::PurchaseOrderConfirmed {
                purchase_order_id: order.id,
                lines: quantities,
            }),
            PurchaseOrderStatus::Canceled | PurchaseOrderStatus::RejectedBySupplier => {
                Some(LedgerMutation::PurchaseOrderReversed {
                    purchase_order_id: order.id,
                    reached_confirmation: order.reached_confirmation(),
                    lines: quantities,
                })
            }
            _ => None,
        };
        let ledger = match mutation {
            Some(mutation) => Some(self.ledger.apply(actor, order.requisition_id, mutation).await?),
            None => None,
        };

        Ok(TransitionOutcome {
            purchase_order: committed.order,
            old_status: committed.old_status,
            changed: committed.changed,
            ledger,
            over_ordered_products: committed.over_ordered,
        })
    }

    async fn transition_once(
        &self,
        request: &TransitionRequest,
    ) -> Result<CommittedTransition, ServiceError> {
        let txn = transaction::begin(&self.db).await?;
        let PurchaseOrderDetails { order, lines } =
            load_order(&txn, request.purchase_order_id).await?;
        let old_status = order.status;

        if old_status == request.target {
            transaction::commit(txn).await?;
            return Ok(CommittedTransition {
                over_ordered: Vec::new(),
                order,
                lines,
                old_status,
                changed: false,
            });
        }
        if !old_status.can_transition_to(request.target) {
            return Err(ServiceError::ValidationError(format!(
                "purchase order {} cannot move from {} to {}",
                order.id, old_status, request.target
            )));
        }

        let now = Utc::now();
        let mut changes = purchase_order::ActiveModel {
            status: Set(request.target),
            ..Default::default()
        };
        let mut over_ordered = Vec::new();
        if request.target == PurchaseOrderStatus::ConfirmedBySupplier {
            let (_, requisition_lines) = load_requisition_aggregate(&txn, order.requisition_id).await?;
            let counters: Vec<LineCounters> =
                requisition_lines.iter().map(LineCounters::from).collect();
            let products: BTreeSet<Uuid> = lines.iter().map(|l| l.product_id).collect();
            over_ordered = over_ordered_products(&counters, &products);
            if !over_ordered.is_empty() {
                if !request.acknowledge_over_order {
                    let names: Vec<String> = over_ordered.iter().map(Uuid::to_string).collect();
                    return Err(ServiceError::ValidationError(format!(
                        "confirming purchase order {} over-orders product(s) {}; acknowledge the over-order to proceed",
                        order.id,
                        names.join(", ")
                    )));
                }
                warn!(purchase_order_id = %order.id, products = over_ordered.len(), "Over-order acknowledged on confirmation");
                changes.over_order_acknowledged = Set(true);
            }
            changes.confirmed_at = Set(Some(now));
        }
        if let Some(reason) = &request.reason {
            info!(purchase_order_id = %order.id, %reason, "Transition reason recorded");
        }

        let version = purchase_order::save_versioned(&txn, &order, changes).await?;
        transaction::commit(txn).await?;

        let confirmed = request.target == PurchaseOrderStatus::ConfirmedBySupplier;
        Ok(CommittedTransition {
            order: purchase_order::Model {
                status: request.target,
                confirmed_at: if confirmed { Some(now) } else { order.confirmed_at },
                over_order_acknowledged: order.over_order_acknowledged
                    || (confirmed && !over_ordered.is_empty()),
                version,
                updated_at: now,
                ..order
            },
            lines,
            old_status,
            changed: true,
            over_ordered,
        })
    }

    /// Edits ordered quantities, prices and additional costs before confirmation. The first
    /// edit after the order was sent freezes the pre-edit values for [`Self::edit_diff`].
    /// The pending-quantity adjustment commits in the same transaction as the edit.
    #[instrument(skip(self, actor, request), fields(purchase_order_id = %request.purchase_order_id, lines = request.lines.len()))]
    pub async fn edit_lines(
        &self,
        actor: &Actor,
        request: EditLinesRequest,
    ) -> Result<EditOutcome, ServiceError> {
        request.validate()?;
        validate_edits(&request)?;

        let request_ref = &request;
        let committed = retry_on_conflict(&self.retry, "edit_purchase_order", move || {
            self.edit_once(actor, request_ref)
        })
        .await?;

        audit::emit_all(self.audit.as_ref(), committed.audit).await;
        self.event_sender
            .send_or_log(Event::PurchaseOrderAmended {
                purchase_order_id: request.purchase_order_id,
                snapshot_taken: committed.snapshot_taken,
            })
            .await;

        let ledger = match committed.ledger {
            Some(staged) => {
                let outcome = staged.outcome.clone();
                self.ledger.publish(staged).await;
                Some(outcome)
            }
            None => None,
        };

        let order = &committed.details.order;
        info!(purchase_order_id = %order.id, snapshot_taken = committed.snapshot_taken, "Purchase order amended");
        Ok(EditOutcome {
            purchase_order: committed.details,
            snapshot_taken: committed.snapshot_taken,
            ledger,
        })
    }

    async fn edit_once(
        &self,
        actor: &Actor,
        request: &EditLinesRequest,
    ) -> Result<CommittedEdit, ServiceError> {
        let txn = transaction::begin(&self.db).await?;
        let PurchaseOrderDetails { order, lines } =
            load_order(&txn, request.purchase_order_id).await?;

        if !order.status.allows_line_edits() {
            return Err(ServiceError::InvalidStatus(format!(
                "purchase order {} is {}; lines can only be edited before confirmation",
                order.id, order.status
            )));
        }

        let (_, requisition_lines) = load_requisition_aggregate(&txn, order.requisition_id).await?;
        let now = Utc::now();
        let mut snapshot_taken = false;
        if order.status.snapshots_on_edit()
            && purchase_order_snapshot::Entity::find_by_id(order.id)
                .one(&txn)
                .await?
                .is_none()
        {
            purchase_order_snapshot::ActiveModel {
                purchase_order_id: Set(order.id),
                lines: Set(serde_json::to_value(snapshot_lines(&lines))?),
                additional_costs: Set(order.additional_costs),
                captured_by: Set(actor.id),
                captured_at: Set(now),
            }
            .insert(&txn)
            .await?;
            snapshot_taken = true;
        }

        let mut audit_records = Vec::new();
        let mut deltas: BTreeMap<Uuid, i32> = BTreeMap::new();
        let mut next_line_number = lines.iter().map(|l| l.line_number).max().unwrap_or(0);
        let mut updated_lines = lines.clone();

        for edit in &request.lines {
            match edit.line_id {
                Some(line_id) => {
                    let Some(current) = updated_lines.iter_mut().find(|l| l.id == line_id) else {
                        return Err(ServiceError::NotFound(format!(
                            "Line {} not found on purchase order {}",
                            line_id, order.id
                        )));
                    };
                    if current.product_id != edit.product_id {
                        return Err(ServiceError::ValidationError(format!(
                            "line {} is for product {}, not {}",
                            line_id, current.product_id, edit.product_id
                        )));
                    }
                    if edit.ordered_quantity < current.quantities().accounted() {
                        return Err(ServiceError::ConsistencyViolation(format!(
                            "line {} already accounts for {} units",
                            line_id,
                            current.quantities().accounted()
                        )));
                    }
                    let delta = edit.ordered_quantity - current.ordered_quantity;
                    if delta == 0 && edit.unit_price == current.unit_price {
                        continue;
                    }
                    if delta != 0 {
                        let total = deltas.entry(edit.product_id).or_default();
                        *total = requisition_ledger::add_quantity(edit.product_id, *total, delta)?;
                        audit_records.push(AuditRecord::new(
                            actor,
                            AuditAggregate::PurchaseOrderLine,
                            line_id,
                            "ordered_quantity",
                            current.ordered_quantity,
                            edit.ordered_quantity,
                        ));
                    }
                    if edit.unit_price != current.unit_price {
                        audit_records.push(AuditRecord::new(
                            actor,
                            AuditAggregate::PurchaseOrderLine,
                            line_id,
                            "unit_price",
                            current.unit_price,
                            edit.unit_price,
                        ));
                    }
                    let mut active: purchase_order_line::ActiveModel = current.clone().into();
                    active.ordered_quantity = Set(edit.ordered_quantity);
                    active.unit_price = Set(edit.unit_price);
                    active.updated_at = Set(now);
                    *current = active.update(&txn).await?;
                }
                None => {
                    if !requisition_lines.iter().any(|l| l.product_id == edit.product_id) {
                        return Err(ServiceError::ValidationError(format!(
                            "product {} is not required by requisition {}",
                            edit.product_id, order.requisition_id
                        )));
                    }
                    next_line_number += 1;
                    let line = purchase_order_line::ActiveModel {
                        id: Set(Uuid::new_v4()),
                        purchase_order_id: Set(order.id),
                        line_number: Set(next_line_number),
                        product_id: Set(edit.product_id),
                        quotation_id: Set(None),
                        ordered_quantity: Set(edit.ordered_quantity),
                        received_quantity: Set(0),
                        received_damaged_quantity: Set(0),
                        received_missing_quantity: Set(0),
                        unit_price: Set(edit.unit_price),
                        created_at: Set(now),
                        updated_at: Set(now),
                    }
                    .insert(&txn)
                    .await?;
                    let total = deltas.entry(edit.product_id).or_default();
                    *total = requisition_ledger::add_quantity(
                        edit.product_id,
                        *total,
                        edit.ordered_quantity,
                    )?;
                    audit_records.push(AuditRecord::new(
                        actor,
                        AuditAggregate::PurchaseOrderLine,
                        line.id,
                        "ordered_quantity",
                        0,
                        edit.ordered_quantity,
                    ));
                    updated_lines.push(line);
                }
            }
        }

        let mut changes: purchase_order::ActiveModel = Default::default();
        let mut additional_costs = order.additional_costs;
        if let Some(costs) = request.additional_costs {
            if costs != order.additional_costs {
                audit_records.push(AuditRecord::new(
                    actor,
                    AuditAggregate::PurchaseOrder,
                    order.id,
                    "additional_costs",
                    order.additional_costs,
                    costs,
                ));
                changes.additional_costs = Set(costs);
                additional_costs = costs;
            }
        }
        let version = purchase_order::save_versioned(&txn, &order, changes).await?;

        let deltas: Vec<ProductQuantity> = deltas
            .into_iter()
            .filter(|(_, q)| *q != 0)
            .map(|(product_id, quantity)| ProductQuantity {
                product_id,
                quantity,
            })
            .collect();
        let ledger = if deltas.is_empty() {
            None
        } else {
            let mutation = LedgerMutation::PurchaseOrderAmended {
                purchase_order_id: order.id,
                revision: version,
                deltas,
            };
            Some(requisition_ledger::apply_in_txn(&txn, actor, order.requisition_id, &mutation).await?)
        };
        transaction::commit(txn).await?;

        Ok(CommittedEdit {
            details: PurchaseOrderDetails {
                order: purchase_order::Model {
                    additional_costs,
                    version,
                    updated_at: now,
                    ..order
                },
                lines: updated_lines,
            },
            snapshot_taken,
            ledger,
            audit: audit_records,
        })
    }

    /// Diff between the pre-edit snapshot and the current order; `None` when the order was
    /// never edited after being sent.
    #[instrument(skip(self))]
    pub async fn edit_diff(
        &self,
        purchase_order_id: Uuid,
    ) -> Result<Option<PurchaseOrderDiff>, ServiceError> {
        let db = self.db.as_ref();
        let details = load_order(db, purchase_order_id).await?;
        let Some(snapshot) = purchase_order_snapshot::Entity::find_by_id(purchase_order_id)
            .one(db)
            .await?
        else {
            return Ok(None);
        };
        let before: Vec<SnapshotLine> = serde_json::from_value(snapshot.lines)?;
        Ok(Some(PurchaseOrderDiff {
            purchase_order_id,
            additional_costs_before: snapshot.additional_costs,
            additional_costs_after: details.order.additional_costs,
            lines: diff_lines(&before, &snapshot_lines(&details.lines)),
        }))
    }
}

fn validate_edits(request: &EditLinesRequest) -> Result<(), ServiceError> {
    if request.lines.is_empty() && request.additional_costs.is_none() {
        return Err(ServiceError::ValidationError(
            "an edit must change lines or additional costs".to_string(),
        ));
    }
    if matches!(request.additional_costs, Some(c) if c < Decimal::ZERO) {
        return Err(ServiceError::ValidationError(
            "additional costs must not be negative".to_string(),
        ));
    }
    for edit in &request.lines {
        if edit.ordered_quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "ordered quantity for product {} must be positive",
                edit.product_id
            )));
        }
        if edit.unit_price < Decimal::ZERO {
            return Err(ServiceError::ValidationError(format!(
                "unit price for product {} must not be negative",
                edit.product_id
            )));
        }
    }
    Ok(())
}
