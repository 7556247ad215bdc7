use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
    QueryOrder,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument};
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
    integrations::{master_data::require_all_active, MasterDataLookup, ReferenceKind},
    models::{required_product_line, requisition, RequisitionStatus},
};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateRequisitionRequest {
    #[validate(length(min = 1, max = 64, message = "Requisition reference is required"))]
    pub reference: String,
    #[validate(length(min = 1, message = "At least one required product is needed"))]
    pub lines: Vec<RequiredProductInput>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RequiredProductInput {
    pub product_id: Uuid,
    pub required_quantity: i32,
}

/// A requisition with its required product lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequisitionDetails {
    pub requisition: requisition::Model,
    pub lines: Vec<required_product_line::Model>,
}

impl RequisitionDetails {
    pub fn line_for(&self, product_id: Uuid) -> Option<&required_product_line::Model> {
        self.lines.iter().find(|l| l.product_id == product_id)
    }

    pub fn is_fully_purchased(&self) -> bool {
        self.lines.iter().all(required_product_line::Model::is_satisfied)
    }
}

/// Loads a requisition header and its lines on `conn`.
pub(crate) async fn load_requisition_aggregate<C: ConnectionTrait>(
    conn: &C,
    requisition_id: Uuid,
) -> Result<(requisition::Model, Vec<required_product_line::Model>), ServiceError> {
    let header = requisition::Entity::find_by_id(requisition_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Requisition {} not found", requisition_id)))?;

    let lines = required_product_line::Entity::find()
        .filter(required_product_line::Column::RequisitionId.eq(requisition_id))
        .order_by_asc(required_product_line::Column::CreatedAt)
        .order_by_asc(required_product_line::Column::Id)
        .all(conn)
        .await?;

    Ok((header, lines))
}

fn validate_lines(lines: &[RequiredProductInput]) -> Result<(), ServiceError> {
    let mut seen = HashSet::new();
    for line in lines {
        if line.required_quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "required quantity for product {} must be positive, got {}",
                line.product_id, line.required_quantity
            )));
        }
        if !seen.insert(line.product_id) {
            return Err(ServiceError::ValidationError(format!(
                "product {} is listed more than once",
                line.product_id
            )));
        }
    }
    Ok(())
}

/// Creation, reads and cancellation of requisitions. Counter changes go through
/// [`RequisitionLedger`](super::requisition_ledger::RequisitionLedger).
#[derive(Clone)]
pub struct RequisitionService {
    db: Arc<DbPool>,
    event_sender: EventSender,
    audit: Arc<dyn AuditSink>,
    master_data: Arc<dyn MasterDataLookup>,
    retry: RetryPolicy,
}

impl RequisitionService {
    pub fn new(
        db: Arc<DbPool>,
        event_sender: EventSender,
        audit: Arc<dyn AuditSink>,
        master_data: Arc<dyn MasterDataLookup>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            event_sender,
            audit,
            master_data,
            retry,
        }
    }

    /// Creates a requisition in `PendingQuotation` with zeroed counters.
    #[instrument(skip(self, actor, request), fields(reference = %request.reference, lines = request.lines.len()))]
    pub async fn create_requisition(
        &self,
        actor: &Actor,
        request: CreateRequisitionRequest,
    ) -> Result<RequisitionDetails, ServiceError> {
        request.validate()?;
        validate_lines(&request.lines)?;
        require_all_active(
            self.master_data.as_ref(),
            ReferenceKind::Product,
            request.lines.iter().map(|l| l.product_id),
        )
        .await?;

        let now = Utc::now();
        let requisition_id = Uuid::new_v4();
        let txn = transaction::begin(&self.db).await?;

        let header = requisition::ActiveModel {
            id: Set(requisition_id),
            reference: Set(request.reference.clone()),
            status: Set(RequisitionStatus::PendingQuotation),
            notes: Set(request.notes.clone()),
            created_by: Set(actor.id),
            version: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let mut lines = Vec::with_capacity(request.lines.len());
        for input in &request.lines {
            let line = required_product_line::ActiveModel {
                id: Set(Uuid::new_v4()),
                requisition_id: Set(requisition_id),
                product_id: Set(input.product_id),
                required_quantity: Set(input.required_quantity),
                purchased_quantity: Set(0),
                pending_po_quantity: Set(0),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(&txn)
            .await?;
            lines.push(line);
        }

        transaction::commit(txn).await?;

        info!(requisition_id = %requisition_id, "Requisition created");
        self.event_sender
            .send_or_log(Event::RequisitionCreated(requisition_id))
            .await;

        Ok(RequisitionDetails {
            requisition: header,
            lines,
        })
    }

    #[instrument(skip(self))]
    pub async fn get_requisition(
        &self,
        requisition_id: Uuid,
    ) -> Result<RequisitionDetails, ServiceError> {
        let (requisition, lines) =
            load_requisition_aggregate(self.db.as_ref(), requisition_id).await?;
        Ok(RequisitionDetails { requisition, lines })
    }

    /// Cancels a requisition that no outstanding purchase order still promises against.
    /// Canceling an already canceled requisition is a no-op.
    #[instrument(skip(self, actor), fields(requisition_id = %requisition_id))]
    pub async fn cancel_requisition(
        &self,
        actor: &Actor,
        requisition_id: Uuid,
        reason: Option<String>,
    ) -> Result<requisition::Model, ServiceError> {
        let reason = reason.as_deref();
        let (model, old_status) = retry_on_conflict(&self.retry, "cancel_requisition", move || {
            self.cancel_once(requisition_id, reason)
        })
        .await?;

        if old_status != model.status {
            info!(requisition_id = %requisition_id, "Requisition canceled");
            audit::emit_all(
                self.audit.as_ref(),
                vec![AuditRecord::new(
                    actor,
                    AuditAggregate::Requisition,
                    requisition_id,
                    "status",
                    old_status,
                    model.status,
                )],
            )
            .await;
            self.event_sender
                .send_or_log(Event::RequisitionStatusChanged {
                    requisition_id,
                    old_status,
                    new_status: model.status,
                })
                .await;
        }
        Ok(model)
    }

    async fn cancel_once(
        &self,
        requisition_id: Uuid,
        reason: Option<&str>,
    ) -> Result<(requisition::Model, RequisitionStatus), ServiceError> {
        let txn = transaction::begin(&self.db).await?;
        let (header, lines) = load_requisition_aggregate(&txn, requisition_id).await?;

        match header.status {
            RequisitionStatus::Canceled => return Ok((header, RequisitionStatus::Canceled)),
            RequisitionStatus::Completed => {
                return Err(ServiceError::InvalidStatus(format!(
                    "requisition {} is already completed",
                    requisition_id
                )))
            }
            _ => {}
        }

        if let Some(line) = lines.iter().find(|l| l.pending_po_quantity > 0) {
            return Err(ServiceError::InvalidStatus(format!(
                "product {} still has {} units pending on purchase orders",
                line.product_id, line.pending_po_quantity
            )));
        }

        let notes = match (header.notes.as_deref(), reason) {
            (Some(existing), Some(r)) => Some(format!("{}\nCanceled: {}", existing, r)),
            (None, Some(r)) => Some(format!("Canceled: {}", r)),
            (existing, None) => existing.map(str::to_string),
        };
        let version = requisition::save_versioned(
            &txn,
            &header,
            requisition::ActiveModel {
                status: Set(RequisitionStatus::Canceled),
                notes: Set(notes.clone()),
                ..Default::default()
            },
        )
        .await?;
        transaction::commit(txn).await?;

        let old_status = header.status;
        Ok((
            requisition::Model {
                status: RequisitionStatus::Canceled,
                notes,
                version,
                updated_at: Utc::now(),
                ..header
            },
            old_status,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn duplicate_products_are_rejected() {
        let product_id = Uuid::new_v4();
        let lines = vec![
            RequiredProductInput {
                product_id,
                required_quantity: 5,
            },
            RequiredProductInput {
                product_id,
                required_quantity: 3,
            },
        ];
        assert_matches!(validate_lines(&lines), Err(ServiceError::ValidationError(_)));
    }

    #[test]
    fn non_positive_quantities_are_rejected() {
        let lines = vec![RequiredProductInput {
            product_id: Uuid::new_v4(),
            required_quantity: 0,
        }];
        assert_matches!(validate_lines(&lines), Err(ServiceError::ValidationError(_)));
    }

    #[test]
    fn empty_requests_fail_validation() {
        let request = CreateRequisitionRequest {
            reference: "REQ-1".into(),
            lines: vec![],
            notes: None,
        };
        assert!(request.validate().is_err());
    }
}
