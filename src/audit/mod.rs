//! Audit trail for status transitions and counter mutations.
//!
//! Records are emitted after the owning transaction commits. A failing sink is logged and
//! never undoes the business operation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::Actor;
use crate::errors::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum AuditAggregate {
    Requisition,
    RequiredProductLine,
    Quotation,
    PurchaseOrder,
    PurchaseOrderLine,
}

/// One field change on one aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub actor_id: Uuid,
    pub actor_name: String,
    pub timestamp: DateTime<Utc>,
    pub aggregate: AuditAggregate,
    pub aggregate_id: Uuid,
    pub field: String,
    pub before: Value,
    pub after: Value,
}

impl AuditRecord {
    pub fn new(
        actor: &Actor,
        aggregate: AuditAggregate,
        aggregate_id: Uuid,
        field: impl Into<String>,
        before: impl Serialize,
        after: impl Serialize,
    ) -> Self {
        Self {
            actor_id: actor.id,
            actor_name: actor.name.clone(),
            timestamp: Utc::now(),
            aggregate,
            aggregate_id,
            field: field.into(),
            before: serde_json::to_value(before).unwrap_or(Value::Null),
            after: serde_json::to_value(after).unwrap_or(Value::Null),
        }
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<(), ServiceError>;
}

/// Sends every record to the sink, logging failures instead of propagating them.
pub async fn emit_all(sink: &dyn AuditSink, records: Vec<AuditRecord>) {
    for record in records {
        let aggregate = record.aggregate;
        let aggregate_id = record.aggregate_id;
        if let Err(e) = sink.record(record).await {
            warn!(%aggregate, %aggregate_id, error = %e, "Failed to record audit entry");
        }
    }
}

/// Writes audit records as structured log events.
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), ServiceError> {
        info!(
            target: "stateset_procurement::audit",
            actor_id = %record.actor_id,
            actor = %record.actor_name,
            aggregate = %record.aggregate,
            aggregate_id = %record.aggregate_id,
            field = %record.field,
            before = %record.before,
            after = %record.after,
            "audit"
        );
        Ok(())
    }
}

/// Keeps records in memory, in emission order.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    records: RwLock<Vec<AuditRecord>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.read().await.clone()
    }

    pub async fn records_for(&self, aggregate_id: Uuid) -> Vec<AuditRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| r.aggregate_id == aggregate_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), ServiceError> {
        self.records.write().await.push(record);
        Ok(())
    }
}
