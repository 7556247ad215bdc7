use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum ReferenceKind {
    Product,
    Supplier,
    Warehouse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReferenceStatus {
    pub exists: bool,
    pub is_active: bool,
}

/// Read-only lookups against product, supplier and warehouse master data.
#[async_trait]
pub trait MasterDataLookup: Send + Sync {
    async fn lookup(&self, kind: ReferenceKind, id: Uuid) -> Result<ReferenceStatus, ServiceError>;
}

/// Fails fast with a `ValidationError` unless the reference exists and is active.
pub async fn require_active(
    master_data: &dyn MasterDataLookup,
    kind: ReferenceKind,
    id: Uuid,
) -> Result<(), ServiceError> {
    let status = master_data.lookup(kind, id).await?;
    if !status.exists {
        return Err(ServiceError::ValidationError(format!(
            "{} {} does not exist",
            kind, id
        )));
    }
    if !status.is_active {
        return Err(ServiceError::ValidationError(format!(
            "{} {} is inactive",
            kind, id
        )));
    }
    Ok(())
}

/// Checks every id concurrently; the first missing or inactive reference fails the batch.
pub async fn require_all_active(
    master_data: &dyn MasterDataLookup,
    kind: ReferenceKind,
    ids: impl IntoIterator<Item = Uuid>,
) -> Result<(), ServiceError> {
    try_join_all(ids.into_iter().map(|id| require_active(master_data, kind, id))).await?;
    Ok(())
}

#[derive(Debug, Default)]
pub struct InMemoryMasterData {
    entries: DashMap<(ReferenceKind, Uuid), bool>,
}

impl InMemoryMasterData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: ReferenceKind, id: Uuid, active: bool) {
        self.entries.insert((kind, id), active);
    }

    pub fn register_active(&self, kind: ReferenceKind, id: Uuid) {
        self.register(kind, id, true);
    }

    pub fn deactivate(&self, kind: ReferenceKind, id: Uuid) {
        if let Some(mut entry) = self.entries.get_mut(&(kind, id)) {
            *entry = false;
        }
    }
}

#[async_trait]
impl MasterDataLookup for InMemoryMasterData {
    async fn lookup(&self, kind: ReferenceKind, id: Uuid) -> Result<ReferenceStatus, ServiceError> {
        Ok(match self.entries.get(&(kind, id)) {
            Some(active) => ReferenceStatus {
                exists: true,
                is_active: *active,
            },
            None => ReferenceStatus::default(),
        })
    }
}
