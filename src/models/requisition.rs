use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue::Set, ConnectionTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ServiceError;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum RequisitionStatus {
    #[sea_orm(string_value = "PendingQuotation")]
    PendingQuotation,
    #[sea_orm(string_value = "Quoted")]
    Quoted,
    #[sea_orm(string_value = "POInProgress")]
    POInProgress,
    #[sea_orm(string_value = "Completed")]
    Completed,
    #[sea_orm(string_value = "Canceled")]
    Canceled,
}

impl RequisitionStatus {
    /// Whether new quotations or awards may still be attached.
    pub fn accepts_procurement(&self) -> bool {
        !matches!(self, Self::Canceled)
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "requisitions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub reference: String,
    pub status: RequisitionStatus,
    pub notes: Option<String>,
    pub created_by: Uuid,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Writes `changes` onto the requisition row only if nobody else bumped its version since
/// `current` was read. Returns the new version.
pub async fn save_versioned<C: ConnectionTrait>(
    conn: &C,
    current: &Model,
    mut changes: ActiveModel,
) -> Result<i32, ServiceError> {
    let next_version = current.version + 1;
    changes.version = Set(next_version);
    changes.updated_at = Set(Utc::now());

    let result = Entity::update_many()
        .set(changes)
        .filter(Column::Id.eq(current.id))
        .filter(Column::Version.eq(current.version))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        return Err(ServiceError::ConcurrentModification(current.id));
    }
    Ok(next_version)
}
