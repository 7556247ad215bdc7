use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
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
pub enum QuotationStatus {
    #[sea_orm(string_value = "Sent")]
    Sent,
    #[sea_orm(string_value = "Received")]
    Received,
    #[sea_orm(string_value = "PartiallyAwarded")]
    PartiallyAwarded,
    #[sea_orm(string_value = "Awarded")]
    Awarded,
    #[sea_orm(string_value = "Rejected")]
    Rejected,
    #[sea_orm(string_value = "Lost")]
    Lost,
}

impl QuotationStatus {
    /// Statuses whose offers are visible to the offer catalog.
    pub const OPEN: [QuotationStatus; 3] = [
        QuotationStatus::Received,
        QuotationStatus::PartiallyAwarded,
        QuotationStatus::Awarded,
    ];

    pub fn is_open(&self) -> bool {
        Self::OPEN.contains(self)
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "quotations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub requisition_id: Uuid,
    pub supplier_id: Uuid,
    pub status: QuotationStatus,
    /// Freight, handling and similar costs quoted on top of the offer prices.
    pub additional_costs: Decimal,
    pub currency: String,
    pub notes: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    pub created_by: Uuid,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::requisition::Entity",
        from = "Column::RequisitionId",
        to = "super::requisition::Column::Id"
    )]
    Requisition,
}

impl ActiveModelBehavior for ActiveModel {}

/// Version-checked write of a quotation row. Returns the new version.
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
