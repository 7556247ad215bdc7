use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::purchase_order::PurchaseOrderStatus;
use super::purchase_order_line::ReceiptDelta;

/// Append-only record of one physical receiving event. The id is chosen by the caller
/// and is the idempotency key of the event.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "receipt_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub purchase_order_id: Uuid,
    pub warehouse_id: Uuid,
    /// `Vec<RecordedReceiptLine>` as JSON.
    pub lines: Json,
    pub status_before: PurchaseOrderStatus,
    pub status_after: PurchaseOrderStatus,
    pub received_by: Uuid,
    pub received_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::purchase_order::Entity",
        from = "Column::PurchaseOrderId",
        to = "super::purchase_order::Column::Id"
    )]
    PurchaseOrder,
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedReceiptLine {
    pub purchase_order_line_id: Uuid,
    pub product_id: Uuid,
    pub delta: ReceiptDelta,
}
