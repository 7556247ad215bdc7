use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One product a requisition asks for, with its promise and fulfillment counters.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "required_product_lines")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub requisition_id: Uuid,
    pub product_id: Uuid,
    pub required_quantity: i32,
    /// Quantity credited as fulfilled by confirmed or received purchase orders.
    pub purchased_quantity: i32,
    /// Quantity promised by outstanding, not-yet-confirmed purchase orders.
    pub pending_po_quantity: i32,
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

impl Model {
    /// Demand that is neither fulfilled nor promised yet.
    pub fn net_remaining(&self) -> i32 {
        (self.required_quantity - self.purchased_quantity - self.pending_po_quantity).max(0)
    }

    pub fn is_satisfied(&self) -> bool {
        self.purchased_quantity >= self.required_quantity
    }
}
