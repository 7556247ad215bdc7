use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Journal of applied requisition counter mutations.
///
/// The key identifies the reconciliation step (`award:<batch>`, `confirm:<po>`,
/// `receipt:<event>`, `reverse:<po>`, ...). A step whose key is present has already been
/// applied and is skipped on replay.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "requisition_ledger_entries")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub key: String,
    pub requisition_id: Uuid,
    pub kind: String,
    /// Counter changes applied by the step, as JSON.
    pub changes: Json,
    pub applied_by: Uuid,
    pub applied_at: DateTime<Utc>,
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
