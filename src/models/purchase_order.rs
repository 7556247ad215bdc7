use chrono::{DateTime, NaiveDate, Utc};
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
pub enum PurchaseOrderStatus {
    #[sea_orm(string_value = "Pending")]
    Pending,
    #[sea_orm(string_value = "SentToSupplier")]
    SentToSupplier,
    #[sea_orm(string_value = "ChangesProposedBySupplier")]
    ChangesProposedBySupplier,
    #[sea_orm(string_value = "PendingInternalReview")]
    PendingInternalReview,
    #[sea_orm(string_value = "ConfirmedBySupplier")]
    ConfirmedBySupplier,
    #[sea_orm(string_value = "RejectedBySupplier")]
    RejectedBySupplier,
    #[sea_orm(string_value = "PartiallyDelivered")]
    PartiallyDelivered,
    #[sea_orm(string_value = "AwaitingFutureDelivery")]
    AwaitingFutureDelivery,
    #[sea_orm(string_value = "FullyReceived")]
    FullyReceived,
    #[sea_orm(string_value = "Completed")]
    Completed,
    #[sea_orm(string_value = "Canceled")]
    Canceled,
}

impl PurchaseOrderStatus {
    /// Set only by receipt reconciliation; never requested directly.
    pub fn is_derived(&self) -> bool {
        matches!(
            self,
            Self::PartiallyDelivered | Self::FullyReceived | Self::Completed
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RejectedBySupplier | Self::Completed | Self::Canceled
        )
    }

    /// Negotiation states, before the supplier has committed to the order.
    pub fn is_pre_confirmation(&self) -> bool {
        matches!(
            self,
            Self::Pending
                | Self::SentToSupplier
                | Self::ChangesProposedBySupplier
                | Self::PendingInternalReview
        )
    }

    pub fn accepts_receipts(&self) -> bool {
        matches!(
            self,
            Self::ConfirmedBySupplier | Self::PartiallyDelivered | Self::AwaitingFutureDelivery
        )
    }

    pub fn allows_line_edits(&self) -> bool {
        self.is_pre_confirmation()
    }

    /// The first edit in these states freezes the pre-edit lines for later diffing.
    pub fn snapshots_on_edit(&self) -> bool {
        matches!(self, Self::SentToSupplier | Self::ChangesProposedBySupplier)
    }

    /// Manual transitions an actor may request from this status.
    pub fn allowed_transitions(&self) -> &'static [PurchaseOrderStatus] {
        use PurchaseOrderStatus::*;
        match self {
            Pending => &[SentToSupplier, Canceled],
            SentToSupplier => &[
                ChangesProposedBySupplier,
                PendingInternalReview,
                ConfirmedBySupplier,
                RejectedBySupplier,
                Canceled,
            ],
            ChangesProposedBySupplier => &[
                PendingInternalReview,
                SentToSupplier,
                ConfirmedBySupplier,
                RejectedBySupplier,
                Canceled,
            ],
            PendingInternalReview => &[
                SentToSupplier,
                ConfirmedBySupplier,
                RejectedBySupplier,
                Canceled,
            ],
            ConfirmedBySupplier => &[Canceled],
            PartiallyDelivered => &[AwaitingFutureDelivery, Canceled],
            AwaitingFutureDelivery => &[Canceled],
            FullyReceived => &[Canceled],
            RejectedBySupplier | Completed | Canceled => &[],
        }
    }

    pub fn can_transition_to(&self, target: PurchaseOrderStatus) -> bool {
        self.allowed_transitions().contains(&target)
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "purchase_orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub po_number: String,
    pub requisition_id: Uuid,
    pub quotation_id: Option<Uuid>,
    pub supplier_id: Uuid,
    /// Award commit attempt that produced this order; retries of the batch reuse it.
    pub award_batch_id: Option<Uuid>,
    pub status: PurchaseOrderStatus,
    pub additional_costs: Decimal,
    pub currency: String,
    pub expected_delivery_date: NaiveDate,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub over_order_acknowledged: bool,
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

impl Model {
    /// Whether the supplier ever confirmed this order. Receiving states imply it.
    pub fn reached_confirmation(&self) -> bool {
        self.confirmed_at.is_some()
    }
}

/// Version-checked write of a purchase order row. Returns the new version.
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

#[cfg(test)]
mod tests {
    use super::PurchaseOrderStatus::*;
    use super::*;
    use sea_orm::Iterable;

    #[test]
    fn derived_statuses_are_never_manual_targets() {
        for from in PurchaseOrderStatus::iter() {
            for to in from.allowed_transitions() {
                assert!(!to.is_derived(), "{} -> {} targets a derived status", from, to);
            }
        }
    }

    #[test]
    fn terminal_statuses_have_no_exits() {
        for status in PurchaseOrderStatus::iter().filter(|s| s.is_terminal()) {
            assert!(status.allowed_transitions().is_empty());
        }
    }

    #[test]
    fn rejection_only_from_negotiation_states() {
        for from in PurchaseOrderStatus::iter() {
            let allowed = from.can_transition_to(RejectedBySupplier);
            let expected = matches!(
                from,
                SentToSupplier | ChangesProposedBySupplier | PendingInternalReview
            );
            assert_eq!(allowed, expected, "reject from {}", from);
        }
    }

    #[test]
    fn cancellation_paths() {
        assert!(Pending.can_transition_to(Canceled));
        assert!(PendingInternalReview.can_transition_to(Canceled));
        assert!(ConfirmedBySupplier.can_transition_to(Canceled));
        assert!(FullyReceived.can_transition_to(Canceled));
        assert!(!Completed.can_transition_to(Canceled));
        assert!(!Pending.can_transition_to(ConfirmedBySupplier));
    }

    #[test]
    fn receiving_requires_confirmation() {
        assert!(!SentToSupplier.accepts_receipts());
        assert!(ConfirmedBySupplier.accepts_receipts());
        assert!(AwaitingFutureDelivery.accepts_receipts());
        assert!(!FullyReceived.accepts_receipts());
    }
}
