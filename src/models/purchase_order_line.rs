use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ServiceError;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "purchase_order_lines")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub purchase_order_id: Uuid,
    pub line_number: i32,
    pub product_id: Uuid,
    /// Quotation the line was awarded from; `None` for lines added by an edit.
    pub quotation_id: Option<Uuid>,
    pub ordered_quantity: i32,
    pub received_quantity: i32,
    pub received_damaged_quantity: i32,
    pub received_missing_quantity: i32,
    pub unit_price: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
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

impl Model {
    pub fn quantities(&self) -> LineQuantities {
        LineQuantities {
            ordered: self.ordered_quantity,
            received: self.received_quantity,
            damaged: self.received_damaged_quantity,
            missing: self.received_missing_quantity,
        }
    }
}

/// Receiving counters of a purchase order line.
///
/// Invariant: `received + damaged + missing <= ordered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LineQuantities {
    pub ordered: i32,
    pub received: i32,
    pub damaged: i32,
    pub missing: i32,
}

/// Non-negative quantities reported by one receipt for one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReceiptDelta {
    pub ok: i32,
    pub damaged: i32,
    pub missing: i32,
}

impl ReceiptDelta {
    pub fn is_empty(&self) -> bool {
        self.ok == 0 && self.damaged == 0 && self.missing == 0
    }

    /// Sum of the three buckets, widened so arbitrary reported values cannot overflow.
    pub fn total(&self) -> i64 {
        i64::from(self.ok) + i64::from(self.damaged) + i64::from(self.missing)
    }
}

impl LineQuantities {
    pub fn accounted(&self) -> i32 {
        self.received + self.damaged + self.missing
    }

    /// Ordered quantity not yet accounted for in any way. Negative only if the identity
    /// was already broken upstream.
    pub fn net_outstanding(&self) -> i32 {
        self.ordered - self.accounted()
    }

    pub fn is_fully_accounted(&self) -> bool {
        self.accounted() >= self.ordered
    }

    /// Applies a receipt delta, refusing anything that would account for more than ordered.
    pub fn apply(&self, delta: &ReceiptDelta) -> Result<LineQuantities, ServiceError> {
        if delta.ok < 0 || delta.damaged < 0 || delta.missing < 0 {
            return Err(ServiceError::ValidationError(format!(
                "receipt quantities must be non-negative (ok={}, damaged={}, missing={})",
                delta.ok, delta.damaged, delta.missing
            )));
        }
        let already = i64::from(self.received) + i64::from(self.damaged) + i64::from(self.missing);
        let accounted = already + delta.total();
        if accounted > i64::from(self.ordered) {
            return Err(ServiceError::ConsistencyViolation(format!(
                "receipt would account for {} of {} ordered ({} already accounted, {} reported)",
                accounted,
                self.ordered,
                already,
                delta.total()
            )));
        }
        let bucket = |current: i32, reported: i32| {
            current.checked_add(reported).ok_or_else(|| {
                ServiceError::ConsistencyViolation(format!(
                    "receipt quantity {} overflows the line counter {}",
                    reported, current
                ))
            })
        };
        Ok(LineQuantities {
            ordered: self.ordered,
            received: bucket(self.received, delta.ok)?,
            damaged: bucket(self.damaged, delta.damaged)?,
            missing: bucket(self.missing, delta.missing)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn line(ordered: i32, received: i32, damaged: i32, missing: i32) -> LineQuantities {
        LineQuantities {
            ordered,
            received,
            damaged,
            missing,
        }
    }

    #[test]
    fn apply_accumulates_each_bucket() {
        let next = line(10, 2, 0, 0)
            .apply(&ReceiptDelta {
                ok: 5,
                damaged: 1,
                missing: 2,
            })
            .unwrap();
        assert_eq!(next, line(10, 7, 1, 2));
        assert_eq!(next.net_outstanding(), 0);
        assert!(next.is_fully_accounted());
    }

    #[test]
    fn overage_is_a_consistency_violation() {
        let result = line(10, 8, 0, 0).apply(&ReceiptDelta {
            ok: 2,
            damaged: 1,
            missing: 0,
        });
        assert_matches!(result, Err(ServiceError::ConsistencyViolation(_)));
    }

    #[test]
    fn huge_deltas_are_refused_without_overflow() {
        let result = line(10, 5, 0, 0).apply(&ReceiptDelta {
            ok: i32::MAX,
            damaged: i32::MAX,
            missing: 0,
        });
        assert_matches!(result, Err(ServiceError::ConsistencyViolation(_)));

        let full = line(i32::MAX, i32::MAX - 1, 0, 0)
            .apply(&ReceiptDelta {
                ok: 1,
                damaged: 0,
                missing: 0,
            })
            .unwrap();
        assert!(full.is_fully_accounted());
    }

    #[test]
    fn negative_deltas_are_rejected() {
        let result = line(10, 8, 0, 0).apply(&ReceiptDelta {
            ok: -1,
            damaged: 0,
            missing: 0,
        });
        assert_matches!(result, Err(ServiceError::ValidationError(_)));
    }
}
