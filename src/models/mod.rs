//! Persistence model.
//!
//! Three independently owned aggregates, each with a versioned root:
//! requisition (+ required product lines), quotation (+ offers) and
//! purchase order (+ lines, edit snapshot, receipt events). The ledger entry table
//! journals every requisition counter mutation so reconciliation steps can be replayed.

pub mod ledger_entry;
pub mod purchase_order;
pub mod purchase_order_line;
pub mod purchase_order_snapshot;
pub mod quotation;
pub mod quotation_offer;
pub mod receipt_event;
pub mod required_product_line;
pub mod requisition;

pub use purchase_order::PurchaseOrderStatus;
pub use quotation::QuotationStatus;
pub use requisition::RequisitionStatus;
