//! Collaborators owned by other systems: master data and the physical stock ledger.
//!
//! Each seam is an async trait so the hosting service can plug in its own clients. The
//! `InMemory*` implementations back tests and single-process embeddings.

pub mod master_data;
pub mod stock_ledger;

pub use master_data::{InMemoryMasterData, MasterDataLookup, ReferenceKind, ReferenceStatus};
pub use stock_ledger::{InMemoryStockLedger, StockCondition, StockDeltaOutcome, StockLedger};
