//! StateSet Procurement
//!
//! Requisition-to-purchase-order reconciliation core. Requisitions collect supplier
//! quotations, an advisory optimizer suggests offers, awards become supplier-grouped
//! purchase orders, and confirmations, receipts and cancellations keep the requisition's
//! promise (`pending_po_quantity`) and fulfillment (`purchased_quantity`) counters exact.
//!
//! Every aggregate is written in its own optimistic transaction; see [`db::transaction`].
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod audit;
pub mod auth;
pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod integrations;
pub mod models;
pub mod services;

pub use auth::{Actor, ActorRole};
pub use errors::ServiceError;
pub use services::{ProcurementServices, ServiceDependencies};
