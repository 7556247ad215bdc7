// Read side
pub mod offer_catalog;
pub mod offer_optimizer;

// Aggregate services
pub mod purchase_orders;
pub mod quotations;
pub mod requisitions;

// Reconciliation
pub mod award_commit;
pub mod receipts;
pub mod requisition_ledger;

use std::sync::Arc;

use crate::{
    audit::AuditSink,
    config::ProcurementConfig,
    db::{transaction::RetryPolicy, DbPool},
    events::EventSender,
    integrations::{MasterDataLookup, StockLedger},
};

use award_commit::AwardCommitService;
use offer_catalog::OfferCatalogService;
use purchase_orders::PurchaseOrderService;
use quotations::QuotationService;
use receipts::ReceiptService;
use requisition_ledger::RequisitionLedger;
use requisitions::RequisitionService;

/// Collaborators every service is built from.
#[derive(Clone)]
pub struct ServiceDependencies {
    pub db: Arc<DbPool>,
    pub event_sender: EventSender,
    pub audit: Arc<dyn AuditSink>,
    pub master_data: Arc<dyn MasterDataLookup>,
    pub stock_ledger: Arc<dyn StockLedger>,
}

/// All procurement services sharing one database pool, event channel and set of
/// collaborators.
#[derive(Clone)]
pub struct ProcurementServices {
    pub requisitions: RequisitionService,
    pub quotations: QuotationService,
    pub catalog: OfferCatalogService,
    pub awards: AwardCommitService,
    pub purchase_orders: PurchaseOrderService,
    pub receipts: ReceiptService,
    pub ledger: RequisitionLedger,
}

impl ProcurementServices {
    pub fn new(deps: ServiceDependencies, config: &ProcurementConfig) -> Self {
        Self::with_retry_policy(
            deps,
            config.retry_policy(),
            config.default_delivery_fallback_days,
        )
    }

    pub fn with_retry_policy(
        deps: ServiceDependencies,
        retry: RetryPolicy,
        delivery_fallback_days: i64,
    ) -> Self {
        let ServiceDependencies {
            db,
            event_sender,
            audit,
            master_data,
            stock_ledger,
        } = deps;

        let ledger = RequisitionLedger::new(db.clone(), event_sender.clone(), audit.clone(), retry);

        Self {
            requisitions: RequisitionService::new(
                db.clone(),
                event_sender.clone(),
                audit.clone(),
                master_data.clone(),
                retry,
            ),
            quotations: QuotationService::new(
                db.clone(),
                event_sender.clone(),
                audit.clone(),
                master_data.clone(),
                ledger.clone(),
                retry,
            ),
            catalog: OfferCatalogService::new(db.clone()),
            awards: AwardCommitService::new(
                db.clone(),
                event_sender.clone(),
                audit.clone(),
                master_data.clone(),
                ledger.clone(),
                retry,
                delivery_fallback_days,
            ),
            purchase_orders: PurchaseOrderService::new(
                db.clone(),
                event_sender.clone(),
                audit.clone(),
                ledger.clone(),
                retry,
            ),
            receipts: ReceiptService::new(
                db,
                event_sender,
                audit,
                master_data,
                stock_ledger,
                ledger.clone(),
                retry,
            ),
            ledger,
        }
    }
}
