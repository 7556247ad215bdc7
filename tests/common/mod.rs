#![allow(dead_code)]

use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use stateset_procurement::{
    audit::InMemoryAuditSink,
    auth::{Actor, ActorRole},
    db::{self, transaction::RetryPolicy, DbConfig, DbPool},
    events::{Event, EventSender},
    integrations::{InMemoryMasterData, InMemoryStockLedger, ReferenceKind},
    models::{purchase_order, PurchaseOrderStatus},
    services::{
        award_commit::{AcceptedOffer, AwardCommitRequest, AwardCommitResult},
        purchase_orders::TransitionRequest,
        quotations::{OfferInput, QuotationResponse, RegisterQuotationRequest},
        requisitions::{CreateRequisitionRequest, RequiredProductInput, RequisitionDetails},
    },
    ProcurementServices, ServiceDependencies,
};
use tokio::sync::mpsc;
use uuid::Uuid;

pub const DELIVERY_FALLBACK_DAYS: i64 = 14;

/// Procurement services over a private in-memory SQLite database with in-memory
/// collaborators that tests can inspect and reconfigure.
pub struct TestProcurement {
    pub services: ProcurementServices,
    pub db: Arc<DbPool>,
    pub master_data: Arc<InMemoryMasterData>,
    pub stock_ledger: Arc<InMemoryStockLedger>,
    pub audit: Arc<InMemoryAuditSink>,
    pub buyer: Actor,
    pub receiver: Actor,
    events: mpsc::Receiver<Event>,
}

/// A requisition with one or more quoted suppliers, ready to be awarded.
pub struct QuotedRequisition {
    pub requisition_id: Uuid,
    pub product_id: Uuid,
    pub quotations: Vec<SupplierQuote>,
}

#[derive(Debug, Clone, Copy)]
pub struct SupplierQuote {
    pub quotation_id: Uuid,
    pub supplier_id: Uuid,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub eta: Option<NaiveDate>,
}

impl SupplierQuote {
    pub fn accept(&self, product_id: Uuid, quantity: i32) -> AcceptedOffer {
        AcceptedOffer {
            product_id,
            quotation_id: self.quotation_id,
            supplier_id: self.supplier_id,
            awarded_quantity: quantity,
            unit_price: self.unit_price,
            estimated_delivery_date: self.eta,
        }
    }
}

impl TestProcurement {
    pub async fn new() -> Self {
        let pool = db::establish_connection_with_config(&DbConfig::sqlite_in_memory())
            .await
            .expect("in-memory database");
        db::create_schema(&pool).await.expect("schema");
        let db = Arc::new(pool);

        let master_data = Arc::new(InMemoryMasterData::new());
        let stock_ledger = Arc::new(InMemoryStockLedger::new());
        let audit = Arc::new(InMemoryAuditSink::new());
        let (event_sender, events) = EventSender::channel(1024);

        let services = ProcurementServices::with_retry_policy(
            ServiceDependencies {
                db: db.clone(),
                event_sender,
                audit: audit.clone(),
                master_data: master_data.clone(),
                stock_ledger: stock_ledger.clone(),
            },
            RetryPolicy::immediate(5),
            DELIVERY_FALLBACK_DAYS,
        );

        Self {
            services,
            db,
            master_data,
            stock_ledger,
            audit,
            buyer: Actor::new(Uuid::new_v4(), "buyer", ActorRole::Buyer),
            receiver: Actor::new(Uuid::new_v4(), "dock", ActorRole::Receiver),
            events,
        }
    }

    pub fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    pub fn in_days(days: i64) -> NaiveDate {
        Self::today() + Duration::days(days)
    }

    pub fn active(&self, kind: ReferenceKind) -> Uuid {
        let id = Uuid::new_v4();
        self.master_data.register_active(kind, id);
        id
    }

    /// Events published so far, in order.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    pub async fn requisition(&self, lines: &[(Uuid, i32)]) -> RequisitionDetails {
        self.services
            .requisitions
            .create_requisition(
                &self.buyer,
                CreateRequisitionRequest {
                    reference: format!("REQ-{}", &Uuid::new_v4().simple().to_string()[..8]),
                    lines: lines
                        .iter()
                        .map(|(product_id, required_quantity)| RequiredProductInput {
                            product_id: *product_id,
                            required_quantity: *required_quantity,
                        })
                        .collect(),
                    notes: None,
                },
            )
            .await
            .expect("requisition created")
    }

    /// Registers a quotation for a fresh active supplier and records a single-offer response.
    pub async fn quote(
        &self,
        requisition_id: Uuid,
        product_id: Uuid,
        quantity: i32,
        unit_price: Decimal,
        eta: Option<NaiveDate>,
    ) -> SupplierQuote {
        let supplier_id = self.active(ReferenceKind::Supplier);
        self.quote_from(supplier_id, requisition_id, product_id, quantity, unit_price, eta)
            .await
    }

    pub async fn quote_from(
        &self,
        supplier_id: Uuid,
        requisition_id: Uuid,
        product_id: Uuid,
        quantity: i32,
        unit_price: Decimal,
        eta: Option<NaiveDate>,
    ) -> SupplierQuote {
        let quotation = self
            .services
            .quotations
            .register_quotation(
                &self.buyer,
                RegisterQuotationRequest {
                    requisition_id,
                    supplier_id,
                    currency: "usd".to_string(),
                    notes: None,
                },
            )
            .await
            .expect("quotation registered");

        let supplier = Actor::new(supplier_id, "supplier rep", ActorRole::Supplier);
        self.services
            .quotations
            .record_quotation_response(
                &supplier,
                QuotationResponse {
                    quotation_id: quotation.id,
                    additional_costs: Decimal::new(2500, 2),
                    offers: vec![OfferInput {
                        product_id,
                        quoted_quantity: quantity,
                        unit_price_quoted: unit_price,
                        estimated_delivery_date: eta,
                        conditions: None,
                    }],
                },
            )
            .await
            .expect("quotation response recorded");

        SupplierQuote {
            quotation_id: quotation.id,
            supplier_id,
            quantity,
            unit_price,
            eta,
        }
    }

    /// One product required `required` times, quoted by one supplier per `(qty, price, eta)`.
    pub async fn quoted_requisition(
        &self,
        required: i32,
        quotes: &[(i32, Decimal, Option<NaiveDate>)],
    ) -> QuotedRequisition {
        let product_id = self.active(ReferenceKind::Product);
        let requisition = self.requisition(&[(product_id, required)]).await;
        let mut quotations = Vec::new();
        for (quantity, price, eta) in quotes {
            quotations.push(
                self.quote(requisition.requisition.id, product_id, *quantity, *price, *eta)
                    .await,
            );
        }
        QuotedRequisition {
            requisition_id: requisition.requisition.id,
            product_id,
            quotations,
        }
    }

    pub async fn award(
        &self,
        requisition_id: Uuid,
        accepted_offers: Vec<AcceptedOffer>,
    ) -> AwardCommitResult {
        self.services
            .awards
            .commit_award(
                &self.buyer,
                AwardCommitRequest {
                    award_batch_id: Uuid::new_v4(),
                    requisition_id,
                    accepted_offers,
                },
            )
            .await
            .expect("award committed")
    }

    /// Walks a pending purchase order through the supplier to confirmation.
    pub async fn confirm(&self, purchase_order_id: Uuid) -> purchase_order::Model {
        self.transition(purchase_order_id, PurchaseOrderStatus::SentToSupplier)
            .await;
        self.transition(purchase_order_id, PurchaseOrderStatus::ConfirmedBySupplier)
            .await
    }

    pub async fn transition(
        &self,
        purchase_order_id: Uuid,
        target: PurchaseOrderStatus,
    ) -> purchase_order::Model {
        self.services
            .purchase_orders
            .transition(&self.buyer, TransitionRequest::new(purchase_order_id, target))
            .await
            .expect("transition accepted")
            .purchase_order
    }

    /// `(purchased, pending)` of the requisition line for `product_id`.
    pub async fn counters(&self, requisition_id: Uuid, product_id: Uuid) -> (i32, i32) {
        let details = self
            .services
            .requisitions
            .get_requisition(requisition_id)
            .await
            .expect("requisition");
        let line = details.line_for(product_id).expect("requisition line");
        (line.purchased_quantity, line.pending_po_quantity)
    }
}
