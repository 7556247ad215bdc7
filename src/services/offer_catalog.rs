//! Read view joining a requisition's required lines with the offers of its open quotations.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{
    db::DbPool,
    errors::ServiceError,
    models::{
        quotation, quotation_offer, required_product_line, requisition, QuotationStatus,
        RequisitionStatus,
    },
    services::requisitions::load_requisition_aggregate,
};

/// One candidate offer for a required line, annotated with its quotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogOffer {
    pub offer_id: Uuid,
    pub quotation_id: Uuid,
    pub supplier_id: Uuid,
    pub quotation_status: QuotationStatus,
    pub product_id: Uuid,
    pub quoted_quantity: i32,
    pub unit_price_quoted: Decimal,
    pub estimated_delivery_date: Option<NaiveDate>,
    pub conditions: Option<String>,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogLine {
    pub line_id: Uuid,
    pub product_id: Uuid,
    pub required_quantity: i32,
    pub purchased_quantity: i32,
    pub pending_po_quantity: i32,
    pub offers: Vec<CatalogOffer>,
}

impl CatalogLine {
    pub fn net_remaining(&self) -> i32 {
        (self.required_quantity - self.purchased_quantity - self.pending_po_quantity).max(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferCatalog {
    pub requisition_id: Uuid,
    pub requisition_status: RequisitionStatus,
    pub lines: Vec<CatalogLine>,
}

impl OfferCatalog {
    pub fn line(&self, product_id: Uuid) -> Option<&CatalogLine> {
        self.lines.iter().find(|l| l.product_id == product_id)
    }
}

/// Builds the catalog from already-loaded rows. Quotations outside
/// {Received, PartiallyAwarded, Awarded} and offers for products the requisition does not
/// need are left out.
pub fn assemble_catalog(
    requisition: &requisition::Model,
    lines: &[required_product_line::Model],
    quotations: &[quotation::Model],
    offers: &[quotation_offer::Model],
) -> OfferCatalog {
    let open: HashMap<Uuid, &quotation::Model> = quotations
        .iter()
        .filter(|q| q.requisition_id == requisition.id && q.status.is_open())
        .map(|q| (q.id, q))
        .collect();

    let mut by_product: HashMap<Uuid, Vec<CatalogOffer>> = HashMap::new();
    for offer in offers {
        let Some(quotation) = open.get(&offer.quotation_id) else {
            continue;
        };
        by_product
            .entry(offer.product_id)
            .or_default()
            .push(CatalogOffer {
                offer_id: offer.id,
                quotation_id: quotation.id,
                supplier_id: quotation.supplier_id,
                quotation_status: quotation.status,
                product_id: offer.product_id,
                quoted_quantity: offer.quoted_quantity,
                unit_price_quoted: offer.unit_price_quoted,
                estimated_delivery_date: offer.estimated_delivery_date,
                conditions: offer.conditions.clone(),
                currency: quotation.currency.clone(),
            });
    }

    let lines = lines
        .iter()
        .map(|line| CatalogLine {
            line_id: line.id,
            product_id: line.product_id,
            required_quantity: line.required_quantity,
            purchased_quantity: line.purchased_quantity,
            pending_po_quantity: line.pending_po_quantity,
            offers: by_product.remove(&line.product_id).unwrap_or_default(),
        })
        .collect();

    OfferCatalog {
        requisition_id: requisition.id,
        requisition_status: requisition.status,
        lines,
    }
}

#[derive(Clone)]
pub struct OfferCatalogService {
    db: Arc<DbPool>,
}

impl OfferCatalogService {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub async fn build_catalog(&self, requisition_id: Uuid) -> Result<OfferCatalog, ServiceError> {
        let db = self.db.as_ref();
        let (requisition, lines) = load_requisition_aggregate(db, requisition_id).await?;

        let quotations = quotation::Entity::find()
            .filter(quotation::Column::RequisitionId.eq(requisition_id))
            .filter(quotation::Column::Status.is_in(QuotationStatus::OPEN))
            .all(db)
            .await?;
        let offers = quotation_offer::Entity::find()
            .filter(
                quotation_offer::Column::QuotationId
                    .is_in(quotations.iter().map(|q| q.id).collect::<Vec<_>>()),
            )
            .order_by_asc(quotation_offer::Column::Id)
            .all(db)
            .await?;

        let catalog = assemble_catalog(&requisition, &lines, &quotations, &offers);
        debug!(
            requisition_id = %requisition_id,
            quotations = quotations.len(),
            offers = offers.len(),
            "Offer catalog assembled"
        );
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn requisition() -> requisition::Model {
        let now = Utc::now();
        requisition::Model {
            id: Uuid::new_v4(),
            reference: "REQ-7".into(),
            status: RequisitionStatus::Quoted,
            notes: None,
            created_by: Uuid::new_v4(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    fn line(requisition_id: Uuid, product_id: Uuid) -> required_product_line::Model {
        let now = Utc::now();
        required_product_line::Model {
            id: Uuid::new_v4(),
            requisition_id,
            product_id,
            required_quantity: 100,
            purchased_quantity: 10,
            pending_po_quantity: 20,
            created_at: now,
            updated_at: now,
        }
    }

    fn quotation(requisition_id: Uuid, status: QuotationStatus) -> quotation::Model {
        let now = Utc::now();
        quotation::Model {
            id: Uuid::new_v4(),
            requisition_id,
            supplier_id: Uuid::new_v4(),
            status,
            additional_costs: dec!(0),
            currency: "USD".into(),
            notes: None,
            received_at: Some(now),
            created_by: Uuid::new_v4(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    fn offer(quotation_id: Uuid, product_id: Uuid) -> quotation_offer::Model {
        quotation_offer::Model {
            id: Uuid::new_v4(),
            quotation_id,
            product_id,
            quoted_quantity: 50,
            unit_price_quoted: dec!(4.20),
            estimated_delivery_date: None,
            conditions: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn only_open_quotations_contribute_offers() {
        let req = requisition();
        let product = Uuid::new_v4();
        let received = quotation(req.id, QuotationStatus::Received);
        let rejected = quotation(req.id, QuotationStatus::Rejected);
        let sent = quotation(req.id, QuotationStatus::Sent);
        let offers = vec![
            offer(received.id, product),
            offer(rejected.id, product),
            offer(sent.id, product),
        ];

        let catalog = assemble_catalog(
            &req,
            &[line(req.id, product)],
            &[received.clone(), rejected, sent],
            &offers,
        );

        let line = catalog.line(product).unwrap();
        assert_eq!(line.offers.len(), 1);
        assert_eq!(line.offers[0].quotation_id, received.id);
        assert_eq!(line.offers[0].supplier_id, received.supplier_id);
        assert_eq!(line.net_remaining(), 70);
    }

    #[test]
    fn offers_for_unrequired_products_are_ignored() {
        let req = requisition();
        let product = Uuid::new_v4();
        let q = quotation(req.id, QuotationStatus::Awarded);
        let catalog = assemble_catalog(
            &req,
            &[line(req.id, product)],
            &[q.clone()],
            &[offer(q.id, Uuid::new_v4())],
        );
        assert!(catalog.lines[0].offers.is_empty());
    }
}
