//! Advisory offer selection.
//!
//! Each required line is solved independently: filter the candidate offers, rank them,
//! and suggest the winner for `min(quoted, net remaining)` units. Ranking is total, so the
//! same catalog and policy always yield the same suggestions.

use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::services::{
    award_commit::AcceptedOffer,
    offer_catalog::{CatalogLine, CatalogOffer, OfferCatalog},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizerPolicy {
    /// Only offers delivering within this many days from today are eligible.
    pub eta_ceiling_days: Option<i64>,
}

impl OptimizerPolicy {
    pub fn with_eta_ceiling(days: i64) -> Self {
        Self {
            eta_ceiling_days: Some(days),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum Coverage {
    Full,
    Partial,
}

/// Why an offer won its line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionReason {
    pub covers_net_remaining: bool,
    pub unit_price: Decimal,
    pub estimated_delivery_date: Option<NaiveDate>,
    pub candidates: usize,
    pub eligible: usize,
}

impl fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.covers_net_remaining {
            write!(
                f,
                "covers the remaining demand at {}, the lowest price among covering offers",
                self.unit_price
            )?;
        } else {
            write!(
                f,
                "no eligible offer covers the remaining demand; lowest price {}",
                self.unit_price
            )?;
        }
        write!(f, " ({} eligible of {} considered)", self.eligible, self.candidates)?;
        if let Some(eta) = self.estimated_delivery_date {
            write!(f, ", delivering {}", eta)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferSuggestion {
    pub line_id: Uuid,
    pub product_id: Uuid,
    pub offer_id: Uuid,
    pub quotation_id: Uuid,
    pub supplier_id: Uuid,
    pub net_remaining: i32,
    pub suggested_quantity: i32,
    pub unit_price: Decimal,
    pub estimated_delivery_date: Option<NaiveDate>,
    pub coverage: Coverage,
    pub reason: SelectionReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum InfeasibleReason {
    NoOffers,
    NoOfferWithinEtaCeiling,
}

/// A line that still needs units but has no eligible offer. A warning, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfeasibleSelection {
    pub line_id: Uuid,
    pub product_id: Uuid,
    pub net_remaining: i32,
    pub reason: InfeasibleReason,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionResult {
    pub suggestions: Vec<OfferSuggestion>,
    pub warnings: Vec<InfeasibleSelection>,
    /// Lines that need nothing more.
    pub satisfied_lines: Vec<Uuid>,
}

impl SelectionResult {
    /// Turns every suggestion into an accepted offer, ready for an award commit.
    pub fn into_accepted_offers(&self) -> Vec<AcceptedOffer> {
        self.suggestions
            .iter()
            .map(|s| AcceptedOffer {
                product_id: s.product_id,
                quotation_id: s.quotation_id,
                supplier_id: s.supplier_id,
                awarded_quantity: s.suggested_quantity,
                unit_price: s.unit_price,
                estimated_delivery_date: s.estimated_delivery_date,
            })
            .collect()
    }
}

fn within_ceiling(offer: &CatalogOffer, today: NaiveDate, ceiling_days: Option<i64>) -> bool {
    match ceiling_days {
        None => true,
        Some(days) => offer
            .estimated_delivery_date
            .map(|eta| eta >= today && eta <= today + Duration::days(days))
            .unwrap_or(false),
    }
}

/// Full coverage first, then price, then earliest delivery (unknown last), then offer id.
fn rank(a: &CatalogOffer, b: &CatalogOffer, net_remaining: i32) -> Ordering {
    let covers = |o: &CatalogOffer| o.quoted_quantity >= net_remaining;
    covers(b)
        .cmp(&covers(a))
        .then_with(|| a.unit_price_quoted.cmp(&b.unit_price_quoted))
        .then_with(|| match (a.estimated_delivery_date, b.estimated_delivery_date) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.offer_id.cmp(&b.offer_id))
}

fn select_line(
    line: &CatalogLine,
    policy: &OptimizerPolicy,
    today: NaiveDate,
) -> Result<Option<OfferSuggestion>, InfeasibleSelection> {
    let net_remaining = line.net_remaining();
    if net_remaining <= 0 {
        return Ok(None);
    }

    let with_quantity: Vec<&CatalogOffer> =
        line.offers.iter().filter(|o| o.quoted_quantity > 0).collect();
    let mut eligible: Vec<&CatalogOffer> = with_quantity
        .iter()
        .copied()
        .filter(|o| within_ceiling(o, today, policy.eta_ceiling_days))
        .collect();

    if eligible.is_empty() {
        let reason = if with_quantity.is_empty() {
            InfeasibleReason::NoOffers
        } else {
            InfeasibleReason::NoOfferWithinEtaCeiling
        };
        return Err(InfeasibleSelection {
            line_id: line.line_id,
            product_id: line.product_id,
            net_remaining,
            reason,
        });
    }

    eligible.sort_by(|a, b| rank(a, b, net_remaining));
    let best = eligible[0];
    let suggested_quantity = best.quoted_quantity.min(net_remaining);
    let covers = suggested_quantity >= net_remaining;

    Ok(Some(OfferSuggestion {
        line_id: line.line_id,
        product_id: line.product_id,
        offer_id: best.offer_id,
        quotation_id: best.quotation_id,
        supplier_id: best.supplier_id,
        net_remaining,
        suggested_quantity,
        unit_price: best.unit_price_quoted,
        estimated_delivery_date: best.estimated_delivery_date,
        coverage: if covers {
            Coverage::Full
        } else {
            Coverage::Partial
        },
        reason: SelectionReason {
            covers_net_remaining: covers,
            unit_price: best.unit_price_quoted,
            estimated_delivery_date: best.estimated_delivery_date,
            candidates: line.offers.len(),
            eligible: eligible.len(),
        },
    }))
}

/// Suggests one offer per unsatisfied line of `catalog`.
#[instrument(skip(catalog), fields(requisition_id = %catalog.requisition_id, lines = catalog.lines.len()))]
pub fn suggest_offers(
    catalog: &OfferCatalog,
    policy: &OptimizerPolicy,
    today: NaiveDate,
) -> SelectionResult {
    let mut result = SelectionResult::default();
    for line in &catalog.lines {
        match select_line(line, policy, today) {
            Ok(Some(suggestion)) => {
                debug!(
                    product_id = %suggestion.product_id,
                    offer_id = %suggestion.offer_id,
                    quantity = suggestion.suggested_quantity,
                    reason = %suggestion.reason,
                    "Offer suggested"
                );
                result.suggestions.push(suggestion);
            }
            Ok(None) => result.satisfied_lines.push(line.line_id),
            Err(warning) => {
                warn!(
                    product_id = %warning.product_id,
                    net_remaining = warning.net_remaining,
                    reason = %warning.reason,
                    "No eligible offer for required line"
                );
                result.warnings.push(warning);
            }
        }
    }
    result
}
