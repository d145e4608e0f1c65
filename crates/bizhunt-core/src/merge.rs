//! Reconciling a fresh observation into the last known listing state.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::identify;
use crate::normalize::{clean_text, normalize_financial, normalize_location, normalize_niches};
use crate::{
    Amount, FieldValue, FinancialField, FinancialKind, IdentityError, Listing, ListingId, Location,
    Period, RawListing,
};

/// One financial field as observed on this scrape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialObservation {
    pub raw: Option<String>,
    pub parsed: FieldValue<Amount>,
}

/// A raw adapter record after identity and field normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingObservation {
    pub listing_id: ListingId,
    pub source: String,
    pub source_url: String,
    pub title: FieldValue<String>,
    pub description: FieldValue<String>,
    pub category: FieldValue<String>,
    pub location_raw: FieldValue<String>,
    pub niches: FieldValue<BTreeSet<String>>,
    pub asking_price: FinancialObservation,
    pub revenue: FinancialObservation,
    pub profit: FinancialObservation,
    pub cash_flow: FinancialObservation,
}

impl ListingObservation {
    pub fn from_raw(source: &str, raw: &RawListing) -> Result<Self, IdentityError> {
        let (listing_id, source_url) = identify(source, &raw.url)?;
        let financial = |kind: FinancialKind| {
            let text = raw.financial(kind);
            FinancialObservation {
                raw: text.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
                parsed: normalize_financial(text, kind),
            }
        };
        let niches = normalize_niches(&raw.niches);
        Ok(Self {
            listing_id,
            source: source.to_string(),
            source_url,
            title: clean_text(raw.title.as_deref()),
            description: clean_text(raw.description.as_deref()),
            category: clean_text(raw.category.as_deref()),
            location_raw: clean_text(raw.location.as_deref()),
            niches: if niches.is_empty() {
                FieldValue::Absent
            } else {
                FieldValue::Present(niches)
            },
            asking_price: financial(FinancialKind::AskingPrice),
            revenue: financial(FinancialKind::Revenue),
            profit: financial(FinancialKind::Profit),
            cash_flow: financial(FinancialKind::CashFlow),
        })
    }

    pub fn financial(&self, kind: FinancialKind) -> &FinancialObservation {
        match kind {
            FinancialKind::AskingPrice => &self.asking_price,
            FinancialKind::Revenue => &self.revenue,
            FinancialKind::Profit => &self.profit,
            FinancialKind::CashFlow => &self.cash_flow,
        }
    }

    /// Financial fields whose text was present but not understood.
    pub fn parse_failures(&self) -> Vec<(FinancialKind, &str)> {
        FinancialKind::ALL
            .into_iter()
            .filter_map(|kind| match &self.financial(kind).parsed {
                FieldValue::ParseFailed(raw) => Some((kind, raw.as_str())),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeKind {
    New,
    /// Content changed, or an inactive listing reappeared.
    Updated,
    /// Re-observed with identical content; only `last_verified` moves.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub listing: Listing,
    pub kind: MergeKind,
}

const COMPLETENESS_WEIGHTS: &[(&str, f64)] = &[
    ("title", 0.15),
    ("asking_price", 0.20),
    ("revenue", 0.15),
    ("profit", 0.15),
    ("description", 0.10),
    ("location_raw", 0.08),
    ("niches", 0.10),
    ("category", 0.05),
    ("cash_flow", 0.02),
];

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

fn has_text(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

fn has_amount(field: &FinancialField) -> bool {
    field.value.is_some_and(|v| v > 0.0)
}

/// Weighted share of the important fields that carry a meaningful value.
pub fn completeness_score(listing: &Listing) -> f64 {
    let mut total = 0.0;
    let mut achieved = 0.0;
    for (field, weight) in COMPLETENESS_WEIGHTS {
        total += weight;
        let present = match *field {
            "title" => has_text(&listing.title),
            "description" => has_text(&listing.description),
            "category" => has_text(&listing.category),
            "location_raw" => has_text(&listing.location_raw),
            "niches" => !listing.niches.is_empty(),
            "asking_price" => has_amount(&listing.asking_price),
            "revenue" => has_amount(&listing.revenue),
            "profit" => has_amount(&listing.profit),
            "cash_flow" => has_amount(&listing.cash_flow),
            _ => false,
        };
        if present {
            achieved += weight;
        }
    }
    if total > 0.0 {
        round_to(achieved / total, 3)
    } else {
        0.0
    }
}

/// Value on a yearly basis; monthly figures are multiplied by twelve.
fn annualized(field: &FinancialField) -> Option<f64> {
    let value = field.value?;
    Some(match field.period {
        Some(Period::Monthly) => value * 12.0,
        _ => value,
    })
}

fn ratio(numerator: Option<f64>, denominator: Option<f64>) -> Option<f64> {
    match (numerator, denominator) {
        (Some(n), Some(d)) if d != 0.0 => Some(n / d),
        _ => None,
    }
}

/// Recompute multiples, margin and completeness from the current financial fields.
pub fn recompute_derived(listing: &mut Listing) {
    let price = listing.asking_price.value;
    let revenue = annualized(&listing.revenue);
    let profit = annualized(&listing.profit);

    listing.price_to_revenue_multiple = ratio(price, revenue).map(|r| round_to(r, 2));
    listing.price_to_profit_multiple = ratio(price, profit).map(|r| round_to(r, 2));
    listing.profit_margin_percent = ratio(profit, revenue).map(|r| round_to(r * 100.0, 2));
    listing.data_completeness_score = completeness_score(listing);
}

fn apply_text(target: &mut Option<String>, observed: &FieldValue<String>) {
    if let FieldValue::Present(value) = observed {
        *target = Some(value.clone());
    }
}

fn apply_financial(target: &mut FinancialField, observed: &FinancialObservation) {
    target.raw = observed.raw.clone();
    if let FieldValue::Present(amount) = &observed.parsed {
        target.value = Some(amount.value);
        target.currency = amount.currency.clone();
        target.period = Some(amount.period);
        target.range_derived = amount.range_derived;
    }
}

fn blank_listing(observation: &ListingObservation, observed_at: DateTime<Utc>) -> Listing {
    Listing {
        listing_id: observation.listing_id,
        source: observation.source.clone(),
        source_url: observation.source_url.clone(),
        title: None,
        description: None,
        category: None,
        location_raw: None,
        location: Location::default(),
        niches: BTreeSet::new(),
        asking_price: FinancialField::default(),
        revenue: FinancialField::default(),
        profit: FinancialField::default(),
        cash_flow: FinancialField::default(),
        price_to_revenue_multiple: None,
        price_to_profit_multiple: None,
        profit_margin_percent: None,
        data_completeness_score: 0.0,
        is_active: true,
        first_seen: observed_at,
        last_updated: observed_at,
        last_verified: Some(observed_at),
    }
}

/// Equality over everything a scrape can change; lifecycle timestamps excluded.
pub fn same_content(a: &Listing, b: &Listing) -> bool {
    a.listing_id == b.listing_id
        && a.source == b.source
        && a.source_url == b.source_url
        && a.title == b.title
        && a.description == b.description
        && a.category == b.category
        && a.location_raw == b.location_raw
        && a.location == b.location
        && a.niches == b.niches
        && a.asking_price == b.asking_price
        && a.revenue == b.revenue
        && a.profit == b.profit
        && a.cash_flow == b.cash_flow
        && a.price_to_revenue_multiple == b.price_to_revenue_multiple
        && a.price_to_profit_multiple == b.price_to_profit_multiple
        && a.profit_margin_percent == b.profit_margin_percent
        && a.data_completeness_score == b.data_completeness_score
}

/// Merge `observation` into `prior` (if any).
///
/// Text fields and numeric readings keep their last good value when the new
/// observation lacks them; financial raw text always tracks the latest scrape.
pub fn merge_observation(
    prior: Option<&Listing>,
    observation: &ListingObservation,
    observed_at: DateTime<Utc>,
) -> MergeOutcome {
    let mut listing = match prior {
        Some(prior) => prior.clone(),
        None => blank_listing(observation, observed_at),
    };

    apply_text(&mut listing.title, &observation.title);
    apply_text(&mut listing.description, &observation.description);
    apply_text(&mut listing.category, &observation.category);
    if let FieldValue::Present(location) = &observation.location_raw {
        listing.location_raw = Some(location.clone());
        listing.location = normalize_location(Some(location));
    }
    if let FieldValue::Present(niches) = &observation.niches {
        listing.niches = niches.clone();
    }
    for kind in FinancialKind::ALL {
        apply_financial(listing.financial_mut(kind), observation.financial(kind));
    }
    recompute_derived(&mut listing);

    let kind = match prior {
        None => MergeKind::New,
        Some(prior) if !prior.is_active || !same_content(prior, &listing) => MergeKind::Updated,
        Some(_) => MergeKind::Unchanged,
    };

    listing.is_active = true;
    listing.last_verified = Some(observed_at);
    if kind == MergeKind::Updated {
        listing.last_updated = observed_at.max(listing.first_seen);
    }

    MergeOutcome { listing, kind }
}
