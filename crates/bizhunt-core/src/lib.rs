//! Core domain model for business-for-sale listings.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;
pub mod identity;
pub mod merge;
pub mod normalize;

pub use error::{FetchError, FetchErrorKind, IdentityError, ParseError, PersistenceError, SourceFailure};
pub use identity::{canonicalize_url, identify, listing_id, resolve_url};
pub use merge::{
    merge_observation, recompute_derived, same_content, FinancialObservation, ListingObservation,
    MergeKind, MergeOutcome,
};
pub use normalize::{normalize_financial, normalize_location, normalize_niches, parse_amount};

pub const CRATE_NAME: &str = "bizhunt-core";

/// Stable identity of a listing, derived from `(source, canonical url)`.
pub type ListingId = Uuid;

/// Outcome of turning one raw field into its canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum FieldValue<T> {
    Present(T),
    Absent,
    ParseFailed(String),
}

impl<T> FieldValue<T> {
    pub fn present(&self) -> Option<&T> {
        match self {
            FieldValue::Present(value) => Some(value),
            FieldValue::Absent | FieldValue::ParseFailed(_) => None,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, FieldValue::Present(_))
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            FieldValue::Present(value) => Some(value),
            FieldValue::Absent | FieldValue::ParseFailed(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> FieldValue<U> {
        match self {
            FieldValue::Present(value) => FieldValue::Present(f(value)),
            FieldValue::Absent => FieldValue::Absent,
            FieldValue::ParseFailed(raw) => FieldValue::ParseFailed(raw),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Annual,
    Monthly,
    Unspecified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinancialKind {
    AskingPrice,
    Revenue,
    Profit,
    CashFlow,
}

impl FinancialKind {
    pub const ALL: [FinancialKind; 4] = [
        FinancialKind::AskingPrice,
        FinancialKind::Revenue,
        FinancialKind::Profit,
        FinancialKind::CashFlow,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FinancialKind::AskingPrice => "asking_price",
            FinancialKind::Revenue => "revenue",
            FinancialKind::Profit => "profit",
            FinancialKind::CashFlow => "cash_flow",
        }
    }
}

impl fmt::Display for FinancialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical numeric reading of one financial string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Amount {
    pub value: f64,
    pub currency: String,
    pub period: Period,
    /// Value is the midpoint of a published range.
    pub range_derived: bool,
}

impl Amount {
    /// Canonical text form; normalizing it yields the same value, currency and period.
    pub fn canonical(&self) -> String {
        let suffix = match self.period {
            Period::Annual => " per year",
            Period::Monthly => " per month",
            Period::Unspecified => "",
        };
        format!("{} {:.2}{}", self.currency, self.value, suffix)
    }
}

pub const DEFAULT_CURRENCY: &str = "USD";

/// Stored financial field: the latest raw text plus the last good numeric reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialField {
    pub raw: Option<String>,
    pub value: Option<f64>,
    pub currency: String,
    pub period: Option<Period>,
    #[serde(default)]
    pub range_derived: bool,
}

impl Default for FinancialField {
    fn default() -> Self {
        Self {
            raw: None,
            value: None,
            currency: DEFAULT_CURRENCY.to_string(),
            period: None,
            range_derived: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Location {
    pub country: Option<String>,
    pub state: Option<String>,
    pub city: Option<String>,
}

impl Location {
    pub fn is_empty(&self) -> bool {
        self.country.is_none() && self.state.is_none() && self.city.is_none()
    }
}

/// Field map produced by a site adapter for one listing page. Every field is optional.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawListing {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub niches: Vec<String>,
    #[serde(default)]
    pub asking_price: Option<String>,
    #[serde(default)]
    pub revenue: Option<String>,
    #[serde(default)]
    pub profit: Option<String>,
    #[serde(default)]
    pub cash_flow: Option<String>,
}

impl RawListing {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn financial(&self, kind: FinancialKind) -> Option<&str> {
        match kind {
            FinancialKind::AskingPrice => self.asking_price.as_deref(),
            FinancialKind::Revenue => self.revenue.as_deref(),
            FinancialKind::Profit => self.profit.as_deref(),
            FinancialKind::CashFlow => self.cash_flow.as_deref(),
        }
    }

    pub fn financial_mut(&mut self, kind: FinancialKind) -> &mut Option<String> {
        match kind {
            FinancialKind::AskingPrice => &mut self.asking_price,
            FinancialKind::Revenue => &mut self.revenue,
            FinancialKind::Profit => &mut self.profit,
            FinancialKind::CashFlow => &mut self.cash_flow,
        }
    }
}

/// Canonical merged record for one marketplace ad.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub listing_id: ListingId,
    pub source: String,
    pub source_url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub location_raw: Option<String>,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub niches: BTreeSet<String>,
    pub asking_price: FinancialField,
    pub revenue: FinancialField,
    pub profit: FinancialField,
    pub cash_flow: FinancialField,
    pub price_to_revenue_multiple: Option<f64>,
    pub price_to_profit_multiple: Option<f64>,
    pub profit_margin_percent: Option<f64>,
    pub data_completeness_score: f64,
    pub is_active: bool,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub last_verified: Option<DateTime<Utc>>,
}

impl Listing {
    pub fn financial(&self, kind: FinancialKind) -> &FinancialField {
        match kind {
            FinancialKind::AskingPrice => &self.asking_price,
            FinancialKind::Revenue => &self.revenue,
            FinancialKind::Profit => &self.profit,
            FinancialKind::CashFlow => &self.cash_flow,
        }
    }

    pub fn financial_mut(&mut self, kind: FinancialKind) -> &mut FinancialField {
        match kind {
            FinancialKind::AskingPrice => &mut self.asking_price,
            FinancialKind::Revenue => &mut self.revenue,
            FinancialKind::Profit => &mut self.profit,
            FinancialKind::CashFlow => &mut self.cash_flow,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Partial,
    Error,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Partial | RunStatus::Error)
    }

    /// Terminal status for a set of finished sources.
    pub fn from_source_states<I: IntoIterator<Item = SourceState>>(states: I) -> RunStatus {
        let (mut ok, mut failed) = (0usize, 0usize);
        for state in states {
            if state.is_failure() {
                failed += 1;
            } else {
                ok += 1;
            }
        }
        match (ok, failed) {
            (0, _) => RunStatus::Error,
            (_, 0) => RunStatus::Success,
            _ => RunStatus::Partial,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// Lifecycle of one source within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Scheduled,
    FetchingUrls,
    FetchingDetails,
    Finalizing,
    Done,
    Failed,
    /// Cancelled or stopped by the run deadline before all URLs were processed.
    Incomplete,
}

impl SourceState {
    pub fn is_failure(self) -> bool {
        !matches!(self, SourceState::Done)
    }
}

/// Counters and outcome for one source within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: String,
    pub state: SourceState,
    pub total_found: usize,
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deactivated: usize,
    pub error_count: usize,
    pub pages_scraped: usize,
    pub requests_made: usize,
    /// Whether the "not observed => inactive" sweep ran for this source.
    pub swept: bool,
    pub errors: Vec<String>,
}

impl SourceReport {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            state: SourceState::Scheduled,
            total_found: 0,
            new: 0,
            updated: 0,
            unchanged: 0,
            deactivated: 0,
            error_count: 0,
            pages_scraped: 0,
            requests_made: 0,
            swept: false,
            errors: Vec::new(),
        }
    }

    pub fn failed(source: impl Into<String>, failure: &SourceFailure) -> Self {
        let mut report = Self::new(source);
        report.state = SourceState::Failed;
        report.error_count = 1;
        report.errors.push(failure.to_string());
        report
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.error_count += 1;
        self.errors.push(message.into());
    }
}

/// One execution of the run coordinator against one or more sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScraperRun {
    pub run_id: Uuid,
    pub source: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub total_found: usize,
    pub new: usize,
    pub updated: usize,
    pub deactivated: usize,
    pub error_count: usize,
    pub pages_scraped: usize,
    pub requests_made: usize,
    pub errors: Vec<String>,
    pub sources: Vec<SourceReport>,
}

impl ScraperRun {
    pub fn pending(source: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source: source.into(),
            start_time,
            end_time: None,
            status: RunStatus::Pending,
            total_found: 0,
            new: 0,
            updated: 0,
            deactivated: 0,
            error_count: 0,
            pages_scraped: 0,
            requests_made: 0,
            errors: Vec::new(),
            sources: Vec::new(),
        }
    }

    /// Fold a finished source's counters into the run totals.
    pub fn absorb(&mut self, report: SourceReport) {
        self.total_found += report.total_found;
        self.new += report.new;
        self.updated += report.updated;
        self.deactivated += report.deactivated;
        self.error_count += report.error_count;
        self.pages_scraped += report.pages_scraped;
        self.requests_made += report.requests_made;
        self.errors.extend(
            report
                .errors
                .iter()
                .map(|message| format!("{}: {message}", report.source)),
        );
        self.sources.push(report);
    }

    pub fn finish(&mut self, end_time: DateTime<Utc>) {
        self.end_time = Some(end_time);
        self.status = RunStatus::from_source_states(self.sources.iter().map(|s| s.state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(source: &str, state: SourceState) -> SourceReport {
        let mut report = SourceReport::new(source);
        report.state = state;
        report
    }

    #[test]
    fn run_status_follows_source_outcomes() {
        use SourceState::*;
        assert_eq!(RunStatus::from_source_states([Done, Done]), RunStatus::Success);
        assert_eq!(RunStatus::from_source_states([Done, Failed]), RunStatus::Partial);
        assert_eq!(RunStatus::from_source_states([Incomplete, Done]), RunStatus::Partial);
        assert_eq!(RunStatus::from_source_states([Failed, Incomplete]), RunStatus::Error);
        assert_eq!(RunStatus::from_source_states([]), RunStatus::Error);
    }

    #[test]
    fn absorb_accumulates_counters_and_prefixes_errors() {
        let start = Utc::now();
        let mut run = ScraperRun::pending("all", start);

        let mut a = report("flippa", SourceState::Done);
        a.total_found = 3;
        a.new = 2;
        a.updated = 1;
        a.record_error("permanent fetch error");
        let mut b = report("bizquest", SourceState::Failed);
        b.record_error("listing page returned 503");

        run.absorb(a);
        run.absorb(b);
        run.finish(start);

        assert_eq!(run.total_found, 3);
        assert_eq!(run.new, 2);
        assert_eq!(run.updated, 1);
        assert_eq!(run.error_count, 2);
        assert_eq!(run.status, RunStatus::Partial);
        assert_eq!(run.errors[0], "flippa: permanent fetch error");
        assert!(run.status.is_terminal());
    }

    #[test]
    fn run_report_serializes_snake_case_status() {
        let mut run = ScraperRun::pending("flippa", Utc::now());
        run.absorb(report("flippa", SourceState::Done));
        run.finish(Utc::now());
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["sources"][0]["state"], "done");
    }

    #[test]
    fn field_value_serializes_as_tagged_union() {
        let value: FieldValue<f64> = FieldValue::ParseFailed("call us".into());
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["state"], "parse_failed");
        assert_eq!(json["value"], "call us");
    }
}
