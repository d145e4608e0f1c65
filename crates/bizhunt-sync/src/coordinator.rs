//! Drives site adapters through one run: enumerate, fetch, merge, sweep, report.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bizhunt_adapters::{AdapterError, SiteAdapter, UrlListing};
use bizhunt_core::{
    identify, ListingId, MergeKind, RunStatus, ScraperRun, SourceFailure, SourceReport,
    SourceState,
};
use bizhunt_storage::{ListingStore, SimpleTokenBucket, TokenBucketConfig};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::RunPolicy;
use crate::engine::{with_persistence_retry, MergeEngine};

/// Which registered sources a run covers. On the wire: `"all"` or a list of ids.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SourceSelection {
    #[default]
    All,
    Only(Vec<String>),
}

impl Serialize for SourceSelection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SourceSelection::All => serializer.serialize_str("all"),
            SourceSelection::Only(names) => names.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for SourceSelection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Keyword(String),
            List(Vec<String>),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Keyword(word) => SourceSelection::from_names([word]),
            Repr::List(names) => SourceSelection::from_names(names),
        })
    }
}

impl SourceSelection {
    /// `all` anywhere in the list selects every source.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names
            .into_iter()
            .map(Into::into)
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        if names.is_empty() || names.iter().any(|n| n.eq_ignore_ascii_case("all")) {
            SourceSelection::All
        } else {
            SourceSelection::Only(names)
        }
    }

    pub fn label(&self) -> String {
        match self {
            SourceSelection::All => "all".to_string(),
            SourceSelection::Only(names) => names.join(","),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub sources: SourceSelection,
    #[serde(default)]
    pub max_listings_per_source: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interruption {
    Cancelled,
    DeadlineExceeded,
}

impl fmt::Display for Interruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interruption::Cancelled => f.write_str("run cancelled"),
            Interruption::DeadlineExceeded => f.write_str("run deadline exceeded"),
        }
    }
}

/// Cancellation token plus the run's wall-clock deadline.
#[derive(Clone)]
struct StopSignal {
    token: CancellationToken,
    deadline: Instant,
}

impl StopSignal {
    fn check(&self) -> Option<Interruption> {
        if self.token.is_cancelled() {
            Some(Interruption::Cancelled)
        } else if Instant::now() >= self.deadline {
            Some(Interruption::DeadlineExceeded)
        } else {
            None
        }
    }

    async fn stopped(&self) -> Interruption {
        tokio::select! {
            _ = self.token.cancelled() => Interruption::Cancelled,
            _ = tokio::time::sleep_until(self.deadline) => Interruption::DeadlineExceeded,
        }
    }

    /// Drive `fut` unless the run stops first; a dropped fetch leaves nothing half-merged.
    async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, Interruption> {
        tokio::select! {
            biased;
            reason = self.stopped() => Err(reason),
            out = fut => Ok(out),
        }
    }
}

struct SourceSlot {
    adapter: Arc<dyn SiteAdapter>,
    concurrency: usize,
    requests_per_second: f64,
}

impl SourceSlot {
    fn id(&self) -> &str {
        self.adapter.source_id()
    }
}

enum UrlResult {
    Merged(ListingId, MergeKind),
    Failed(String),
    Abandoned(Interruption),
}

struct UrlOutcome {
    url: String,
    requests: usize,
    result: UrlResult,
}

enum EnumerationError {
    Failed(AdapterError),
    Interrupted(Interruption),
}

pub struct RunCoordinator {
    engine: MergeEngine,
    policy: RunPolicy,
    sources: Vec<SourceSlot>,
    /// Enabled sources whose adapter could not be built, with the reason.
    unavailable: Vec<(String, String)>,
}

impl RunCoordinator {
    pub fn new(store: Arc<dyn ListingStore>, policy: RunPolicy) -> Self {
        Self {
            engine: MergeEngine::new(store, policy.persistence_backoff),
            policy,
            sources: Vec::new(),
            unavailable: Vec::new(),
        }
    }

    /// Register an adapter; `None` falls back to the policy defaults.
    pub fn with_source(
        mut self,
        adapter: Arc<dyn SiteAdapter>,
        concurrency: Option<usize>,
        requests_per_second: Option<f64>,
    ) -> Self {
        let slot = SourceSlot {
            concurrency: concurrency.unwrap_or(self.policy.default_concurrency).max(1),
            requests_per_second: requests_per_second.unwrap_or(self.policy.default_rps),
            adapter,
        };
        self.sources.retain(|s| s.id() != slot.id());
        self.unavailable.retain(|(id, _)| id != slot.id());
        self.sources.push(slot);
        self
    }

    /// Keep a source that cannot run in the roster so every run reports it as failed.
    pub fn with_unavailable_source(
        mut self,
        source_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let source_id = source_id.into();
        self.sources.retain(|s| s.id() != source_id);
        self.unavailable.retain(|(id, _)| *id != source_id);
        self.unavailable.push((source_id, reason.into()));
        self
    }

    pub fn unavailable_source_ids(&self) -> Vec<String> {
        self.unavailable.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.id().to_string()).collect()
    }

    pub fn store(&self) -> &Arc<dyn ListingStore> {
        self.engine.store()
    }

    pub fn policy(&self) -> &RunPolicy {
        &self.policy
    }

    /// Execute one run. Never fails: every problem ends up in the returned report.
    pub async fn run(&self, request: &RunRequest, cancel: CancellationToken) -> ScraperRun {
        let mut run = ScraperRun::pending(request.sources.label(), Utc::now());
        let span = info_span!("run", run_id = %run.run_id, sources = %run.source);
        async move {
            run.status = RunStatus::Running;
            if let Err(err) = self.store().record_run(&run).await {
                warn!(error = %err, "could not record run start");
            }

            let (slots, missing) = self.resolve(&request.sources);
            info!(
                sources = slots.len(),
                unavailable = missing.len(),
                max_listings = ?request.max_listings_per_source,
                "run started"
            );

            let stop = StopSignal {
                token: cancel.child_token(),
                deadline: Instant::now() + self.policy.run_deadline,
            };
            let observed_at = run.start_time;
            let reports = join_all(slots.iter().map(|slot| {
                self.run_source(slot, request.max_listings_per_source, &stop, observed_at)
                    .instrument(info_span!("source", source = %slot.id()))
            }))
            .await;

            for (name, reason) in missing {
                let failure = SourceFailure::new(&name, reason);
                error!(source = %name, "{failure}");
                run.absorb(SourceReport::failed(name, &failure));
            }
            for report in reports {
                run.absorb(report);
            }
            run.finish(Utc::now());

            info!(
                status = %run.status,
                total_found = run.total_found,
                new = run.new,
                updated = run.updated,
                deactivated = run.deactivated,
                errors = run.error_count,
                "run finished"
            );

            let store = self.store();
            if let Err(err) =
                with_persistence_retry(&self.policy.persistence_backoff, "record_run", || {
                    store.record_run(&run)
                })
                .await
            {
                error!(error = %err, "could not record run report");
            }
            if let Err(err) = store.flush().await {
                error!(error = %err, "could not flush listing store");
            }
            run
        }
        .instrument(span)
        .await
    }

    /// Runnable slots, plus `(source, reason)` for every selected source that cannot run.
    fn resolve(&self, selection: &SourceSelection) -> (Vec<&SourceSlot>, Vec<(String, String)>) {
        match selection {
            SourceSelection::All => (self.sources.iter().collect(), self.unavailable.clone()),
            SourceSelection::Only(names) => {
                let mut slots = Vec::new();
                let mut missing = Vec::new();
                let mut requested = HashSet::new();
                for name in names {
                    if !requested.insert(name.as_str()) {
                        continue;
                    }
                    match self.sources.iter().find(|s| s.id() == name) {
                        Some(slot) => slots.push(slot),
                        None => {
                            let reason = self
                                .unavailable
                                .iter()
                                .find(|(id, _)| id == name)
                                .map(|(_, reason)| reason.clone())
                                .unwrap_or_else(|| "no adapter registered for source".to_string());
                            missing.push((name.clone(), reason));
                        }
                    }
                }
                (slots, missing)
            }
        }
    }

    async fn run_source(
        &self,
        slot: &SourceSlot,
        limit: Option<usize>,
        stop: &StopSignal,
        observed_at: DateTime<Utc>,
    ) -> SourceReport {
        let source = slot.id();
        let mut report = SourceReport::new(source);

        report.state = SourceState::FetchingUrls;
        let listing = match self.enumerate(slot, limit, stop, &mut report).await {
            Ok(listing) => listing,
            Err(EnumerationError::Interrupted(reason)) => {
                warn!(%reason, "url enumeration interrupted");
                report.state = SourceState::Incomplete;
                report.record_error(format!("url enumeration abandoned: {reason}"));
                return report;
            }
            Err(EnumerationError::Failed(err)) => {
                let failure = SourceFailure::new(source, err.to_string());
                error!(error = %err, "url enumeration failed; source skipped without sweep");
                report.state = SourceState::Failed;
                report.record_error(failure.to_string());
                return report;
            }
        };

        let mut truncated = listing.truncated;
        let mut urls = listing.urls;
        if let Some(limit) = limit {
            if urls.len() > limit {
                urls.truncate(limit);
                truncated = true;
            }
        }

        let mut seen: HashSet<ListingId> = HashSet::new();
        let mut targets = Vec::with_capacity(urls.len());
        for url in urls {
            match identify(source, &url) {
                Ok((listing_id, _)) => {
                    if seen.insert(listing_id) {
                        targets.push(url);
                    }
                }
                Err(err) => {
                    warn!(url = %url, error = %err, "skipping unusable listing url");
                    report.record_error(err.to_string());
                }
            }
        }
        report.total_found = targets.len();

        report.state = SourceState::FetchingDetails;
        let bucket = TokenBucketConfig::per_second(slot.requests_per_second).map(SimpleTokenBucket::new);
        let outcomes: Vec<UrlOutcome> = stream::iter(targets)
            .map(|url| self.process_url(slot, url, bucket.as_ref(), stop, observed_at))
            .buffer_unordered(slot.concurrency)
            .collect()
            .await;

        let mut interrupted = None;
        for outcome in outcomes {
            report.requests_made += outcome.requests;
            match outcome.result {
                UrlResult::Merged(listing_id, kind) => {
                    seen.insert(listing_id);
                    match kind {
                        MergeKind::New => report.new += 1,
                        MergeKind::Updated => report.updated += 1,
                        MergeKind::Unchanged => report.unchanged += 1,
                    }
                }
                UrlResult::Failed(message) => report.record_error(message),
                UrlResult::Abandoned(reason) => {
                    interrupted = Some(reason);
                    report.record_error(format!("{}: abandoned ({reason})", outcome.url));
                }
            }
        }

        report.state = SourceState::Finalizing;
        match (interrupted, truncated) {
            (Some(reason), _) => {
                warn!(%reason, "source interrupted; inactive sweep skipped");
            }
            (None, true) => {
                info!("enumeration stopped at the listing limit; inactive sweep skipped");
            }
            (None, false) => match self.engine.sweep(source, &seen).await {
                Ok(count) => {
                    report.deactivated = count;
                    report.swept = true;
                }
                Err(err) => {
                    error!(error = %err, "inactive sweep failed");
                    report.record_error(format!("inactive sweep failed: {err}"));
                }
            },
        }

        report.state = if interrupted.is_some() {
            SourceState::Incomplete
        } else {
            SourceState::Done
        };
        info!(
            state = ?report.state,
            total_found = report.total_found,
            new = report.new,
            updated = report.updated,
            unchanged = report.unchanged,
            deactivated = report.deactivated,
            errors = report.error_count,
            "source finished"
        );
        report
    }

    /// List the catalog, repeating the whole enumeration on transient failures.
    async fn enumerate(
        &self,
        slot: &SourceSlot,
        limit: Option<usize>,
        stop: &StopSignal,
        report: &mut SourceReport,
    ) -> Result<UrlListing, EnumerationError> {
        let backoff = &self.policy.fetch_backoff;
        let mut attempt = 0;
        loop {
            if let Some(reason) = stop.check() {
                return Err(EnumerationError::Interrupted(reason));
            }
            let result = stop
                .guard(slot.adapter.list_urls(limit))
                .await
                .map_err(EnumerationError::Interrupted)?;
            match result {
                Ok(listing) => {
                    report.pages_scraped += listing.pages_scraped;
                    report.requests_made += listing.pages_scraped;
                    return Ok(listing);
                }
                Err(err) => {
                    // A failed attempt issued at least its first search request.
                    report.requests_made += 1;
                    if !err.is_transient() || attempt + 1 >= backoff.max_attempts() {
                        return Err(EnumerationError::Failed(err));
                    }
                    let delay = backoff.jittered_delay(attempt, &mut rand::thread_rng());
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "url enumeration failed; retrying"
                    );
                    stop.guard(tokio::time::sleep(delay))
                        .await
                        .map_err(EnumerationError::Interrupted)?;
                    attempt += 1;
                }
            }
        }
    }

    async fn process_url(
        &self,
        slot: &SourceSlot,
        url: String,
        bucket: Option<&SimpleTokenBucket>,
        stop: &StopSignal,
        observed_at: DateTime<Utc>,
    ) -> UrlOutcome {
        let source = slot.id();
        let backoff = &self.policy.fetch_backoff;
        let mut requests = 0;
        let mut attempt = 0;

        let raw = loop {
            if let Some(reason) = stop.check() {
                return UrlOutcome { url, requests, result: UrlResult::Abandoned(reason) };
            }
            let fetch = async {
                if let Some(bucket) = bucket {
                    bucket.take().await;
                }
                slot.adapter.fetch_listing(&url).await
            };
            let guarded = stop.guard(fetch).await;
            let result = match guarded {
                Ok(result) => result,
                Err(reason) => {
                    return UrlOutcome { url, requests, result: UrlResult::Abandoned(reason) };
                }
            };
            requests += 1;

            match result {
                Ok(raw) => break raw,
                Err(err) if err.is_transient() && attempt + 1 < backoff.max_attempts() => {
                    let delay = backoff.jittered_delay(attempt, &mut rand::thread_rng());
                    warn!(
                        url = %url,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient fetch error; retrying"
                    );
                    if let Err(reason) = stop.guard(tokio::time::sleep(delay)).await {
                        return UrlOutcome { url, requests, result: UrlResult::Abandoned(reason) };
                    }
                    attempt += 1;
                }
                Err(err) => {
                    let err = if err.is_transient() { err.into_permanent() } else { err };
                    warn!(url = %url, attempts = attempt + 1, error = %err, "listing fetch failed");
                    return UrlOutcome { url, requests, result: UrlResult::Failed(err.to_string()) };
                }
            }
        };

        let result = match self.engine.process(source, &raw, observed_at).await {
            Ok(outcome) => UrlResult::Merged(outcome.listing.listing_id, outcome.kind),
            Err(err) => {
                warn!(url = %url, error = %err, "could not merge listing");
                UrlResult::Failed(format!("{url}: {err}"))
            }
        };
        UrlOutcome { url, requests, result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_accepts_keyword_or_list() {
        let all: RunRequest = serde_json::from_str(r#"{"sources":"all"}"#).unwrap();
        assert_eq!(all.sources, SourceSelection::All);
        assert_eq!(all.max_listings_per_source, None);

        let some: RunRequest =
            serde_json::from_str(r#"{"sources":["flippa","bizquest"],"max_listings_per_source":10}"#)
                .unwrap();
        assert_eq!(
            some.sources,
            SourceSelection::Only(vec!["flippa".into(), "bizquest".into()])
        );
        assert_eq!(some.max_listings_per_source, Some(10));

        let default: RunRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(default.sources, SourceSelection::All);
    }

    #[test]
    fn all_in_a_list_selects_everything() {
        assert_eq!(SourceSelection::from_names(["flippa", "ALL"]), SourceSelection::All);
        assert_eq!(SourceSelection::from_names(Vec::<String>::new()), SourceSelection::All);
        assert_eq!(
            SourceSelection::from_names(["flippa"]).label(),
            "flippa".to_string()
        );
    }

    #[test]
    fn selection_serializes_back_to_its_wire_form() {
        let json = serde_json::to_value(RunRequest::default()).unwrap();
        assert_eq!(json["sources"], "all");
    }
}
