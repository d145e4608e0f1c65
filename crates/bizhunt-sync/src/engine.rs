//! Normalize -> load prior -> merge -> upsert for one observed listing.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use bizhunt_core::merge::ListingObservation;
use bizhunt_core::{
    merge_observation, IdentityError, ListingId, MergeOutcome, PersistenceError, RawListing,
};
use bizhunt_storage::{BackoffPolicy, ListingStore};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

fn retryable(err: &PersistenceError) -> bool {
    !matches!(err, PersistenceError::Serialization(_))
}

/// Run a persistence call, retrying backend and availability errors with jittered backoff.
pub async fn with_persistence_retry<T, F, Fut>(
    policy: &BackoffPolicy,
    what: &str,
    mut op: F,
) -> Result<T, PersistenceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PersistenceError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if retryable(&err) && attempt + 1 < policy.max_attempts() => {
                let delay = policy.jittered_delay(attempt, &mut rand::thread_rng());
                warn!(
                    what,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "persistence call failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Clone)]
pub struct MergeEngine {
    store: Arc<dyn ListingStore>,
    retry: BackoffPolicy,
}

impl MergeEngine {
    pub fn new(store: Arc<dyn ListingStore>, retry: BackoffPolicy) -> Self {
        Self { store, retry }
    }

    pub fn store(&self) -> &Arc<dyn ListingStore> {
        &self.store
    }

    pub fn retry_policy(&self) -> &BackoffPolicy {
        &self.retry
    }

    /// Merge one raw record into storage and report what happened to it.
    ///
    /// Read-merge-write with no lock held: at most one call per listing id
    /// may be in flight (see [`ListingStore`]).
    pub async fn process(
        &self,
        source: &str,
        raw: &RawListing,
        observed_at: DateTime<Utc>,
    ) -> Result<MergeOutcome, MergeError> {
        let observation = ListingObservation::from_raw(source, raw)?;
        for (kind, text) in observation.parse_failures() {
            warn!(
                source,
                url = %observation.source_url,
                field = %kind,
                raw = text,
                "could not interpret financial text; keeping last known value"
            );
        }

        let prior = with_persistence_retry(&self.retry, "get", || {
            self.store.get(observation.listing_id)
        })
        .await?;
        let outcome = merge_observation(prior.as_ref(), &observation, observed_at);
        with_persistence_retry(&self.retry, "upsert", || self.store.upsert(&outcome.listing))
            .await?;

        debug!(
            source,
            listing_id = %outcome.listing.listing_id,
            kind = ?outcome.kind,
            "merged listing"
        );
        Ok(outcome)
    }

    /// Deactivate the source's listings that were not part of this observation set.
    pub async fn sweep(
        &self,
        source: &str,
        seen: &HashSet<ListingId>,
    ) -> Result<usize, PersistenceError> {
        with_persistence_retry(&self.retry, "mark_inactive_except", || {
            self.store.mark_inactive_except(source, seen)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bizhunt_core::MergeKind;
    use bizhunt_storage::MemoryListingStore;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, hour, 0, 0).single().unwrap()
    }

    fn quick_retry() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn process_reports_new_then_unchanged() {
        let store = Arc::new(MemoryListingStore::new());
        let engine = MergeEngine::new(store.clone(), quick_retry());
        let mut raw = RawListing::new("https://quietlight.com/listings/widget-co?utm_source=x");
        raw.title = Some("Widget Co".into());
        raw.asking_price = Some("$1.2M".into());

        let first = engine.process("quietlight", &raw, at(1)).await.unwrap();
        assert_eq!(first.kind, MergeKind::New);
        let second = engine.process("quietlight", &raw, at(2)).await.unwrap();
        assert_eq!(second.kind, MergeKind::Unchanged);
        assert_eq!(second.listing.last_verified, Some(at(2)));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn invalid_url_is_an_identity_error() {
        let engine = MergeEngine::new(Arc::new(MemoryListingStore::new()), quick_retry());
        let err = engine
            .process("quietlight", &RawListing::new("not a url"), at(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::Identity(_)));
    }

    #[tokio::test]
    async fn retry_gives_up_after_the_attempt_cap() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_persistence_retry(&quick_retry(), "upsert", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(PersistenceError::Unavailable("down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn serialization_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_persistence_retry(&quick_retry(), "upsert", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(PersistenceError::Serialization("bad".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
