//! The listing persistence port and its in-process implementation.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bizhunt_core::{Listing, ListingId, PersistenceError, ScraperRun};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::archive::write_atomic;

/// Storage contract consumed by the merge engine and run coordinator.
///
/// `upsert` and `mark_inactive_except` are idempotent: repeating a call with
/// the same arguments leaves storage unchanged.
///
/// The merge engine reads a record with `get` and writes it back with
/// `upsert` without holding a lock across the two calls. Callers must give a
/// `listing_id` at most one writer at a time. A run deduplicates its targets
/// by id and ids are scoped to one source, so a single run satisfies this;
/// concurrent runs over the same source do not, and the web trigger
/// serializes runs for that reason.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn get(&self, listing_id: ListingId) -> Result<Option<Listing>, PersistenceError>;

    /// Insert or fully replace the record for `listing.listing_id`.
    async fn upsert(&self, listing: &Listing) -> Result<(), PersistenceError>;

    /// Deactivate active listings of `source` whose id is not in `seen`,
    /// leaving every other field as stored. Returns how many listings changed.
    async fn mark_inactive_except(
        &self,
        source: &str,
        seen: &HashSet<ListingId>,
    ) -> Result<usize, PersistenceError>;

    async fn list_by_source(&self, source: &str) -> Result<Vec<Listing>, PersistenceError>;

    async fn record_run(&self, run: &ScraperRun) -> Result<(), PersistenceError>;

    /// Most recent runs first.
    async fn recent_runs(&self, limit: usize) -> Result<Vec<ScraperRun>, PersistenceError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<ScraperRun>, PersistenceError>;

    /// Push buffered state to durable storage, if the backend buffers.
    async fn flush(&self) -> Result<(), PersistenceError> {
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreSnapshot {
    #[serde(default)]
    listings: Vec<Listing>,
    #[serde(default)]
    runs: Vec<ScraperRun>,
}

/// Listings held in memory, optionally persisted as one JSON document.
#[derive(Debug, Default)]
pub struct MemoryListingStore {
    listings: RwLock<HashMap<ListingId, Listing>>,
    runs: RwLock<Vec<ScraperRun>>,
    path: Option<PathBuf>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a file-backed store; a missing file starts empty.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<StoreSnapshot>(&bytes)
                .map_err(|e| PersistenceError::Serialization(format!("{}: {e}", path.display())))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StoreSnapshot::default(),
            Err(err) => {
                return Err(PersistenceError::Unavailable(format!(
                    "reading {}: {err}",
                    path.display()
                )))
            }
        };
        info!(
            path = %path.display(),
            listings = snapshot.listings.len(),
            runs = snapshot.runs.len(),
            "opened listing store"
        );

        Ok(Self {
            listings: RwLock::new(
                snapshot
                    .listings
                    .into_iter()
                    .map(|listing| (listing.listing_id, listing))
                    .collect(),
            ),
            runs: RwLock::new(snapshot.runs),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn len(&self) -> usize {
        self.listings.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.listings.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<Listing> {
        let mut out: Vec<Listing> = self.listings.read().await.values().cloned().collect();
        out.sort_by(|a, b| (&a.source, &a.source_url).cmp(&(&b.source, &b.source_url)));
        out
    }

    pub async fn save(&self) -> Result<(), PersistenceError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot = StoreSnapshot {
            listings: self.all().await,
            runs: self.runs.read().await.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        write_atomic(path, &bytes, true)
            .await
            .map_err(|e| PersistenceError::Unavailable(format!("{e:#}")))?;
        debug!(path = %path.display(), "saved listing store");
        Ok(())
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn get(&self, listing_id: ListingId) -> Result<Option<Listing>, PersistenceError> {
        Ok(self.listings.read().await.get(&listing_id).cloned())
    }

    async fn upsert(&self, listing: &Listing) -> Result<(), PersistenceError> {
        self.listings
            .write()
            .await
            .insert(listing.listing_id, listing.clone());
        Ok(())
    }

    async fn mark_inactive_except(
        &self,
        source: &str,
        seen: &HashSet<ListingId>,
    ) -> Result<usize, PersistenceError> {
        let mut listings = self.listings.write().await;
        let mut changed = 0;
        for listing in listings.values_mut() {
            if listing.source == source && listing.is_active && !seen.contains(&listing.listing_id) {
                listing.is_active = false;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn list_by_source(&self, source: &str) -> Result<Vec<Listing>, PersistenceError> {
        let mut out: Vec<Listing> = self
            .listings
            .read()
            .await
            .values()
            .filter(|listing| listing.source == source)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.source_url.cmp(&b.source_url));
        Ok(out)
    }

    async fn record_run(&self, run: &ScraperRun) -> Result<(), PersistenceError> {
        let mut runs = self.runs.write().await;
        match runs.iter_mut().find(|r| r.run_id == run.run_id) {
            Some(existing) => *existing = run.clone(),
            None => runs.push(run.clone()),
        }
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<ScraperRun>, PersistenceError> {
        let mut runs = self.runs.read().await.clone();
        runs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<ScraperRun>, PersistenceError> {
        Ok(self
            .runs
            .read()
            .await
            .iter()
            .find(|r| r.run_id == run_id)
            .cloned())
    }

    async fn flush(&self) -> Result<(), PersistenceError> {
        self.save().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bizhunt_core::merge::ListingObservation;
    use bizhunt_core::{merge_observation, RawListing};
    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::tempdir;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).single().unwrap()
    }

    fn listing(source: &str, url: &str) -> Listing {
        let mut raw = RawListing::new(url);
        raw.title = Some(format!("Listing at {url}"));
        raw.asking_price = Some("$250,000".into());
        let observation = ListingObservation::from_raw(source, &raw).unwrap();
        merge_observation(None, &observation, at(1)).listing
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = MemoryListingStore::new();
        let a = listing("bizquest", "https://www.bizquest.com/business/1");

        store.upsert(&a).await.unwrap();
        store.upsert(&a).await.unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(store.get(a.listing_id).await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn sweep_only_touches_unseen_active_listings_of_the_source() {
        let store = MemoryListingStore::new();
        let kept = listing("bizquest", "https://www.bizquest.com/business/1");
        let stale = listing("bizquest", "https://www.bizquest.com/business/2");
        let other = listing("quietlight", "https://quietlight.com/listings/9");
        for l in [&kept, &stale, &other] {
            store.upsert(l).await.unwrap();
        }

        let seen = HashSet::from([kept.listing_id]);
        assert_eq!(store.mark_inactive_except("bizquest", &seen).await.unwrap(), 1);
        assert_eq!(store.mark_inactive_except("bizquest", &seen).await.unwrap(), 0);

        let swept = store.get(stale.listing_id).await.unwrap().unwrap();
        assert!(!swept.is_active);
        assert_eq!(swept.last_updated, stale.last_updated);
        assert!(store.get(kept.listing_id).await.unwrap().unwrap().is_active);
        assert!(store.get(other.listing_id).await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn file_backed_store_round_trips() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data").join("listings.json");

        let store = MemoryListingStore::open(&path).await.unwrap();
        assert!(store.is_empty().await);
        let a = listing("flippa", "https://flippa.com/10001");
        store.upsert(&a).await.unwrap();
        let mut run = ScraperRun::pending("flippa", at(1));
        run.finish(at(2));
        store.record_run(&run).await.unwrap();
        store.flush().await.unwrap();

        let reopened = MemoryListingStore::open(&path).await.unwrap();
        assert_eq!(reopened.list_by_source("flippa").await.unwrap(), vec![a]);
        assert_eq!(reopened.get_run(run.run_id).await.unwrap(), Some(run.clone()));
        assert_eq!(reopened.recent_runs(5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recent_runs_are_newest_first() {
        let store = MemoryListingStore::new();
        for hour in [3, 1, 2] {
            store.record_run(&ScraperRun::pending("all", at(hour))).await.unwrap();
        }
        let runs = store.recent_runs(2).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].start_time, at(3));
        assert_eq!(runs[1].start_time, at(2));
    }
}
