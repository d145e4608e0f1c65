//! Offline adapter backed by a recorded JSON file of raw listings.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use bizhunt_core::{FetchError, RawListing};
use serde::{Deserialize, Serialize};

use crate::{AdapterError, SiteAdapter, UrlListing};

/// On-disk shape: either a bare array of raw listings or this wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureFile {
    #[serde(default)]
    pub source_id: Option<String>,
    pub listings: Vec<RawListing>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FixtureShape {
    Wrapped(FixtureFile),
    Bare(Vec<RawListing>),
}

#[derive(Debug, Default)]
struct FixtureSnapshot {
    order: Vec<String>,
    listings: HashMap<String, RawListing>,
}

impl FixtureSnapshot {
    fn new(listings: Vec<RawListing>) -> Self {
        Self {
            order: listings.iter().map(|l| l.url.clone()).collect(),
            listings: listings.into_iter().map(|l| (l.url.clone(), l)).collect(),
        }
    }
}

/// Serves recorded listings. File-backed adapters re-read the file at every
/// enumeration, so a long-lived process picks up edits on the next run.
#[derive(Debug)]
pub struct FixtureSiteAdapter {
    source_id: String,
    path: Option<PathBuf>,
    snapshot: RwLock<FixtureSnapshot>,
}

fn read_fixture(source_id: &str, path: &Path) -> Result<Vec<RawListing>, AdapterError> {
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let shape: FixtureShape =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    match shape {
        FixtureShape::Wrapped(file) => {
            if let Some(recorded) = file.source_id.as_deref().filter(|id| *id != source_id) {
                return Err(AdapterError::Message(format!(
                    "fixture {} records source {recorded}, expected {source_id}",
                    path.display()
                )));
            }
            Ok(file.listings)
        }
        FixtureShape::Bare(listings) => Ok(listings),
    }
}

impl FixtureSiteAdapter {
    pub fn new(source_id: impl Into<String>, listings: Vec<RawListing>) -> Self {
        Self {
            source_id: source_id.into(),
            path: None,
            snapshot: RwLock::new(FixtureSnapshot::new(listings)),
        }
    }

    /// Read `path` now, failing early on a missing or malformed file.
    pub fn load(source_id: &str, path: impl AsRef<Path>) -> Result<Self, AdapterError> {
        let path = path.as_ref();
        let listings = read_fixture(source_id, path)?;
        Ok(Self {
            source_id: source_id.to_string(),
            path: Some(path.to_path_buf()),
            snapshot: RwLock::new(FixtureSnapshot::new(listings)),
        })
    }

    fn reload(&self) -> Result<(), AdapterError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let fresh = FixtureSnapshot::new(read_fixture(&self.source_id, path)?);
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        Ok(())
    }
}

#[async_trait]
impl SiteAdapter for FixtureSiteAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn list_urls(&self, limit: Option<usize>) -> Result<UrlListing, AdapterError> {
        self.reload()?;
        let snapshot = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        let limit = limit.unwrap_or(usize::MAX);
        Ok(UrlListing {
            urls: snapshot.order.iter().take(limit).cloned().collect(),
            pages_scraped: 1,
            truncated: snapshot.order.len() > limit,
        })
    }

    async fn fetch_listing(&self, url: &str) -> Result<RawListing, FetchError> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .listings
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::permanent(url, "not present in fixture"))
    }
}
