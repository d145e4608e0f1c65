//! Site adapter contract, page sources, and the marketplace adapters built on them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bizhunt_core::{FetchError, RawListing};
use bizhunt_storage::{FetchedPage, HttpFetcher, RawPageArchive};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub mod fixture;
pub mod html;
pub mod next_data;
pub mod profiles;

pub use fixture::FixtureSiteAdapter;
pub use html::{HtmlSiteAdapter, Pagination, RowSelector, SiteProfile};
pub use next_data::NextDataSiteAdapter;

pub const CRATE_NAME: &str = "bizhunt-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
    #[error("unknown source {0}")]
    UnknownSource(String),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    /// Worth repeating the whole enumeration.
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Fetch(err) if err.is_transient())
    }
}

/// Result of enumerating a source's catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlListing {
    pub urls: Vec<String>,
    pub pages_scraped: usize,
    /// Enumeration stopped at the caller's limit; the catalog may hold more.
    pub truncated: bool,
}

/// One marketplace. Stateless across calls; every call may be repeated.
#[async_trait]
pub trait SiteAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    /// Absolute listing URLs in catalog order, at most `limit` of them.
    async fn list_urls(&self, limit: Option<usize>) -> Result<UrlListing, AdapterError>;

    async fn fetch_listing(&self, url: &str) -> Result<RawListing, FetchError>;
}

/// Returns raw page bytes for a URL.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn get(&self, source_id: &str, url: &str) -> Result<FetchedPage, FetchError>;
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn get(&self, source_id: &str, url: &str) -> Result<FetchedPage, FetchError> {
        self.fetch(source_id, url)
            .await
            .map_err(|err| err.into_fetch_error(url))
    }
}

#[async_trait]
impl<P: PageSource + ?Sized> PageSource for Arc<P> {
    async fn get(&self, source_id: &str, url: &str) -> Result<FetchedPage, FetchError> {
        (**self).get(source_id, url).await
    }
}

/// Keeps a copy of every fetched page in a [`RawPageArchive`].
pub struct ArchivingPageSource<P> {
    inner: P,
    archive: RawPageArchive,
}

impl<P> ArchivingPageSource<P> {
    pub fn new(inner: P, archive: RawPageArchive) -> Self {
        Self { inner, archive }
    }
}

#[async_trait]
impl<P: PageSource> PageSource for ArchivingPageSource<P> {
    async fn get(&self, source_id: &str, url: &str) -> Result<FetchedPage, FetchError> {
        let page = self.inner.get(source_id, url).await?;
        let extension = match page.content_type.as_deref() {
            Some(ct) if ct.contains("json") => "json",
            _ => "html",
        };
        // An archive failure must not cost us the page.
        if let Err(err) = self
            .archive
            .store_page(Utc::now(), source_id, extension, &page.body)
            .await
        {
            warn!(source_id, url, error = %err, "failed to archive page");
        }
        Ok(page)
    }
}

/// Fixed URL -> body map. Unknown URLs answer 404.
#[derive(Debug, Clone, Default)]
pub struct StaticPageSource {
    pages: HashMap<String, String>,
}

impl StaticPageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: impl Into<String>, body: impl Into<String>) -> Self {
        self.pages.insert(url.into(), body.into());
        self
    }
}

#[async_trait]
impl PageSource for StaticPageSource {
    async fn get(&self, _source_id: &str, url: &str) -> Result<FetchedPage, FetchError> {
        match self.pages.get(url) {
            Some(body) => Ok(FetchedPage {
                status: 200,
                final_url: url.to_string(),
                content_type: Some("text/html".to_string()),
                body: body.clone().into_bytes(),
            }),
            None => Err(FetchError::permanent(url, "http status 404")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdapterMode {
    #[default]
    Html,
    NextData,
    Fixture,
}

/// What the registry needs to build an adapter for one source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdapterConfig {
    pub source_id: String,
    pub mode: AdapterMode,
    /// Replaces the built-in profile's search URLs when non-empty.
    pub search_urls: Vec<String>,
    pub fixture_path: Option<PathBuf>,
    pub max_pages: Option<usize>,
}

/// Build the adapter for a configured source.
pub fn adapter_for_source(
    config: &AdapterConfig,
    pages: Arc<dyn PageSource>,
) -> Result<Box<dyn SiteAdapter>, AdapterError> {
    match config.mode {
        AdapterMode::Fixture => {
            let path = config.fixture_path.as_ref().ok_or_else(|| {
                AdapterError::Message(format!(
                    "source {} uses fixture mode without fixture_path",
                    config.source_id
                ))
            })?;
            Ok(Box::new(FixtureSiteAdapter::load(&config.source_id, path)?))
        }
        AdapterMode::NextData => {
            let mut profile = profiles::next_data_profile(&config.source_id)
                .ok_or_else(|| AdapterError::UnknownSource(config.source_id.clone()))?;
            profile.apply_overrides(&config.search_urls, config.max_pages);
            Ok(Box::new(NextDataSiteAdapter::new(profile, pages)))
        }
        AdapterMode::Html => {
            let mut profile = profiles::html_profile(&config.source_id)
                .ok_or_else(|| AdapterError::UnknownSource(config.source_id.clone()))?;
            profile.apply_overrides(&config.search_urls, config.max_pages);
            Ok(Box::new(HtmlSiteAdapter::new(profile, pages)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn static_source_answers_404_for_unknown_urls() {
        let pages = StaticPageSource::new().with_page("https://a.test/1", "<p>hi</p>");
        assert_eq!(pages.get("t", "https://a.test/1").await.unwrap().body, b"<p>hi</p>");
        let err = pages.get("t", "https://a.test/2").await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn archiving_source_keeps_a_copy() {
        let dir = tempdir().expect("tempdir");
        let pages = ArchivingPageSource::new(
            StaticPageSource::new().with_page("https://a.test/1", "<p>listing</p>"),
            RawPageArchive::new(dir.path()),
        );
        pages.get("bizquest", "https://a.test/1").await.unwrap();

        let day = Utc::now().format("%Y%m%d").to_string();
        let stored: Vec<_> = std::fs::read_dir(dir.path().join(day).join("bizquest"))
            .expect("archive dir")
            .collect();
        assert_eq!(stored.len(), 1);
    }

    #[test]
    fn registry_knows_builtin_sources() {
        let pages: Arc<dyn PageSource> = Arc::new(StaticPageSource::new());
        for id in profiles::BUILTIN_SOURCES {
            let mode = if *id == "flippa" {
                AdapterMode::NextData
            } else {
                AdapterMode::Html
            };
            let config = AdapterConfig {
                source_id: id.to_string(),
                mode,
                ..Default::default()
            };
            let adapter = adapter_for_source(&config, pages.clone()).expect("adapter");
            assert_eq!(adapter.source_id(), *id);
        }

        let unknown = AdapterConfig {
            source_id: "nope".into(),
            ..Default::default()
        };
        assert!(matches!(
            adapter_for_source(&unknown, pages),
            Err(AdapterError::UnknownSource(_))
        ));
    }

    #[test]
    fn only_transient_fetch_errors_are_retryable() {
        assert!(AdapterError::Fetch(FetchError::transient("u", "503")).is_transient());
        assert!(!AdapterError::Fetch(FetchError::permanent("u", "404")).is_transient());
        assert!(!AdapterError::Message("bad".into()).is_transient());
    }
}
