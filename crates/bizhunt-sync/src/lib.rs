//! Run orchestration: source registry, merge engine, run coordinator and run reports.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use bizhunt_adapters::{adapter_for_source, ArchivingPageSource, PageSource};
use bizhunt_core::{Listing, ScraperRun};
use bizhunt_storage::{HttpFetcher, ListingStore, MemoryListingStore, PgListingStore, RawPageArchive};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod report;

pub use config::{load_source_registry, RunPolicy, SourceConfig, SourceRegistry, SyncConfig};
pub use coordinator::{RunCoordinator, RunRequest, SourceSelection};
pub use engine::{with_persistence_retry, MergeEngine, MergeError};
pub use report::{report_recent_runs_markdown, write_run_reports, ParquetManifest, RunReportPaths};

pub const CRATE_NAME: &str = "bizhunt-sync";

/// Postgres when `DATABASE_URL` is set, otherwise the JSON file store.
pub async fn open_store(config: &SyncConfig) -> Result<Arc<dyn ListingStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgListingStore::connect(url)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate().await.context("applying migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            let store = MemoryListingStore::open(&config.store_path)
                .await
                .with_context(|| format!("opening {}", config.store_path.display()))?;
            Ok(Arc::new(store))
        }
    }
}

pub fn build_page_source(
    config: &SyncConfig,
    registry: &SourceRegistry,
) -> Result<Arc<dyn PageSource>> {
    let fetcher = HttpFetcher::new(config.http_client_config(registry))?;
    let pages: Arc<dyn PageSource> = match &config.artifacts_dir {
        Some(dir) => Arc::new(ArchivingPageSource::new(fetcher, RawPageArchive::new(dir))),
        None => Arc::new(fetcher),
    };
    Ok(pages)
}

/// Register an adapter for every enabled source. A source whose adapter cannot be
/// built stays in the roster and fails every run it is selected for.
pub fn build_coordinator(
    config: &SyncConfig,
    registry: &SourceRegistry,
    store: Arc<dyn ListingStore>,
    pages: Arc<dyn PageSource>,
) -> RunCoordinator {
    let mut coordinator = RunCoordinator::new(store, config.run_policy());
    for source in registry.enabled() {
        let adapter_config = source.adapter_config(&config.workspace_root);
        match adapter_for_source(&adapter_config, pages.clone()) {
            Ok(adapter) => {
                coordinator = coordinator.with_source(
                    Arc::from(adapter),
                    source.concurrency,
                    source.requests_per_second,
                );
            }
            Err(err) => {
                let reason = format!("adapter unavailable: {err:#}");
                warn!(source = %source.source_id, %reason, "source will be reported as failed");
                coordinator = coordinator.with_unavailable_source(&source.source_id, reason);
            }
        }
    }
    coordinator
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run: ScraperRun,
    pub reports_dir: Option<String>,
}

pub struct SyncService {
    config: SyncConfig,
    registry: SourceRegistry,
    coordinator: RunCoordinator,
}

impl SyncService {
    pub fn new(config: SyncConfig, registry: SourceRegistry, coordinator: RunCoordinator) -> Self {
        Self {
            config,
            registry,
            coordinator,
        }
    }

    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let registry = load_source_registry(&config.workspace_root).await?;
        let store = open_store(&config).await?;
        let pages = build_page_source(&config, &registry)?;
        let coordinator = build_coordinator(&config, &registry, store, pages);
        info!(sources = ?coordinator.source_ids(), "sync service ready");
        Ok(Self::new(config, registry, coordinator))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn coordinator(&self) -> &RunCoordinator {
        &self.coordinator
    }

    pub fn store(&self) -> &Arc<dyn ListingStore> {
        self.coordinator.store()
    }

    /// Run, then write the report files. A report failure is logged, never fatal.
    pub async fn run(&self, request: &RunRequest, cancel: CancellationToken) -> SyncRunSummary {
        let run = self.coordinator.run(request, cancel).await;
        let reports_dir = match self.write_reports(&run).await {
            Ok(paths) => Some(paths.reports_dir.display().to_string()),
            Err(err) => {
                error!(run_id = %run.run_id, error = %format!("{err:#}"), "could not write run reports");
                None
            }
        };
        SyncRunSummary { run, reports_dir }
    }

    async fn write_reports(&self, run: &ScraperRun) -> Result<RunReportPaths> {
        let sources: BTreeSet<&str> = run.sources.iter().map(|s| s.source.as_str()).collect();
        let mut listings: Vec<Listing> = Vec::new();
        for source in sources {
            listings.extend(
                self.store()
                    .list_by_source(source)
                    .await
                    .with_context(|| format!("loading listings for {source}"))?,
            );
        }
        write_run_reports(&self.config.reports_dir, run, &listings).await
    }
}

pub async fn run_once_from_env(request: &RunRequest, cancel: CancellationToken) -> Result<SyncRunSummary> {
    let service = SyncService::from_config(SyncConfig::from_env()).await?;
    Ok(service.run(request, cancel).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bizhunt_adapters::AdapterMode;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn config(root: PathBuf) -> SyncConfig {
        SyncConfig {
            database_url: None,
            store_path: root.join("data").join("listings.json"),
            reports_dir: root.join("reports"),
            artifacts_dir: None,
            user_agent: "bizhunt-test".into(),
            http_timeout_secs: 5,
            proxy: None,
            run_deadline_secs: 60,
            default_concurrency: 2,
            default_rps: 0.0,
            max_attempts: 2,
            workspace_root: root,
        }
    }

    #[tokio::test]
    async fn fixture_sources_run_end_to_end_with_reports() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("quietlight.json"),
            r#"[{"url":"https://quietlight.com/listings/widget-co","title":"Widget Co","asking_price":"$1.2M","revenue":"N/A"},
               {"url":"https://quietlight.com/listings/gadget-co","title":"Gadget Co","asking_price":"$750K"}]"#,
        )
        .unwrap();
        let registry = SourceRegistry {
            sources: vec![SourceConfig {
                mode: Some(AdapterMode::Fixture),
                fixture_path: Some(PathBuf::from("quietlight.json")),
                ..SourceConfig::builtin("quietlight")
            }],
        };
        let config = config(dir.path().to_path_buf());
        let store: Arc<dyn ListingStore> =
            Arc::new(MemoryListingStore::open(&config.store_path).await.unwrap());
        let pages = build_page_source(&config, &registry).unwrap();
        let coordinator = build_coordinator(&config, &registry, store, pages);
        assert_eq!(coordinator.source_ids(), vec!["quietlight".to_string()]);

        let service = SyncService::new(config, registry, coordinator);
        let summary = service.run(&RunRequest::default(), CancellationToken::new()).await;
        assert_eq!(summary.run.new, 2);
        assert_eq!(summary.run.status, bizhunt_core::RunStatus::Success);

        let reports_dir = PathBuf::from(summary.reports_dir.expect("reports written"));
        assert!(reports_dir.join("run_report.json").exists());
        assert!(reports_dir.join("snapshots").join("listings.parquet").exists());

        let reopened = MemoryListingStore::open(dir.path().join("data").join("listings.json"))
            .await
            .unwrap();
        assert_eq!(reopened.len().await, 2);
        assert_eq!(reopened.recent_runs(1).await.unwrap()[0].run_id, summary.run.run_id);
    }

    #[tokio::test]
    async fn a_source_without_an_adapter_fails_the_run_instead_of_vanishing() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("quietlight.json"),
            r#"[{"url":"https://quietlight.com/listings/widget-co","asking_price":"$1.2M"}]"#,
        )
        .unwrap();
        let fixture_source = |id: &str, file: &str| SourceConfig {
            mode: Some(AdapterMode::Fixture),
            fixture_path: Some(PathBuf::from(file)),
            ..SourceConfig::builtin(id)
        };
        let registry = SourceRegistry {
            sources: vec![
                fixture_source("quietlight", "quietlight.json"),
                fixture_source("flippa", "missing.json"),
            ],
        };
        let config = config(dir.path().to_path_buf());
        let store: Arc<dyn ListingStore> = Arc::new(MemoryListingStore::new());
        let pages = build_page_source(&config, &registry).unwrap();
        let coordinator = build_coordinator(&config, &registry, store, pages);
        assert_eq!(coordinator.source_ids(), vec!["quietlight".to_string()]);
        assert_eq!(coordinator.unavailable_source_ids(), vec!["flippa".to_string()]);

        let run = coordinator.run(&RunRequest::default(), CancellationToken::new()).await;
        assert_eq!(run.status, bizhunt_core::RunStatus::Partial);
        assert_eq!(run.sources.len(), 2);
        let flippa = run.sources.iter().find(|s| s.source == "flippa").unwrap();
        assert_eq!(flippa.state, bizhunt_core::SourceState::Failed);
        assert!(flippa.errors[0].contains("adapter unavailable"));

        let only_flippa = RunRequest {
            sources: SourceSelection::from_names(["flippa"]),
            max_listings_per_source: None,
        };
        let run = coordinator.run(&only_flippa, CancellationToken::new()).await;
        assert_eq!(run.status, bizhunt_core::RunStatus::Error);
        assert!(run.errors[0].contains("adapter unavailable"));
    }
}
