//! Environment configuration, the source registry and the run policy.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use bizhunt_adapters::profiles::{default_mode, display_name, BUILTIN_SOURCES};
use bizhunt_adapters::{AdapterConfig, AdapterMode};
use bizhunt_storage::{BackoffPolicy, HttpClientConfig, ProxyConfig};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const DEFAULT_SCRAPER_API_URL: &str = "https://api.scraperapi.com/";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Selects the Postgres store when set.
    pub database_url: Option<String>,
    pub store_path: PathBuf,
    pub workspace_root: PathBuf,
    pub reports_dir: PathBuf,
    pub artifacts_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub proxy: Option<ProxyConfig>,
    pub run_deadline_secs: u64,
    pub default_concurrency: usize,
    pub default_rps: f64,
    pub max_attempts: usize,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("BIZHUNT_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let proxy = env_non_empty("SCRAPER_API_KEY").map(|api_key| ProxyConfig {
            endpoint: env_non_empty("SCRAPER_API_URL")
                .unwrap_or_else(|| DEFAULT_SCRAPER_API_URL.to_string()),
            api_key,
            country_code: env_non_empty("SCRAPER_API_COUNTRY"),
        });

        Self {
            database_url: env_non_empty("DATABASE_URL"),
            store_path: std::env::var("BIZHUNT_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("data").join("listings.json")),
            reports_dir: std::env::var("BIZHUNT_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("reports")),
            artifacts_dir: env_non_empty("ARTIFACTS_DIR").map(PathBuf::from),
            user_agent: std::env::var("BIZHUNT_USER_AGENT")
                .unwrap_or_else(|_| "bizhunt-bot/0.1".to_string()),
            http_timeout_secs: env_parse("BIZHUNT_HTTP_TIMEOUT_SECS").unwrap_or(30),
            proxy,
            run_deadline_secs: env_parse("BIZHUNT_RUN_DEADLINE_SECS").unwrap_or(30 * 60),
            default_concurrency: env_parse("BIZHUNT_DEFAULT_CONCURRENCY").unwrap_or(5),
            default_rps: env_parse("BIZHUNT_DEFAULT_RPS").unwrap_or(1.0),
            max_attempts: env_parse("BIZHUNT_MAX_ATTEMPTS").unwrap_or(3),
            workspace_root,
        }
    }

    pub fn run_policy(&self) -> RunPolicy {
        RunPolicy {
            default_concurrency: self.default_concurrency.max(1),
            default_rps: self.default_rps,
            fetch_backoff: BackoffPolicy::with_max_attempts(self.max_attempts.max(1)),
            run_deadline: Duration::from_secs(self.run_deadline_secs),
            ..RunPolicy::default()
        }
    }

    /// Enabled sources with a `concurrency` override get a request limit of that size.
    pub fn http_client_config(&self, registry: &SourceRegistry) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            per_source_concurrency: self.default_concurrency.max(1),
            source_concurrency: registry
                .enabled()
                .filter_map(|s| Some((s.source_id.clone(), s.concurrency?.max(1))))
                .collect(),
            proxy: self.proxy.clone(),
            ..Default::default()
        }
    }
}

/// Knobs the run coordinator applies to every source unless overridden.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPolicy {
    pub default_concurrency: usize,
    /// Zero or negative disables pacing.
    pub default_rps: f64,
    pub fetch_backoff: BackoffPolicy,
    pub persistence_backoff: BackoffPolicy,
    pub run_deadline: Duration,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            default_concurrency: 5,
            default_rps: 1.0,
            fetch_backoff: BackoffPolicy::with_max_attempts(3),
            persistence_backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(2),
            },
            run_deadline: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: Option<AdapterMode>,
    #[serde(default)]
    pub search_urls: Vec<String>,
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub requests_per_second: Option<f64>,
    #[serde(default)]
    pub max_pages: Option<usize>,
}

impl SourceConfig {
    pub fn builtin(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            display_name: Some(display_name(source_id).to_string()),
            enabled: true,
            mode: Some(default_mode(source_id)),
            search_urls: Vec::new(),
            fixture_path: None,
            concurrency: None,
            requests_per_second: None,
            max_pages: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.display_name
            .as_deref()
            .unwrap_or_else(|| display_name(&self.source_id))
    }

    pub fn mode(&self) -> AdapterMode {
        self.mode.unwrap_or_else(|| default_mode(&self.source_id))
    }

    /// Relative fixture paths resolve against `workspace_root`.
    pub fn adapter_config(&self, workspace_root: &Path) -> AdapterConfig {
        AdapterConfig {
            source_id: self.source_id.clone(),
            mode: self.mode(),
            search_urls: self.search_urls.clone(),
            fixture_path: self.fixture_path.as_ref().map(|p| {
                if p.is_absolute() {
                    p.clone()
                } else {
                    workspace_root.join(p)
                }
            }),
            max_pages: self.max_pages,
        }
    }
}

impl SourceRegistry {
    pub fn builtin() -> Self {
        Self {
            sources: BUILTIN_SOURCES.iter().map(|id| SourceConfig::builtin(id)).collect(),
        }
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

/// Read `sources.yaml` from the workspace root, falling back to the built-in profiles.
pub async fn load_source_registry(workspace_root: &Path) -> Result<SourceRegistry> {
    let path = workspace_root.join("sources.yaml");
    let text = match tokio::fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no source registry file; using built-in sources");
            return Ok(SourceRegistry::builtin());
        }
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
