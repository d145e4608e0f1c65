//! Page fetching over HTTP with global and per-source concurrency limits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bizhunt_core::FetchError;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Forwarding proxy that takes the target as a query parameter
/// (`<endpoint>?api_key=..&url=..&country_code=..`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub endpoint: String,
    pub api_key: String,
    pub country_code: Option<String>,
}

impl ProxyConfig {
    pub fn wrap(&self, target: &str) -> Result<String, HttpError> {
        let mut params = vec![("api_key", self.api_key.as_str()), ("url", target)];
        if let Some(country) = &self.country_code {
            params.push(("country_code", country.as_str()));
        }
        Url::parse_with_params(&self.endpoint, params)
            .map(String::from)
            .map_err(|e| HttpError::Proxy(format!("{}: {e}", self.endpoint)))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    /// Per-source in-flight limits that replace `per_source_concurrency`.
    pub source_concurrency: HashMap<String, usize>,
    pub proxy: Option<ProxyConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 5,
            source_concurrency: HashMap::new(),
            proxy: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedPage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid proxy configuration: {0}")]
    Proxy(String),
}

impl HttpError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            HttpError::Request { source, .. } => classify_reqwest_error(source),
            HttpError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            HttpError::Proxy(_) => RetryDisposition::NonRetryable,
        }
    }

    pub fn into_fetch_error(self, url: &str) -> FetchError {
        match self.disposition() {
            RetryDisposition::Retryable => FetchError::transient(url, self.to_string()),
            RetryDisposition::NonRetryable => FetchError::permanent(url, self.to_string()),
        }
    }
}

/// One GET per call. Retrying is the caller's decision.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    source_limits: HashMap<String, usize>,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    proxy: Option<ProxyConfig>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            source_limits: config.source_concurrency,
            per_source: Mutex::new(HashMap::new()),
            proxy: config.proxy,
        })
    }

    /// Concurrent requests allowed for one source.
    pub fn per_source_limit(&self, source_id: &str) -> usize {
        self.source_limits
            .get(source_id)
            .copied()
            .unwrap_or(self.per_source_limit)
            .max(1)
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit(source_id))))
            .clone()
    }

    pub async fn fetch(&self, source_id: &str, url: &str) -> Result<FetchedPage, HttpError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let request_url = match &self.proxy {
            Some(proxy) => proxy.wrap(url)?,
            None => url.to_string(),
        };

        let span = info_span!("http_fetch", source_id, url);
        async {
            let resp = self
                .client
                .get(&request_url)
                .send()
                .await
                .map_err(|source| HttpError::Request {
                    url: url.to_string(),
                    source,
                })?;

            let status = resp.status();
            // Behind a proxy the response URL is the proxy's, not the listing's.
            let final_url = if self.proxy.is_some() {
                url.to_string()
            } else {
                resp.url().to_string()
            };
            if !status.is_success() {
                debug!(status = status.as_u16(), "non-success response");
                return Err(HttpError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = resp
                .bytes()
                .await
                .map_err(|source| HttpError::Request {
                    url: url.to_string(),
                    source,
                })?
                .to_vec();

            Ok(FetchedPage {
                status: status.as_u16(),
                final_url,
                content_type,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
