//! JSON trigger and inspection API for listing runs.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bizhunt_sync::{RunRequest, SyncConfig, SyncService};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bizhunt-web";

const DEFAULT_RUNS_LIMIT: usize = 20;

pub struct AppState {
    pub service: Arc<SyncService>,
    shutdown: CancellationToken,
    run_lock: Mutex<()>,
}

impl AppState {
    pub fn new(service: Arc<SyncService>, shutdown: CancellationToken) -> Self {
        Self {
            service,
            shutdown,
            run_lock: Mutex::new(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRow {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub mode: String,
    /// An adapter was built for this source and runs can select it.
    pub registered: bool,
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/sources", get(sources_handler))
        .route("/runs", get(runs_handler).post(start_run_handler))
        .route("/runs/{run_id}", get(run_handler))
        .with_state(Arc::new(state))
}

/// Bind `BIZHUNT_WEB_PORT` (default 8000) and serve until `shutdown` fires.
pub async fn serve_from_env(shutdown: CancellationToken) -> anyhow::Result<()> {
    let port: u16 = std::env::var("BIZHUNT_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let service = SyncService::from_config(SyncConfig::from_env()).await?;
    let state = AppState::new(Arc::new(service), shutdown.clone());
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(serde_json::json!({ "status": "ok", "service": CRATE_NAME })).into_response()
}

async fn sources_handler(State(state): State<Arc<AppState>>) -> Response {
    let registered = state.service.coordinator().source_ids();
    let rows: Vec<SourceRow> = state
        .service
        .registry()
        .sources
        .iter()
        .map(|source| SourceRow {
            source_id: source.source_id.clone(),
            display_name: source.display_name().to_string(),
            enabled: source.enabled,
            mode: serde_json::to_value(source.mode())
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
            registered: registered.contains(&source.source_id),
        })
        .collect();
    Json(rows).into_response()
}

/// Runs synchronously; a second trigger while one is in flight gets 409.
async fn start_run_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunRequest>,
) -> Response {
    let Ok(_guard) = state.run_lock.try_lock() else {
        return error_response(StatusCode::CONFLICT, "a run is already in progress");
    };
    info!(sources = %request.sources.label(), "run requested over http");
    let summary = state
        .service
        .run(&request, state.shutdown.child_token())
        .await;
    Json(summary.run).into_response()
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_RUNS_LIMIT);
    match state.service.store().recent_runs(limit).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err),
    }
}

async fn run_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(run_id): AxumPath<String>,
) -> Response {
    let Ok(run_id) = Uuid::parse_str(&run_id) else {
        return error_response(StatusCode::BAD_REQUEST, "run id is not a uuid");
    };
    match state.service.store().get_run(run_id).await {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "run not found"),
        Err(err) => server_error(err),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use bizhunt_adapters::FixtureSiteAdapter;
    use bizhunt_core::RawListing;
    use bizhunt_storage::{ListingStore, MemoryListingStore};
    use bizhunt_sync::{RunCoordinator, SourceConfig, SourceRegistry};
    use http_body_util::BodyExt;
    use std::path::Path;
    use tower::ServiceExt;

    fn config(root: &Path) -> SyncConfig {
        SyncConfig {
            database_url: None,
            store_path: root.join("listings.json"),
            workspace_root: root.to_path_buf(),
            reports_dir: root.join("reports"),
            artifacts_dir: None,
            user_agent: "bizhunt-test".into(),
            http_timeout_secs: 5,
            proxy: None,
            run_deadline_secs: 60,
            default_concurrency: 2,
            default_rps: 0.0,
            max_attempts: 2,
        }
    }

    fn fixture_listing(url: &str, title: &str, price: &str) -> RawListing {
        let mut raw = RawListing::new(url);
        raw.title = Some(title.into());
        raw.asking_price = Some(price.into());
        raw
    }

    fn test_state(root: &Path) -> AppState {
        let config = config(root);
        let store: Arc<dyn ListingStore> = Arc::new(MemoryListingStore::new());
        let adapter = FixtureSiteAdapter::new(
            "quietlight",
            vec![
                fixture_listing("https://quietlight.com/listings/widget-co", "Widget Co", "$1.2M"),
                fixture_listing("https://quietlight.com/listings/gadget-co", "Gadget Co", "$750K"),
            ],
        );
        let coordinator =
            RunCoordinator::new(store, config.run_policy()).with_source(Arc::new(adapter), None, None);
        let registry = SourceRegistry {
            sources: vec![
                SourceConfig::builtin("quietlight"),
                SourceConfig::builtin("flippa"),
            ],
        };
        AppState::new(
            Arc::new(SyncService::new(config, registry, coordinator)),
            CancellationToken::new(),
        )
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null)
        };
        (status, json)
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let dir = tempfile::tempdir().unwrap();
        let router = app(test_state(dir.path()));
        let (status, body) = send(&router, get_request("/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn sources_show_which_adapters_are_registered() {
        let dir = tempfile::tempdir().unwrap();
        let router = app(test_state(dir.path()));
        let (status, body) = send(&router, get_request("/sources")).await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        let quietlight = rows.iter().find(|r| r["source_id"] == "quietlight").unwrap();
        assert_eq!(quietlight["registered"], true);
        let flippa = rows.iter().find(|r| r["source_id"] == "flippa").unwrap();
        assert_eq!(flippa["registered"], false);
    }

    #[tokio::test]
    async fn posting_a_run_returns_the_run_and_records_it() {
        let dir = tempfile::tempdir().unwrap();
        let router = app(test_state(dir.path()));

        let request = Request::builder()
            .method("POST")
            .uri("/runs")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"sources":["quietlight"]}"#))
            .unwrap();
        let (status, run) = send(&router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(run["status"], "success");
        assert_eq!(run["new"], 2);
        let run_id = run["run_id"].as_str().unwrap().to_string();

        let (status, runs) = send(&router, get_request("/runs?limit=5")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(runs.as_array().unwrap().len(), 1);

        let (status, fetched) = send(&router, get_request(&format!("/runs/{run_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["run_id"], run_id.as_str());
        assert!(dir.path().join("reports").join(&run_id).join("run_report.json").exists());
    }

    #[tokio::test]
    async fn unknown_and_malformed_run_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let router = app(test_state(dir.path()));

        let (status, _) = send(&router, get_request(&format!("/runs/{}", Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&router, get_request("/runs/not-a-uuid")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "run id is not a uuid");
    }
}
