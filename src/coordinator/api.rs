use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::persist::Store;
use crate::run::TestRunStatus;

use super::registry::{AgentRegistry, AgentStatusInfo};
use super::runs::{BulkDeleteRequest, CreateTestRunRequest, RunManager, RunOpError};
use super::telemetry::TelemetryAggregator;

/// Per-request time limit, matched by the probe and upstream timeouts.
const API_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_PREVIEW_BYTES: usize = 500;

#[derive(Clone)]
pub struct ApiState {
    pub runs: Arc<RunManager>,
    pub registry: Arc<AgentRegistry>,
    pub aggregator: Arc<TelemetryAggregator>,
    pub store: Arc<Store>,
    pub started_at: Instant,
    pub host: String,
    pub bus_port: u16,
    pub http_port: u16,
}

struct ApiError(RunOpError);

impl From<RunOpError> for ApiError {
    fn from(error: RunOpError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, body) = match self.0 {
            RunOpError::NotFound => (
                StatusCode::NOT_FOUND,
                json!({"error": "Test run not found"}),
            ),
            RunOpError::BadRequest { message } => {
                (StatusCode::BAD_REQUEST, json!({"error": message}))
            }
            RunOpError::InvalidState { message, status } => (
                StatusCode::BAD_REQUEST,
                json!({"error": message, "status": status}),
            ),
            RunOpError::Conflict {
                message,
                status,
                active_test_run,
            } => {
                let mut body = serde_json::Map::new();
                body.insert("error".to_owned(), json!(message));
                if let Some(status) = status {
                    body.insert("status".to_owned(), json!(status));
                }
                if let Some(active) = active_test_run {
                    body.insert("active_test_run".to_owned(), json!(active));
                }
                (StatusCode::CONFLICT, serde_json::Value::Object(body))
            }
            RunOpError::Validation(error) => {
                (StatusCode::BAD_REQUEST, json!({"error": error.to_string()}))
            }
        };
        (code, Json(body)).into_response()
    }
}

pub fn build_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/", get(root_info))
        .route("/health", get(health))
        .nest(
            "/api/v1",
            Router::new()
                .route("/status", get(coordinator_status))
                .route("/agents", get(list_agents))
                .route("/metrics", get(legacy_metrics))
                .route("/test-runs", post(create_run).get(list_runs).delete(bulk_delete))
                .route("/test-runs/stats", get(run_stats))
                .route("/test-runs/:id", get(get_run).delete(delete_run))
                .route("/test-runs/:id/results", get(run_results))
                .route("/test-runs/:id/start", post(start_run))
                .route("/test-runs/:id/stop", post(stop_run))
                .route("/test-runs/:id/rerun", post(rerun_run))
                .route("/test-connection", post(test_connection)),
        )
        .with_state(state)
        .layer(TimeoutLayer::new(API_TIMEOUT))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "healthy"}))
}

async fn root_info() -> impl IntoResponse {
    Json(json!({
        "service": "armonite-coordinator",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "coordinator": [
                "GET /api/v1/status",
                "GET /api/v1/agents",
                "GET /health",
            ],
            "test_runs": [
                "POST /api/v1/test-runs",
                "GET /api/v1/test-runs",
                "GET /api/v1/test-runs/{id}",
                "GET /api/v1/test-runs/{id}/results",
                "POST /api/v1/test-runs/{id}/start",
                "POST /api/v1/test-runs/{id}/stop",
                "POST /api/v1/test-runs/{id}/rerun",
                "DELETE /api/v1/test-runs/{id}",
                "DELETE /api/v1/test-runs",
                "GET /api/v1/test-runs/stats",
                "POST /api/v1/test-connection",
            ],
        },
        "documentation": "Distributed load testing coordinator with test run management",
    }))
}

async fn coordinator_status(State(state): State<ApiState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed();
    let mut status = serde_json::Map::new();
    status.insert("service".to_owned(), json!("armonite-coordinator"));
    status.insert("status".to_owned(), json!("running"));
    status.insert(
        "uptime".to_owned(),
        json!(humantime::format_duration(Duration::from_secs(uptime.as_secs())).to_string()),
    );
    status.insert("host".to_owned(), json!(state.host));
    status.insert("bus_port".to_owned(), json!(state.bus_port));
    status.insert("http_port".to_owned(), json!(state.http_port));
    status.insert(
        "connected_agents".to_owned(),
        json!(state.registry.count()),
    );

    let runs = state.runs.list().await;
    status.insert("total_test_runs".to_owned(), json!(runs.len()));

    if let Some(current) = state.runs.current_run().await {
        status.insert(
            "current_test_run".to_owned(),
            json!({
                "id": current.id,
                "name": current.name,
                "status": current.status,
            }),
        );
    }

    Json(serde_json::Value::Object(status))
}

async fn list_agents(State(state): State<ApiState>) -> impl IntoResponse {
    let current = state.runs.current_run().await;
    let results = current
        .as_ref()
        .map(|run| state.aggregator.results_for(&run.id))
        .unwrap_or_default();
    let run_active = current
        .as_ref()
        .is_some_and(|run| run.status == TestRunStatus::Running);

    let agents: Vec<AgentStatusInfo> = state
        .registry
        .snapshot()
        .into_iter()
        .map(|agent| {
            let rollup = results.iter().find(|result| result.agent_id == agent.id);
            let execution_state = if run_active
                && agent.execution_state == crate::protocol::ExecutionStatus::Idle
            {
                "running"
            } else {
                agent.execution_state.as_str()
            };
            AgentStatusInfo {
                id: agent.id.clone(),
                region: agent.region.clone(),
                concurrency: agent.concurrency,
                connected_at: agent.connected_at,
                last_seen: agent.last_seen,
                requests: rollup.map_or(0, |result| result.requests),
                errors: rollup.map_or(0, |result| result.errors),
                avg_latency_ms: rollup.map_or(0.0, |result| result.avg_latency_ms),
                status: agent.connection_status(),
                execution_state,
            }
        })
        .collect();

    Json(json!({"agents": agents}))
}

async fn legacy_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let current = state.runs.current_run().await;
    let results = current
        .as_ref()
        .map(|run| state.aggregator.results_for(&run.id))
        .unwrap_or_default();

    let total_requests: u64 = results.iter().map(|result| result.requests).sum();
    let total_errors: u64 = results.iter().map(|result| result.errors).sum();
    let success_rate = if total_requests > 0 {
        (total_requests - total_errors.min(total_requests)) as f64 / total_requests as f64 * 100.0
    } else {
        0.0
    };

    Json(json!({
        "total_requests": total_requests,
        "total_errors": total_errors,
        "success_rate": success_rate,
        "agent_count": state.registry.count(),
    }))
}

async fn create_run(
    State(state): State<ApiState>,
    Json(request): Json<CreateTestRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.runs.create(request).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn list_runs(State(state): State<ApiState>) -> impl IntoResponse {
    let runs = state.runs.list().await;
    let total = runs.len();
    Json(json!({"test_runs": runs, "total": total}))
}

async fn run_stats(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.runs.stats().await)
}

async fn get_run(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.runs.get(&id).await.ok_or(RunOpError::NotFound)?;
    Ok(Json(run))
}

async fn run_results(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.runs.get(&id).await.ok_or(RunOpError::NotFound)?;
    let agent_results = match state.store.get_agent_results(&id).await {
        Ok(results) => results,
        Err(err) => {
            warn!("Failed to get agent results for test run {}: {}", id, err);
            Vec::new()
        }
    };
    let summary = run.results.clone();
    Ok(Json(json!({
        "test_run": run,
        "summary": summary,
        "agent_results": agent_results,
    })))
}

async fn start_run(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.runs.start(&id).await?;
    Ok(Json(run))
}

async fn stop_run(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.runs.stop(&id).await?;
    info!("Test run stop requested: {}", id);
    Ok(Json(json!({"message": "Test run stop initiated"})))
}

async fn rerun_run(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.runs.rerun(&id).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn delete_run(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.runs.delete(&id).await?;
    Ok(Json(json!({"message": "Test run deleted"})))
}

async fn bulk_delete(
    State(state): State<ApiState>,
    Json(request): Json<BulkDeleteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.runs.bulk_delete(request).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct TestConnectionRequest {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<serde_json::Value>,
}

#[derive(Debug, Default, Serialize)]
struct TestConnectionResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    status_code: Option<u16>,
    #[serde(rename = "response_time_ms", skip_serializing_if = "Option::is_none")]
    response_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    error: String,
    #[serde(rename = "response_headers", skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    body_preview: String,
}

/// One-shot probe of a target endpoint, for validating plans before a run.
/// Accepts self-signed certificates.
async fn test_connection(
    Json(request): Json<TestConnectionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.url.is_empty() {
        return Err(ApiError(RunOpError::BadRequest {
            message: "URL is required".to_owned(),
        }));
    }

    Ok(Json(probe_endpoint(request).await))
}

async fn probe_endpoint(request: TestConnectionRequest) -> TestConnectionResponse {
    let started = Instant::now();
    let elapsed_ms = |started: Instant| started.elapsed().as_secs_f64() * 1000.0;

    let client = match reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .danger_accept_invalid_certs(true)
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            return TestConnectionResponse {
                error: format!("Failed to create request: {}", err),
                ..TestConnectionResponse::default()
            };
        }
    };

    let method = request
        .method
        .as_deref()
        .filter(|method| !method.is_empty())
        .unwrap_or("GET")
        .to_ascii_uppercase();
    let method = match reqwest::Method::from_bytes(method.as_bytes()) {
        Ok(method) => method,
        Err(err) => {
            return TestConnectionResponse {
                error: format!("Failed to create request: {}", err),
                ..TestConnectionResponse::default()
            };
        }
    };

    let mut builder = client.request(method.clone(), &request.url);
    for (name, value) in &request.headers {
        builder = builder.header(name, value);
    }
    if method != reqwest::Method::GET {
        if let Some(body) = &request.body {
            if !request.headers.keys().any(|name| name.eq_ignore_ascii_case("content-type")) {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
            }
            builder = builder.json(body);
        }
    }

    let response = match builder.send().await {
        Ok(response) => response,
        Err(err) => {
            return TestConnectionResponse {
                response_time_ms: Some(elapsed_ms(started)),
                error: format!("Request failed: {}", err),
                ..TestConnectionResponse::default()
            };
        }
    };

    let status = response.status().as_u16();
    let headers: BTreeMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.to_string(), value.to_owned()))
        })
        .collect();

    let body = response.bytes().await.unwrap_or_default();
    let mut body_preview = String::from_utf8_lossy(&body[..body.len().min(PROBE_PREVIEW_BYTES)])
        .into_owned();
    if body.len() > PROBE_PREVIEW_BYTES {
        body_preview.push_str("...");
    }

    TestConnectionResponse {
        success: (200..400).contains(&status),
        status_code: Some(status),
        response_time_ms: Some(elapsed_ms(started)),
        error: String::new(),
        headers,
        body_preview,
    }
}
