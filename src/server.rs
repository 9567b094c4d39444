//! HTTP API (producer process).
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/ingestions/repository` | Validate and enqueue an ingestion job |
//! | `GET`  | `/jobs/job/{jobId}` | Job state, progress and payload |
//! | `GET`  | `/jobs/failed` | Failed jobs with reasons and attempt counts |
//! | `POST` | `/jobs/retry/{jobId}` | Re-enqueue one failed job |
//! | `POST` | `/jobs/retry/all` | Re-enqueue every failed job |
//! | `POST` | `/queries/search/{repoId}` | Parent-mode semantic search |
//! | `POST` | `/queries/search/{repoId}/chunk` | Chunk-mode semantic search |
//! | `GET`  | `/health` | Liveness check |
//!
//! Error responses carry `{ statusCode, message, error }`. Only validation
//! errors surface synchronously; ingestion failures are observable through
//! the job endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::models::{JobRecord, MetaMap};
use crate::producer::{IngestRequest, Producer, ProducerError};
use crate::query::{QueryError, QueryService, SearchMode, SearchQuery};
use crate::traits::JobQueue;

#[derive(Clone)]
pub struct AppState {
    pub producer: Arc<Producer>,
    pub queue: Arc<dyn JobQueue>,
    pub query: Arc<QueryService>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ingestions/repository", post(handle_ingest))
        .route("/jobs/job/{job_id}", get(handle_job_status))
        .route("/jobs/failed", get(handle_failed_jobs))
        .route("/jobs/retry/all", post(handle_retry_all))
        .route("/jobs/retry/{job_id}", post(handle_retry))
        .route("/queries/search/{repo_id}", post(handle_search))
        .route("/queries/search/{repo_id}/chunk", post(handle_search_chunks))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

pub async fn run_server(state: AppState, port: u16) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "API listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Errors ============

struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "statusCode": self.status.as_u16(),
            "message": self.message,
            "error": self.status.canonical_reason().unwrap_or("Error"),
        });
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError {
        status: StatusCode::BAD_REQUEST,
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> ApiError {
    ApiError {
        status: StatusCode::NOT_FOUND,
        message: message.into(),
    }
}

fn internal_error(error: anyhow::Error) -> ApiError {
    tracing::error!(error = %format!("{error:#}"), "internal error");
    ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: "internal error".into(),
    }
}

// ============ POST /ingestions/repository ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestResponse {
    status: &'static str,
    job_id: Uuid,
    repo_url: String,
    #[serde(rename = "ref")]
    git_ref: String,
    repo_id: String,
}

async fn handle_ingest(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    let (job_id, payload) = state.producer.enqueue(req).await.map_err(|e| match e {
        ProducerError::Validation(message) => bad_request(message),
        ProducerError::Internal(error) => internal_error(error),
    })?;

    Ok((
        StatusCode::CREATED,
        Json(IngestResponse {
            status: "queued",
            job_id,
            repo_url: payload.repo_url,
            git_ref: payload.git_ref,
            repo_id: payload.repo_id,
        }),
    ))
}

// ============ Job endpoints ============

fn parse_job_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| bad_request(format!("invalid job id '{raw}'")))
}

fn job_status_body(job: &JobRecord) -> Value {
    json!({
        "id": job.id,
        "state": job.state.as_str(),
        "progress": job.progress,
        "data": job.payload.public_view(),
    })
}

async fn handle_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_job_id(&job_id)?;
    let job = state
        .queue
        .get(id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found(format!("job {job_id} not found")))?;
    Ok(Json(job_status_body(&job)))
}

async fn handle_failed_jobs(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let jobs = state.queue.failed_jobs().await.map_err(internal_error)?;
    let jobs: Vec<Value> = jobs
        .iter()
        .map(|job| {
            json!({
                "id": job.id,
                "failedReason": job.failed_reason,
                "attemptsMade": job.attempts_made,
                "timestamp": job.finished_at.unwrap_or(job.queued_at).to_rfc3339(),
                "data": job.payload.public_view(),
            })
        })
        .collect();
    Ok(Json(json!({ "jobs": jobs })))
}

async fn handle_retry(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_job_id(&job_id)?;
    let retried = state.queue.retry(id).await.map_err(internal_error)?;
    if !retried {
        return Err(not_found(format!("job {job_id} is not in the failed state")));
    }
    Ok(Json(json!({ "id": id, "state": "waiting" })))
}

async fn handle_retry_all(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let retried = state.queue.retry_all().await.map_err(internal_error)?;
    Ok(Json(json!({ "retried": retried })))
}

// ============ Query endpoints ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryResultItem {
    id: String,
    content: String,
    repo_id: String,
    metadata: MetaMap,
}

#[derive(Serialize)]
struct QueryResponse {
    results: Vec<QueryResultItem>,
}

async fn run_query(
    state: &AppState,
    repo_id: &str,
    query: &SearchQuery,
    mode: SearchMode,
) -> Result<Json<QueryResponse>, ApiError> {
    let results = state
        .query
        .search(repo_id, query, mode)
        .await
        .map_err(|e| match e {
            QueryError::BadRequest(message) => bad_request(message),
            QueryError::Internal(error) => internal_error(error),
        })?;

    Ok(Json(QueryResponse {
        results: results
            .into_iter()
            .map(|r| QueryResultItem {
                id: r.id,
                content: r.content,
                repo_id: r.repo_id,
                metadata: r.metadata,
            })
            .collect(),
    }))
}

async fn handle_search(
    State(state): State<AppState>,
    Path(repo_id): Path<String>,
    Json(query): Json<SearchQuery>,
) -> Result<Json<QueryResponse>, ApiError> {
    run_query(&state, &repo_id, &query, SearchMode::Parent).await
}

async fn handle_search_chunks(
    State(state): State<AppState>,
    Path(repo_id): Path<String>,
    Json(query): Json<SearchQuery>,
) -> Result<Json<QueryResponse>, ApiError> {
    run_query(&state, &repo_id, &query, SearchMode::Chunk).await
}

// ============ GET /health ============

async fn handle_health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Minimal liveness server for the worker role.
pub async fn run_health_server(port: u16) -> anyhow::Result<()> {
    let app = Router::new().route("/health", get(handle_health));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "worker health endpoint listening");
    axum::serve(listener, app).await?;
    Ok(())
}
