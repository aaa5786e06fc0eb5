//! HTTP front for the job store, for workers that cannot open the file.
//!
//! Every handler performs exactly one store call, so the atomicity of
//! claiming and reporting is the store's, not the transport's.

use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use super::models::*;
use crate::error::{ApiError, DatabaseError, Error, JobError};
use crate::store::model::JobOutcome;
use crate::store::traits::{JobQueue, LocalQueue};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: LocalQueue,
}

/// Build the worker API router.
pub fn api_routes(queue: LocalQueue) -> Router {
    let state = AppState { queue };

    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(queue_status))
        .route("/api/worker/register", post(register))
        .route("/api/worker/activate", post(activate))
        .route("/api/worker/heartbeat", post(heartbeat))
        .route("/api/worker/status", post(set_status))
        .route("/api/worker/unregister", post(unregister))
        .route("/api/worker/{id}/stats", post(record_stats))
        .route("/api/worker/jobs/claim", post(claim))
        .route("/api/worker/jobs/{id}/status", post(report_status))
        .route("/api/worker/jobs/{id}/cancelled", get(is_cancelled))
        .route("/api/worker/cache/get", post(cache_get))
        .route("/api/worker/cache/put", post(cache_put))
        .route("/api/worker/executed/get", post(executed_get))
        .route("/api/worker/executed/put", post(executed_put))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve the API on `listener` until the task is dropped.
pub async fn serve(listener: TcpListener, queue: LocalQueue) -> Result<(), Error> {
    let addr = listener
        .local_addr()
        .map_err(|e| ApiError::Transport(e.to_string()))?;
    info!(%addr, "Worker API listening");
    axum::serve(listener, api_routes(queue))
        .await
        .map_err(|e| ApiError::Transport(e.to_string()).into())
}

/// Store errors mapped onto HTTP status codes.
struct Failure(Error);

impl From<Error> for Failure {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl From<DatabaseError> for Failure {
    fn from(e: DatabaseError) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for Failure {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Job(JobError::NotFound { .. })
            | Error::Database(DatabaseError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Error::Job(JobError::InvalidTransition { .. }) => StatusCode::CONFLICT,
            Error::Database(DatabaseError::Validation(_)) => StatusCode::BAD_REQUEST,
            Error::Database(DatabaseError::Unavailable { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(%status, "Request failed: {}", self.0);
        } else {
            debug!(%status, "Request rejected: {}", self.0);
        }
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type Reply<T> = Result<Json<T>, Failure>;

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "courseflow"
    }))
}

async fn queue_status(State(state): State<AppState>) -> Reply<crate::store::model::QueueStats> {
    Ok(Json(state.queue.store().counts().await?))
}

// ── Worker identity ─────────────────────────────────────────────────────

async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Reply<RegisterResponse> {
    let worker_id = state
        .queue
        .register_worker(body.worker_type, &body.executor_id, body.execution_mode)
        .await?;
    info!(worker_id, executor_id = %body.executor_id, "Remote worker registered");
    Ok(Json(RegisterResponse { worker_id }))
}

async fn activate(State(state): State<AppState>, Json(body): Json<WorkerRef>) -> Reply<()> {
    state.queue.activate_worker(body.worker_id).await?;
    Ok(Json(()))
}

async fn heartbeat(
    State(state): State<AppState>,
    Json(body): Json<HeartbeatRequest>,
) -> Reply<()> {
    state
        .queue
        .heartbeat(body.worker_id, body.cpu_percent, body.memory_mb)
        .await?;
    Ok(Json(()))
}

async fn set_status(State(state): State<AppState>, Json(body): Json<StatusRequest>) -> Reply<()> {
    state.queue.set_worker_status(body.worker_id, body.status).await?;
    Ok(Json(()))
}

async fn unregister(
    State(state): State<AppState>,
    Json(body): Json<UnregisterRequest>,
) -> Reply<()> {
    state.queue.unregister_worker(body.worker_id, &body.reason).await?;
    Ok(Json(()))
}

async fn record_stats(
    State(state): State<AppState>,
    Path(worker_id): Path<i64>,
    Json(body): Json<StatsRequest>,
) -> Reply<()> {
    let elapsed = Duration::try_from_secs_f64(body.elapsed_secs).unwrap_or_default();
    state
        .queue
        .record_job_outcome(worker_id, body.success, elapsed)
        .await?;
    Ok(Json(()))
}

// ── Jobs ────────────────────────────────────────────────────────────────

async fn claim(
    State(state): State<AppState>,
    Json(body): Json<ClaimRequest>,
) -> Reply<Option<crate::store::model::Job>> {
    Ok(Json(state.queue.claim_next(body.job_type, body.worker_id).await?))
}

async fn report_status(
    State(state): State<AppState>,
    Path(job_id): Path<i64>,
    Json(outcome): Json<JobOutcome>,
) -> Reply<crate::store::model::ReportedStatus> {
    Ok(Json(state.queue.report_status(job_id, &outcome).await?))
}

async fn is_cancelled(
    State(state): State<AppState>,
    Path(job_id): Path<i64>,
) -> Reply<CancelledResponse> {
    let cancelled = state.queue.is_cancelled(job_id).await?;
    Ok(Json(CancelledResponse { cancelled }))
}

// ── Caches ──────────────────────────────────────────────────────────────

async fn cache_get(
    State(state): State<AppState>,
    Json(body): Json<CacheLookup>,
) -> Reply<Option<crate::store::model::CacheEntry>> {
    Ok(Json(
        state
            .queue
            .get_cached(&body.output_file, &body.content_hash)
            .await?,
    ))
}

async fn cache_put(State(state): State<AppState>, Json(body): Json<CacheStore>) -> Reply<()> {
    state
        .queue
        .put_cached(&body.output_file, &body.content_hash, &body.metadata)
        .await?;
    Ok(Json(()))
}

async fn executed_get(
    State(state): State<AppState>,
    Json(key): Json<crate::store::cache::ExecutionKey>,
) -> Reply<ExecutedResponse> {
    let notebook = state.queue.get_executed(&key).await?;
    Ok(Json(ExecutedResponse { notebook }))
}

async fn executed_put(
    State(state): State<AppState>,
    Json(body): Json<ExecutedStore>,
) -> Reply<()> {
    state.queue.put_executed(&body.key, &body.notebook).await?;
    Ok(Json(()))
}
