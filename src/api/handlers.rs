// REST API handlers
// Thin adapters from HTTP to the orchestrator facade

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::engine::{Orchestrator, Submission};
use crate::models::{CancelOutcome, CostPeriod, DebugTrace, Granularity, QueueItem, QueueStats, QueueStatus};
use crate::OrchestratorError;

const DEFAULT_TRACE_LIMIT: usize = 50;
const MAX_TRACE_LIMIT: usize = 500;

/// Shared application state for the API
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

impl ApiState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

/// Error body returned by every endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: String,
    pub message: String,
}

/// An orchestrator error on its way out as an HTTP response
#[derive(Debug)]
pub struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            OrchestratorError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound".to_string()),
            OrchestratorError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "InvalidInput".to_string()),
            OrchestratorError::Configuration(_) => (StatusCode::BAD_REQUEST, "Configuration".to_string()),
            other => (StatusCode::INTERNAL_SERVER_ERROR, other.kind().to_string()),
        };
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }

        let body = ErrorResponse {
            kind,
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Health check endpoint - GET /health
pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "request-orchestrator",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().timestamp()
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: Uuid,
    pub status: QueueStatus,
}

/// Submit a request - POST /v1/requests
pub async fn submit_request(
    State(state): State<ApiState>,
    Json(submission): Json<Submission>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    debug!(request_type = %submission.request_type, "Received submission");
    let item = state.orchestrator.submit(submission).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            id: item.id,
            status: item.status,
        }),
    ))
}

/// Request status, result and error - GET /v1/requests/:id
pub async fn get_request(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<QueueItem>> {
    Ok(Json(state.orchestrator.status(id).await?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub id: Uuid,
    pub outcome: CancelOutcome,
}

/// Cancel a request - POST /v1/requests/:id/cancel
pub async fn cancel_request(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CancelResponse>> {
    let outcome = state.orchestrator.cancel(id).await?;
    info!(request_id = %id, ?outcome, "🛑 Cancellation requested");
    Ok(Json(CancelResponse { id, outcome }))
}

/// Counts per status - GET /v1/queue/stats
pub async fn queue_stats(State(state): State<ApiState>) -> ApiResult<Json<QueueStats>> {
    Ok(Json(state.orchestrator.stats().await?))
}

/// Current cost period - GET /v1/telemetry/periods/:granularity
pub async fn cost_period(
    State(state): State<ApiState>,
    Path(granularity): Path<String>,
) -> ApiResult<Json<CostPeriod>> {
    let granularity: Granularity = granularity.parse().map_err(OrchestratorError::InvalidInput)?;
    Ok(Json(state.orchestrator.period(granularity).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct TraceQuery {
    pub limit: Option<usize>,
}

/// Recent debug traces, newest first - GET /v1/telemetry/traces?limit=
pub async fn recent_traces(
    State(state): State<ApiState>,
    Query(query): Query<TraceQuery>,
) -> ApiResult<Json<Vec<DebugTrace>>> {
    let limit = query.limit.unwrap_or(DEFAULT_TRACE_LIMIT).min(MAX_TRACE_LIMIT);
    Ok(Json(state.orchestrator.traces(limit).await?))
}

/// Force a registry reload - POST /v1/registry/reload
pub async fn reload_registry(State(state): State<ApiState>) -> ApiResult<Json<serde_json::Value>> {
    let version = state.orchestrator.reload_registry().await?;
    info!(version, "🔄 Registry reloaded");
    Ok(Json(json!({ "version": version })))
}

/// Fallback for unknown routes
pub async fn not_found() -> impl IntoResponse {
    let body = ErrorResponse {
        kind: "NotFound".to_string(),
        message: "Not found".to_string(),
    };
    (StatusCode::NOT_FOUND, Json(body))
}
