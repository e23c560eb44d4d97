// HTTP route handlers for the Notebox API

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use notebox_common::types::{ExecutionId, ExecutionRequest, PhysicsRequirements};
use notebox_common::{CancelOutcome, Config, StoreError, SubmitError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::{metrics, stream, AppState};

/// Header whose value is passed through untouched as the execution owner
pub const USER_HEADER: &str = "x-user-id";

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub code: String,
    pub cell_id: String,
    pub notebook_id: String,
    #[serde(default)]
    pub execution_count: u32,
    pub timeout_ms: Option<u64>,
    pub memory_limit_mb: Option<u64>,
    #[serde(default)]
    pub enable_physics: bool,
    pub physics_requirements: Option<PhysicsRequirements>,
}

impl SubmitRequest {
    fn into_request(self, config: &Config, owner: Option<String>) -> ExecutionRequest {
        ExecutionRequest {
            code: self.code,
            cell_id: self.cell_id,
            notebook_id: self.notebook_id,
            execution_count: self.execution_count,
            timeout_ms: self.timeout_ms.unwrap_or(config.default_timeout_ms),
            memory_limit_mb: self.memory_limit_mb.unwrap_or(config.default_memory_mb),
            enable_physics: self.enable_physics,
            physics_requirements: self.physics_requirements,
            owner,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub execution_id: ExecutionId,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub execution_id: String,
    pub cancelled: bool,
    pub outcome: CancelOutcome,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct OutputsQuery {
    #[serde(default)]
    pub from: usize,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn store_unavailable(e: &StoreError) -> Response {
    error!(error = %e, "State store request failed");
    error_response(StatusCode::SERVICE_UNAVAILABLE, "state store unavailable")
}

fn parse_id(raw: &str) -> Result<ExecutionId, Response> {
    raw.parse::<ExecutionId>().map_err(|_| {
        error_response(
            StatusCode::BAD_REQUEST,
            format!("malformed execution id: {}", raw),
        )
    })
}

/// POST /executions - Queue code for execution
pub async fn submit_execution(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            metrics::record_rejected("malformed");
            return error_response(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };

    let owner = headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let request = payload.into_request(&state.config, owner);

    match state.orchestrator.submit(request).await {
        Ok(execution_id) => {
            metrics::record_submitted();
            (
                StatusCode::CREATED,
                Json(SubmitResponse {
                    execution_id,
                    status: "queued".to_string(),
                }),
            )
                .into_response()
        }
        Err(e) => {
            metrics::record_rejected(e.reason());
            match e {
                SubmitError::Invalid(reason) => {
                    warn!(reason = %reason, "Submission rejected");
                    error_response(StatusCode::BAD_REQUEST, reason)
                }
                SubmitError::Store(e) => store_unavailable(&e),
            }
        }
    }
}

/// GET /executions/:id - Current status record
pub async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
) -> Response {
    let id = match parse_id(&raw_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.orchestrator.status(&id).await {
        Ok(Some(status)) => Json(status).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("execution {} not found", id)),
        Err(e) => store_unavailable(&e),
    }
}

/// GET /executions/:id/outputs?from=N - Output log suffix
pub async fn get_outputs(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
    Query(query): Query<OutputsQuery>,
) -> Response {
    let id = match parse_id(&raw_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.orchestrator.status(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return error_response(StatusCode::NOT_FOUND, format!("execution {} not found", id))
        }
        Err(e) => return store_unavailable(&e),
    }

    match state.orchestrator.outputs(&id, query.from).await {
        Ok(outputs) => Json(outputs).into_response(),
        Err(e) => store_unavailable(&e),
    }
}

/// GET /executions/:id/stream - Server-sent events until terminal
pub async fn stream_outputs(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
) -> Response {
    let id = match parse_id(&raw_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.orchestrator.status(&id).await {
        Ok(Some(_)) => {
            info!(execution_id = %id, "Stream opened");
            stream::sse(
                state.orchestrator.clone(),
                id,
                state.config.stream_poll_interval(),
            )
            .into_response()
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("execution {} not found", id)),
        Err(e) => store_unavailable(&e),
    }
}

/// POST /executions/:id/cancel
pub async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
) -> Response {
    let id = match parse_id(&raw_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.orchestrator.cancel(&id).await {
        Ok(outcome) => {
            metrics::record_cancel(outcome.as_str());
            Json(CancelResponse {
                execution_id: id.to_string(),
                cancelled: outcome.is_success(),
                outcome,
            })
            .into_response()
        }
        Err(e) => store_unavailable(&e),
    }
}

/// GET /queue - Pending depth, running count and free slots
pub async fn queue_status(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.queue_status().await {
        Ok(status) => {
            metrics::update_queue(&status);
            Json(status).into_response()
        }
        Err(e) => store_unavailable(&e),
    }
}

/// GET /health
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus text format
pub async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> Response {
    // gauges are refreshed on scrape
    if let Ok(status) = state.orchestrator.queue_status().await {
        metrics::update_queue(&status);
    }

    match metrics::render_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
