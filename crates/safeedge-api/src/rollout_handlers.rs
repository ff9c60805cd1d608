//! REST API handlers for rollout management.
//!
//! Provides endpoints to create, start, abort, list and inspect rollouts.
//! All state changes go through the [`RolloutEngine`](safeedge_rollout::RolloutEngine).

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use safeedge_rollout::{NewRollout, RolloutError};
use safeedge_state::StateError;

use crate::ApiState;
use crate::handlers::{ApiResponse, error_response};

/// HTTP status for a rollout error.
pub fn status_for(e: &RolloutError) -> StatusCode {
    match e {
        RolloutError::Validation(_) => StatusCode::BAD_REQUEST,
        RolloutError::NotFound(_) | RolloutError::State(StateError::NotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        RolloutError::UntrustedArtifact { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        RolloutError::ConflictingTransition { .. } => StatusCode::CONFLICT,
        RolloutError::NotConnected(_) | RolloutError::Delivery(_) => StatusCode::SERVICE_UNAVAILABLE,
        RolloutError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn rollout_error(e: &RolloutError) -> Response {
    error_response(&e.to_string(), status_for(e))
}

/// Optional abort body.
#[derive(Debug, Default, Deserialize)]
pub struct AbortRequest {
    #[serde(default)]
    pub reason: String,
}

/// GET /api/v1/rollouts
pub async fn list_rollouts(State(state): State<ApiState>) -> Response {
    match state.engine.list() {
        Ok(rollouts) => ApiResponse::ok(rollouts).into_response(),
        Err(e) => rollout_error(&e),
    }
}

/// POST /api/v1/rollouts
pub async fn create_rollout(
    State(state): State<ApiState>,
    Json(req): Json<NewRollout>,
) -> Response {
    match state.engine.create(req).await {
        Ok(rollout) => (StatusCode::CREATED, ApiResponse::ok(rollout)).into_response(),
        Err(e) => rollout_error(&e),
    }
}

/// GET /api/v1/rollouts/{id}
pub async fn get_rollout(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.engine.get(&id) {
        Ok(rollout) => ApiResponse::ok(rollout).into_response(),
        Err(e) => rollout_error(&e),
    }
}

/// GET /api/v1/rollouts/{id}/devices
pub async fn list_rollout_devices(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Response {
    match state.engine.device_statuses(&id) {
        Ok(rows) => ApiResponse::ok(rows).into_response(),
        Err(e) => rollout_error(&e),
    }
}

/// POST /api/v1/rollouts/{id}/start
pub async fn start_rollout(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.engine.start(&id).await {
        Ok(rollout) => ApiResponse::ok(rollout).into_response(),
        Err(e) => rollout_error(&e),
    }
}

/// POST /api/v1/rollouts/{id}/abort
///
/// The body is optional: `{"reason": "..."}`.
pub async fn abort_rollout(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let req = if body.is_empty() {
        AbortRequest::default()
    } else {
        match serde_json::from_slice::<AbortRequest>(&body) {
            Ok(req) => req,
            Err(e) => {
                return error_response(&format!("invalid abort body: {e}"), StatusCode::BAD_REQUEST);
            }
        }
    };
    match state.engine.abort(&id, &req.reason).await {
        Ok(rollout) => ApiResponse::ok(rollout).into_response(),
        Err(e) => rollout_error(&e),
    }
}

/// GET /api/v1/rollouts/stuck
pub async fn stuck_rollouts(State(state): State<ApiState>) -> Response {
    match state.engine.stuck_rollouts().await {
        Ok(stuck) => ApiResponse::ok(stuck).into_response(),
        Err(e) => rollout_error(&e),
    }
}
