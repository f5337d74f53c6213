//! Status and settings endpoints

use axum::{extract::State, http::StatusCode, Json};

use crate::bus::http_client::ReasoningRequest;
use crate::shared_state::{AppState, StatusReport};

/// GET /status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.service.status())
}

/// POST /settings/reasoning
pub async fn set_reasoning_enabled(
    State(state): State<AppState>,
    Json(req): Json<ReasoningRequest>,
) -> StatusCode {
    state.service.set_reasoning_enabled(req.enabled);
    StatusCode::NO_CONTENT
}
