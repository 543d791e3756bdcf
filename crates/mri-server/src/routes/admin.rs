use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use mri_core::error::CoreError;
use uuid::Uuid;

use crate::routes::ApiError;
use crate::state::AppState;

/// `GET /admin/logs/{sid}`: the raw per-session JSONL log file.
pub async fn logs(State(state): State<AppState>, Path(sid): Path<Uuid>) -> Result<Response, ApiError> {
    state.sessions.require_exists(sid)?;
    let path = state.sessions.logs_path(sid);
    if !path.exists() {
        return Err(CoreError::MissingOutput(path.display().to_string()).into());
    }
    let body = std::fs::read_to_string(&path).map_err(CoreError::Io)?;
    Ok((StatusCode::OK, [(header::CONTENT_TYPE, "application/jsonl")], body).into_response())
}

/// `GET /admin/audit`: the last 500 audit rows, newest first.
pub async fn audit(State(state): State<AppState>) -> Result<Response, ApiError> {
    let rows = state.audit.recent(500)?;
    Ok(Json(rows).into_response())
}
