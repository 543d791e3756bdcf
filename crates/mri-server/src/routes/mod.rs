pub mod admin;
pub mod health;
pub mod predict;
pub mod results;
pub mod simulate;
pub mod stream;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use mri_core::error::CoreError;
use serde_json::json;

/// Maps the shared error taxonomy onto the HTTP boundary: every handler
/// returns `Result<T, ApiError>` and this is the single place that turns a
/// `CoreError` into a status code and a JSON body.
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({"error": self.0.kind(), "detail": self.0.to_string()}));
        (status, body).into_response()
    }
}
