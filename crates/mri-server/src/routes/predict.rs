use axum::extract::{Multipart, State};
use axum::Json;
use mri_core::error::CoreError;
use serde::Serialize;

use crate::orchestrator;
use crate::routes::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub session_id: String,
    pub queue_position: i64,
    pub models: Vec<String>,
    pub space: &'static str,
}

/// `POST /predict`: multipart file plus `models` (`"all"` or csv) and an
/// optional `space` hint. The file field is the only one the orchestrator
/// treats as required; everything else falls back to sensible defaults.
pub async fn predict(State(state): State<AppState>, mut multipart: Multipart) -> Result<Json<PredictResponse>, ApiError> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut filename: Option<String> = None;
    let mut models = "all".to_string();
    let mut space = "native".to_string();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| CoreError::InputInvalid(format!("malformed multipart body: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "file" => {
                filename = field.file_name().map(|s| s.to_string());
                file_bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| CoreError::InputInvalid(format!("failed reading upload: {e}")))?
                        .to_vec(),
                );
            }
            "models" => {
                models = field
                    .text()
                    .await
                    .map_err(|e| CoreError::InputInvalid(format!("malformed models field: {e}")))?;
            }
            "space" => {
                space = field
                    .text()
                    .await
                    .map_err(|e| CoreError::InputInvalid(format!("malformed space field: {e}")))?;
            }
            _ => {}
        }
    }

    let upload = file_bytes.ok_or_else(|| CoreError::InputInvalid("missing 'file' field".into()))?;
    let filename = filename.ok_or_else(|| CoreError::InputInvalid("upload is missing a filename".into()))?;

    let result = orchestrator::predict(&state, &upload, &filename, &models, &space).await?;

    Ok(Json(PredictResponse {
        session_id: result.session_id.to_string(),
        queue_position: result.queue_position,
        models: result.models,
        space: result.space,
    }))
}
