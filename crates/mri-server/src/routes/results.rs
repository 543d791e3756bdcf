use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use mri_core::error::CoreError;
use uuid::Uuid;

use crate::routes::ApiError;
use crate::state::AppState;

fn gzip_file_response(path: &std::path::Path) -> Result<Response, ApiError> {
    if !path.exists() {
        return Err(CoreError::MissingOutput(path.display().to_string()).into());
    }
    let bytes = std::fs::read(path).map_err(CoreError::Io)?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/gzip")],
        bytes,
    )
        .into_response())
}

/// `GET /results/{sid}/input`: the gzipped native upload.
pub async fn get_input(State(state): State<AppState>, Path(sid): Path<Uuid>) -> Result<Response, ApiError> {
    state.sessions.require_exists(sid)?;
    let path = state.sessions.native_input(sid)?;
    gzip_file_response(&path)
}

/// `GET /results/{sid}/{model}`: the gzipped segmentation label volume for
/// one model.
pub async fn get_result(State(state): State<AppState>, Path((sid, model)): Path<(Uuid, String)>) -> Result<Response, ApiError> {
    state.sessions.require_exists(sid)?;
    let path = state.sessions.model_output(sid, &model)?;
    gzip_file_response(&path)
}

/// `GET /simulate/results/{sid}/{model}/{kind}`: one field output
/// (`voltage`, `efield`, `emag`) from a ROAST or second-simulator run.
/// The simulator is inferred from the file layout: ROAST writes its outputs
/// directly under `roast/`, the second simulator under `simnibs/<model>/`.
pub async fn get_simulation_result(
    State(state): State<AppState>,
    Path((sid, model, kind)): Path<(Uuid, String, String)>,
) -> Result<Response, ApiError> {
    if !matches!(kind.as_str(), "voltage" | "efield" | "emag") {
        return Err(CoreError::InputInvalid(format!("unknown output kind '{kind}'")).into());
    }
    state.sessions.require_exists(sid)?;

    let roast_path = state.sessions.simulation_workdir(sid, "roast", None)?.join(format!("{kind}.nii.gz"));
    if roast_path.exists() {
        return gzip_file_response(&roast_path);
    }
    let simnibs_path = state
        .sessions
        .simulation_workdir(sid, "simnibs", Some(&model))?
        .join("outputs")
        .join(format!("{kind}.nii.gz"));
    gzip_file_response(&simnibs_path)
}
