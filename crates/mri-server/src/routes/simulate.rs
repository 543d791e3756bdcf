use axum::extract::State;
use axum::Json;
use mri_core::error::CoreError;
use mri_scheduler::{validate_recipe, ElectrodeSize, MeshOptions, Recipe, RoastConfig};
use mri_scheduler::SimulationJob;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::routes::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SimulateRequest {
    pub session_id: Uuid,
    pub model_name: String,
    pub recipe: Option<Recipe>,
    pub electrode_type: Option<Vec<String>>,
    pub electrode_size: Option<Vec<ElectrodeSize>>,
    pub electrode_ori: Option<Vec<String>>,
    pub mesh_options: Option<MeshOptions>,
    pub simulation_tag: Option<String>,
    pub quality: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SimulateResponse {
    pub session_id: String,
    pub status: &'static str,
}

fn into_job(req: SimulateRequest) -> Result<SimulationJob, ApiError> {
    let recipe = req.recipe.unwrap_or_else(RoastConfig::default_recipe);
    validate_recipe(&recipe)?;

    Ok(SimulationJob {
        session_id: req.session_id,
        model_name: req.model_name,
        recipe,
        electrode_type: req.electrode_type,
        electrode_size: req.electrode_size,
        electrode_ori: req.electrode_ori,
        mesh_options: req.mesh_options,
        simulation_tag: req.simulation_tag,
        quality: req.quality,
    })
}

fn require_segmentation_output(state: &AppState, sid: Uuid, model: &str) -> Result<(), ApiError> {
    state.sessions.require_exists(sid)?;
    let path = state.sessions.model_output(sid, model)?;
    if !path.exists() {
        return Err(CoreError::MissingOutput(format!(
            "no segmentation output for model '{model}' in session {sid}; run /predict first"
        ))
        .into());
    }
    Ok(())
}

/// `POST /simulate`: enqueues a ROAST electrical-field simulation against an
/// existing segmentation.
pub async fn simulate_roast(State(state): State<AppState>, Json(req): Json<SimulateRequest>) -> Result<Json<SimulateResponse>, ApiError> {
    require_segmentation_output(&state, req.session_id, &req.model_name)?;
    let job = into_job(req)?;
    let session_id = job.session_id;
    state.roast.enqueue(&job).await?;
    Ok(Json(SimulateResponse { session_id: session_id.to_string(), status: "queued" }))
}

/// `POST /simulate/simnibs`: enqueues the second simulator's head-meshing
/// plus FEM solve against an existing segmentation.
pub async fn simulate_simnibs(State(state): State<AppState>, Json(req): Json<SimulateRequest>) -> Result<Json<SimulateResponse>, ApiError> {
    require_segmentation_output(&state, req.session_id, &req.model_name)?;
    let job = into_job(req)?;
    let session_id = job.session_id;
    state.simnibs.enqueue(&job).await?;
    Ok(Json(SimulateResponse { session_id: session_id.to_string(), status: "queued" }))
}
