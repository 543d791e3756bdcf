use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::routes::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct GpuUsage {
    pub gpu: usize,
    pub util: f64,
    pub mem_used: u64,
    pub mem_total: u64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub shared_state_ok: bool,
    pub gpu_usage: Vec<GpuUsage>,
    pub queue_length: i64,
    pub gpu_count: usize,
}

/// `GET /health`: shared-state reachability, per-slot occupancy (as a
/// binary 0/100 utilization proxy — this deployment has no vendor GPU
/// telemetry library wired in, so `mem_used`/`mem_total` stay at 0), and
/// the segmentation queue depth.
pub async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let queue_length_result = state.shared.llen("job_queue").await;
    let shared_state_ok = queue_length_result.is_ok();
    let queue_length = queue_length_result.unwrap_or(0);

    let snapshot = state.arbiter.snapshot().await.unwrap_or_default();
    let gpu_usage = snapshot
        .into_iter()
        .map(|(slot, owner)| GpuUsage {
            gpu: slot,
            util: if owner == "free" { 0.0 } else { 100.0 },
            mem_used: 0,
            mem_total: 0,
        })
        .collect();

    Ok(Json(HealthResponse {
        shared_state_ok,
        gpu_usage,
        queue_length,
        gpu_count: state.config.gpu_count,
    }))
}
