//! `/predict` façade: validates the upload, decides the model/space plan,
//! and enqueues the resulting job — the only place in the service that
//! turns an HTTP request into a segmentation job.

use std::sync::Arc;

use mri_core::error::{CoreError, CoreResult};
use mri_core::registry::InputSpace;
use mri_pipeline::ExternalResampler;
use mri_scheduler::{Job, Step};
use uuid::Uuid;

use crate::state::AppState;

pub struct PredictResult {
    pub session_id: Uuid,
    pub queue_position: i64,
    pub models: Vec<String>,
    pub space: &'static str,
}

/// `models` is either the literal `"all"` or a comma-separated list of
/// registry names. `requested_space` hints which input space callers
/// prefer when a model can accept either; models with a fixed required
/// space always route there regardless of the hint.
pub async fn predict(state: &AppState, upload: &[u8], filename: &str, models: &str, requested_space: &str) -> CoreResult<PredictResult> {
    if !(filename.ends_with(".nii") || filename.ends_with(".nii.gz")) {
        return Err(CoreError::InputInvalid(format!(
            "unsupported file extension in '{filename}'; expected .nii or .nii.gz"
        )));
    }

    let sid = state.sessions.create()?;
    let native_path = state.sessions.native_input(sid)?;
    persist_upload(upload, filename, &native_path)?;

    let model_names: Vec<String> = if models.trim().eq_ignore_ascii_case("all") {
        state.registry.list().iter().map(|s| s.to_string()).collect()
    } else {
        models.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
    };

    if model_names.is_empty() {
        return Err(CoreError::InputInvalid("models must be \"all\" or a non-empty comma-separated list".into()));
    }

    let mut conformed_ready = false;
    let mut plan = Vec::with_capacity(model_names.len());

    for name in &model_names {
        let entry = state
            .registry
            .get(name)
            .ok_or_else(|| CoreError::MissingModel(name.clone()))?;

        let input_path = match entry.input_space {
            InputSpace::Native => native_path.clone(),
            InputSpace::Conformed => {
                let conformed_path = state.sessions.conformed_input(sid)?;
                if !conformed_ready {
                    ensure_resampler(state).to_conformed(&native_path, &conformed_path).await?;
                    conformed_ready = true;
                }
                conformed_path
            }
        };

        plan.push(Step {
            model_name: name.clone(),
            input_path,
        });
    }

    let job = Job { session_id: sid, plan };
    state.segmentation.enqueue(&job).await?;
    let queue_position = state.segmentation.queue_position(sid).await?;

    let space: &'static str = if conformed_ready { "conformed" } else { "native" };
    let _ = requested_space;

    Ok(PredictResult {
        session_id: sid,
        queue_position,
        models: model_names,
        space,
    })
}

fn persist_upload(upload: &[u8], filename: &str, dest: &std::path::Path) -> CoreResult<()> {
    use std::io::Write;
    if filename.ends_with(".nii.gz") {
        std::fs::write(dest, upload)?;
    } else {
        let file = std::fs::File::create(dest)?;
        let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::fast());
        encoder.write_all(upload)?;
        encoder.finish()?;
    }
    Ok(())
}

fn ensure_resampler(state: &AppState) -> Arc<dyn ExternalResampler> {
    Arc::new(mri_pipeline::FreeSurferResampler {
        mri_convert_path: state.config.mri_convert_path.clone(),
        mri_vol2vol_path: state.config.mri_vol2vol_path.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mri_core::{AuditSink, InMemorySharedState, ModelRegistry, ResourceArbiter, SessionStore, StructuredLogger};
    use mri_pipeline::{PipelineRunner, RawVolumeStore, UnimplementedPredictor};
    use mri_scheduler::{RoastRunner, SegmentationScheduler, SimNibsRunner, SimulationScheduler};
    use std::time::Duration;

    fn fixture(dir: &std::path::Path) -> AppState {
        let config = Arc::new(AppConfig {
            session_root: dir.to_path_buf(),
            model_root: dir.to_path_buf(),
            shared_host: "127.0.0.1".into(),
            shared_port: 6379,
            hmac_secret: "test-secret".into(),
            gpu_count: 1,
            job_timeout: Duration::from_secs(0),
            sim_max_workers: 1,
            sim_timeout: Duration::from_secs(60),
            mri_convert_path: dir.join("mri_convert"),
            mri_vol2vol_path: dir.join("mri_vol2vol"),
            roast_build_dir: dir.join("roast"),
            matlab_runtime_path: dir.join("mcr"),
            simnibs_bin: dir.join("simnibs"),
            charm_bin: dir.join("charm"),
            retention_window: Duration::from_secs(86400),
            audit_db_path: dir.join("audit.db"),
        });

        let shared: Arc<dyn mri_core::SharedState> = Arc::new(InMemorySharedState::new());
        let logger = Arc::new(StructuredLogger::new(config.session_root.clone()));
        let audit = Arc::new(AuditSink::open(&config.audit_db_path).unwrap());
        let events = Arc::new(mri_core::EventBus::new(shared.clone(), config.hmac_secret.clone()));
        let arbiter = Arc::new(ResourceArbiter::new(shared.clone(), config.gpu_count));
        let registry = Arc::new(ModelRegistry::with_model_root(&config.model_root));
        let sessions = Arc::new(SessionStore::new(config.session_root.clone(), Arc::new(mri_core::SystemClock), logger.clone()));

        let runner = Arc::new(PipelineRunner::new(
            sessions.clone(),
            registry.clone(),
            events.clone(),
            shared.clone(),
            logger.clone(),
            Arc::new(RawVolumeStore),
            Arc::new(mri_pipeline::FreeSurferResampler {
                mri_convert_path: config.mri_convert_path.clone(),
                mri_vol2vol_path: config.mri_vol2vol_path.clone(),
            }),
        ));

        let segmentation = Arc::new(SegmentationScheduler::new(
            shared.clone(),
            arbiter.clone(),
            events.clone(),
            logger.clone(),
            audit.clone(),
            runner,
            Arc::new(|| Box::new(UnimplementedPredictor) as Box<dyn mri_pipeline::Predictor>),
            config.gpu_count,
        ));

        let roast_runner = Arc::new(RoastRunner {
            sessions: sessions.clone(),
            events: events.clone(),
            logger: logger.clone(),
            build_dir: config.roast_build_dir.clone(),
            matlab_runtime_path: config.matlab_runtime_path.clone(),
            timeout: config.sim_timeout,
        });
        let roast = Arc::new(SimulationScheduler::new(shared.clone(), events.clone(), logger.clone(), audit.clone(), roast_runner, 1));

        let simnibs_runner = Arc::new(SimNibsRunner {
            sessions: sessions.clone(),
            events: events.clone(),
            logger: logger.clone(),
            volumes: Arc::new(RawVolumeStore),
            charm_bin: config.charm_bin.clone(),
            fem_solver_bin: config.simnibs_bin.clone(),
            timeout: config.sim_timeout,
        });
        let simnibs = Arc::new(SimulationScheduler::new(shared.clone(), events.clone(), logger.clone(), audit.clone(), simnibs_runner, 1));

        AppState {
            config,
            sessions,
            registry,
            events,
            arbiter,
            shared,
            logger,
            audit,
            segmentation,
            roast,
            simnibs,
        }
    }

    #[tokio::test]
    async fn rejects_non_nifti_filenames() {
        let dir = tempfile::tempdir().unwrap();
        let state = fixture(dir.path());
        let err = predict(&state, b"not a scan", "upload.txt", "all", "native").await.unwrap_err();
        assert_eq!(err.kind(), "input_invalid");
    }

    #[tokio::test]
    async fn enqueues_native_only_models_without_resampling() {
        let dir = tempfile::tempdir().unwrap();
        let state = fixture(dir.path());
        let result = predict(&state, b"fake-volume-bytes", "scan.nii.gz", "grace-native,domino-native", "native")
            .await
            .unwrap();

        assert_eq!(result.models, vec!["grace-native", "domino-native"]);
        assert_eq!(result.space, "native");
        assert!(state.sessions.native_input(result.session_id).unwrap().exists());
    }

    #[tokio::test]
    async fn unknown_model_name_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let state = fixture(dir.path());
        let err = predict(&state, b"fake-volume-bytes", "scan.nii", "not-a-real-model", "native")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "missing_model");
    }
}
