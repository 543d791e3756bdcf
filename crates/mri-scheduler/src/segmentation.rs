use std::path::PathBuf;
use std::sync::Arc;

use mri_core::arbiter::ResourceArbiter;
use mri_core::error::CoreResult;
use mri_core::event_bus::EventBus;
use mri_core::logger::{AuditSink, StructuredLogger};
use mri_core::shared_state::SharedState;
use mri_pipeline::{Predictor, PipelineRunner};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

const JOB_QUEUE_KEY: &str = "job_queue";
const JOB_DATA_PREFIX: &str = "job_data:";
const JOB_STATUS_PREFIX: &str = "job_status";
const POLL_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub model_name: String,
    pub input_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub session_id: Uuid,
    pub plan: Vec<Step>,
}

pub type PredictorFactory = Arc<dyn Fn() -> Box<dyn Predictor> + Send + Sync>;

/// Dequeues segmentation jobs, fans each job's independent model steps out
/// across a bounded worker pool gated by the resource arbiter, and
/// publishes the job's terminal event only after every step has settled.
pub struct SegmentationScheduler {
    shared: Arc<dyn SharedState>,
    arbiter: Arc<ResourceArbiter>,
    events: Arc<EventBus>,
    logger: Arc<StructuredLogger>,
    audit: Arc<AuditSink>,
    runner: Arc<PipelineRunner>,
    predictor_factory: PredictorFactory,
    gpu_count: usize,
}

impl SegmentationScheduler {
    pub fn new(
        shared: Arc<dyn SharedState>,
        arbiter: Arc<ResourceArbiter>,
        events: Arc<EventBus>,
        logger: Arc<StructuredLogger>,
        audit: Arc<AuditSink>,
        runner: Arc<PipelineRunner>,
        predictor_factory: PredictorFactory,
        gpu_count: usize,
    ) -> Self {
        Self {
            shared,
            arbiter,
            events,
            logger,
            audit,
            runner,
            predictor_factory,
            gpu_count,
        }
    }

    /// Enqueues a job, publishes `queued`, and marks each step `queued` in
    /// the per-model status hash.
    pub async fn enqueue(&self, job: &Job) -> CoreResult<()> {
        let payload = serde_json::to_string(job).map_err(|e| anyhow::anyhow!(e))?;
        self.shared.set(&format!("{JOB_DATA_PREFIX}{}", job.session_id), payload).await?;
        self.shared.rpush(JOB_QUEUE_KEY, job.session_id.to_string()).await?;

        for step in &job.plan {
            self.shared
                .hset(
                    &format!("{JOB_STATUS_PREFIX}:{}", job.session_id),
                    &step.model_name,
                    "queued".to_string(),
                )
                .await?;
        }

        self.events.publish(job.session_id, json!({"event": "queued"})).await?;
        self.logger.info(job.session_id, "job enqueued", Some(json!({"models": job.plan.iter().map(|s| &s.model_name).collect::<Vec<_>>()})))?;
        Ok(())
    }

    pub async fn queue_position(&self, sid: Uuid) -> CoreResult<i64> {
        let items = self.shared.lrange(JOB_QUEUE_KEY, 0, -1).await?;
        Ok(items
            .iter()
            .position(|s| s == &sid.to_string())
            .map(|i| i as i64)
            .unwrap_or(-1))
    }

    /// Main dequeue loop. Never blocks on a running job: each dequeued job
    /// is handed to a detached task while the loop immediately polls again.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("segmentation scheduler started");
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("segmentation scheduler shutting down");
                        break;
                    }
                }
                popped = self.shared.lpop(JOB_QUEUE_KEY) => {
                    match popped {
                        Ok(Some(sid_str)) => {
                            if let Ok(sid) = sid_str.parse::<Uuid>() {
                                let scheduler = self.clone();
                                tasks.spawn(async move { scheduler.run_job(sid).await });
                            }
                        }
                        Ok(None) => {
                            tokio::time::sleep(std::time::Duration::from_millis(POLL_INTERVAL_MS)).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "shared state unreachable, backing off");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }

        while tasks.join_next().await.is_some() {}
    }

    async fn run_job(&self, sid: Uuid) {
        let Ok(Some(raw)) = self.shared.get(&format!("{JOB_DATA_PREFIX}{sid}")).await else {
            warn!(session = %sid, "missing job payload in shared state");
            return;
        };
        let Ok(job): Result<Job, _> = serde_json::from_str(&raw) else {
            warn!(session = %sid, "malformed job payload");
            return;
        };

        self.logger.info(sid, "job started", None).ok();
        self.events.publish(sid, json!({"event": "job_start"})).await.ok();

        let pool_size = job.plan.len().min(self.gpu_count.max(1));
        let semaphore = Arc::new(tokio::sync::Semaphore::new(pool_size));
        let mut tasks = JoinSet::new();

        for step in job.plan.clone() {
            let semaphore = semaphore.clone();
            let sid = sid;
            let arbiter = self.arbiter.clone();
            let runner = self.runner.clone();
            let shared = self.shared.clone();
            let events = self.events.clone();
            let audit = self.audit.clone();
            let predictor_factory = self.predictor_factory.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                shared
                    .hset(&format!("{JOB_STATUS_PREFIX}:{sid}"), &step.model_name, "waiting_gpu".to_string())
                    .await
                    .ok();

                let slot = arbiter
                    .acquire_blocking(sid, &step.model_name, std::time::Duration::from_millis(150))
                    .await;

                let slot = match slot {
                    Ok(slot) => slot,
                    Err(e) => {
                        warn!(session = %sid, model = %step.model_name, error = %e, "arbiter unreachable");
                        return (step.model_name, false);
                    }
                };

                shared
                    .hset(&format!("{JOB_STATUS_PREFIX}:{sid}"), &step.model_name, "running".to_string())
                    .await
                    .ok();

                let mut predictor = predictor_factory();
                let result = runner.run(sid, &step.model_name, step.input_path.clone(), slot, predictor.as_mut()).await;
                arbiter.release(slot).await.ok();

                match result {
                    Ok(_) => {
                        shared
                            .hset(&format!("{JOB_STATUS_PREFIX}:{sid}"), &step.model_name, "complete".to_string())
                            .await
                            .ok();
                        audit.append(sid, &step.model_name, "model_complete", "");
                        (step.model_name, true)
                    }
                    Err(e) => {
                        shared
                            .hset(&format!("{JOB_STATUS_PREFIX}:{sid}"), &step.model_name, "error".to_string())
                            .await
                            .ok();
                        events
                            .publish(sid, json!({"event": "model_error", "model": step.model_name, "detail": e.to_string()}))
                            .await
                            .ok();
                        audit.append(sid, &step.model_name, "model_error", &e.to_string());
                        (step.model_name, false)
                    }
                }
            });
        }

        let mut failures = Vec::new();
        while let Some(result) = tasks.join_next().await {
            if let Ok((model, ok)) = result {
                if !ok {
                    failures.push(model);
                }
            }
        }

        if failures.is_empty() {
            self.events.publish(sid, json!({"event": "job_complete", "progress": 100})).await.ok();
            self.logger.info(sid, "job complete", None).ok();
        } else {
            self.events
                .publish(sid, json!({"event": "job_failed", "progress": -1, "detail": failures.join(",")}))
                .await
                .ok();
            self.logger.error(sid, &format!("job failed: {}", failures.join(",")), None).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mri_core::registry::ModelRegistry;
    use mri_core::session::SessionStore;
    use mri_core::shared_state::InMemorySharedState;
    use mri_core::CoreResult;
    use mri_pipeline::{ExternalResampler, Volume, VolumeDtype, VolumeMetadata, VolumeStore};
    use ndarray::Array3;

    struct FakeVolumeStore;

    #[async_trait]
    impl VolumeStore for FakeVolumeStore {
        async fn load(&self, _path: &std::path::Path) -> CoreResult<Volume> {
            let mut affine = [[0.0; 4]; 4];
            affine[0][0] = 1.0;
            affine[1][1] = 1.0;
            affine[2][2] = 1.0;
            affine[3][3] = 1.0;
            Ok(Volume {
                data: Array3::<f32>::zeros((4, 4, 4)),
                metadata: VolumeMetadata {
                    affine,
                    header: vec![],
                    original_shape: (4, 4, 4),
                    dtype: VolumeDtype::Float32,
                },
            })
        }

        async fn save(&self, path: &std::path::Path, volume: &Volume) -> CoreResult<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, format!("{:?}", volume.data.dim()))?;
            Ok(())
        }
    }

    struct FakeResampler;

    #[async_trait]
    impl ExternalResampler for FakeResampler {
        async fn to_conformed(&self, _input: &std::path::Path, _output: &std::path::Path) -> CoreResult<()> {
            Ok(())
        }

        async fn to_native(&self, _segmentation: &std::path::Path, _reference: &std::path::Path, _output: &std::path::Path) -> CoreResult<()> {
            Ok(())
        }
    }

    struct FakePredictor;

    #[async_trait]
    impl Predictor for FakePredictor {
        async fn load(&mut self, _checkpoint_path: &std::path::Path) -> CoreResult<()> {
            Ok(())
        }

        async fn predict(&self, tile: &Array3<f32>, num_classes: usize, _tile_batch: usize) -> CoreResult<ndarray::Array4<f32>> {
            let dim = tile.dim();
            Ok(ndarray::Array4::<f32>::zeros((1, num_classes, dim.0, dim.1)))
        }
    }

    fn make_scheduler(dir: &std::path::Path) -> (Arc<SegmentationScheduler>, Arc<dyn SharedState>) {
        let shared: Arc<dyn SharedState> = Arc::new(InMemorySharedState::new());
        let arbiter = Arc::new(ResourceArbiter::new(shared.clone(), 1));
        let events = Arc::new(EventBus::new(shared.clone(), "secret".into()));
        let logger = Arc::new(StructuredLogger::new(dir.to_path_buf()));
        let audit = Arc::new(AuditSink::open(&dir.join("audit.db")).unwrap());
        let registry = Arc::new(ModelRegistry::with_model_root(dir));
        let sessions = Arc::new(SessionStore::new(
            dir.to_path_buf(),
            Arc::new(mri_core::clock::SystemClock),
            logger.clone(),
        ));
        let runner = Arc::new(PipelineRunner::new(
            sessions,
            registry,
            events.clone(),
            shared.clone(),
            logger.clone(),
            Arc::new(FakeVolumeStore),
            Arc::new(FakeResampler),
        ));

        let scheduler = Arc::new(SegmentationScheduler::new(
            shared.clone(),
            arbiter,
            events,
            logger,
            audit,
            runner,
            Arc::new(|| Box::new(FakePredictor) as Box<dyn Predictor>),
            1,
        ));
        (scheduler, shared)
    }

    #[tokio::test]
    async fn enqueue_sets_per_model_status_and_queue_position() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _shared) = make_scheduler(dir.path());

        let job = Job {
            session_id: Uuid::new_v4(),
            plan: vec![Step {
                model_name: "grace-native".into(),
                input_path: PathBuf::from("/tmp/in.nii.gz"),
            }],
        };

        scheduler.enqueue(&job).await.unwrap();
        assert_eq!(scheduler.queue_position(job.session_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn step_isolation_one_failure_does_not_block_the_other() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, shared) = make_scheduler(dir.path());

        // grace-native's checkpoint is missing (never created); domino-native's
        // checkpoint is created so it can load and complete.
        std::fs::write(dir.path().join("domino_native.pth"), b"fake").unwrap();

        let sid = Uuid::new_v4();
        let job = Job {
            session_id: sid,
            plan: vec![
                Step {
                    model_name: "grace-native".into(),
                    input_path: PathBuf::from("/tmp/in.nii.gz"),
                },
                Step {
                    model_name: "domino-native".into(),
                    input_path: PathBuf::from("/tmp/in.nii.gz"),
                },
            ],
        };

        scheduler.enqueue(&job).await.unwrap();
        let popped = shared.lpop(JOB_QUEUE_KEY).await.unwrap().unwrap();
        assert_eq!(popped, sid.to_string());
        scheduler.run_job(sid).await;

        let status = shared.hget_all(&format!("{JOB_STATUS_PREFIX}:{sid}")).await.unwrap();
        assert_eq!(status.get("grace-native").map(String::as_str), Some("error"));
        assert_eq!(status.get("domino-native").map(String::as_str), Some("complete"));
    }
}
