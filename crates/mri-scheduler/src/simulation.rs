use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mri_core::error::{CoreError, CoreResult};
use mri_core::event_bus::EventBus;
use mri_core::logger::{AuditSink, StructuredLogger};
use mri_core::shared_state::SharedState;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::recipe::Recipe;

const POLL_INTERVAL_MS: u64 = 1000;

/// One `(substring, event_name, progress_pct)` row of a simulator's ordered
/// stdout progress table. The first matching row whose `progress` exceeds
/// the last published value wins.
pub struct StepMapEntry {
    pub substring: &'static str,
    pub event: &'static str,
    pub progress: i32,
}

/// Payload shared by both simulator queues: a target segmentation, an
/// electrode recipe, and the optional overrides accepted by `/simulate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationJob {
    pub session_id: Uuid,
    pub model_name: String,
    pub recipe: Recipe,
    pub electrode_type: Option<Vec<String>>,
    pub electrode_size: Option<Vec<crate::recipe::ElectrodeSize>>,
    pub electrode_ori: Option<Vec<String>>,
    pub mesh_options: Option<crate::recipe::MeshOptions>,
    pub simulation_tag: Option<String>,
    pub quality: Option<String>,
}

/// Implemented once per simulator (ROAST, the second simulator). Carries out
/// the full prepare → configure → launch → collect pipeline for one job;
/// the scheduler only handles queueing, pooling, and status bookkeeping.
#[async_trait]
pub trait SimulationRunner: Send + Sync {
    fn queue_key(&self) -> &'static str;
    fn data_prefix(&self) -> &'static str;
    fn status_prefix(&self) -> &'static str;
    fn progress_prefix(&self) -> &'static str;
    fn worker_name_prefix(&self) -> &'static str;

    async fn run(&self, job: &SimulationJob) -> CoreResult<()>;
}

/// CPU-bound queue for one simulator: dequeues jobs, executes each on a
/// fixed-size worker pool, and republishes status/progress through shared
/// state and the event bus. No accelerator arbitration — GPU locking is
/// segmentation-only.
pub struct SimulationScheduler<R: SimulationRunner + 'static> {
    shared: Arc<dyn SharedState>,
    events: Arc<EventBus>,
    logger: Arc<StructuredLogger>,
    audit: Arc<AuditSink>,
    runner: Arc<R>,
    max_workers: usize,
}

impl<R: SimulationRunner + 'static> SimulationScheduler<R> {
    pub fn new(
        shared: Arc<dyn SharedState>,
        events: Arc<EventBus>,
        logger: Arc<StructuredLogger>,
        audit: Arc<AuditSink>,
        runner: Arc<R>,
        max_workers: usize,
    ) -> Self {
        Self {
            shared,
            events,
            logger,
            audit,
            runner,
            max_workers,
        }
    }

    pub async fn enqueue(&self, job: &SimulationJob) -> CoreResult<()> {
        let payload = serde_json::to_string(job).map_err(|e| anyhow::anyhow!(e))?;
        self.shared
            .set(&format!("{}{}", self.runner.data_prefix(), job.session_id), payload)
            .await?;
        self.shared.rpush(self.runner.queue_key(), job.session_id.to_string()).await?;
        self.shared
            .hset(self.runner.status_prefix(), &job.session_id.to_string(), "queued".to_string())
            .await?;
        self.events.publish(job.session_id, json!({"event": "queued"})).await?;
        self.logger.info(job.session_id, "simulation job enqueued", Some(json!({"model": job.model_name})))?;
        Ok(())
    }

    /// Main dequeue loop: `LPop` with a short sleep on empty, handing each
    /// job to the bounded worker pool without blocking the next poll.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(prefix = self.runner.worker_name_prefix(), "simulation scheduler started");
        let semaphore = Arc::new(Semaphore::new(self.max_workers.max(1)));
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(prefix = self.runner.worker_name_prefix(), "simulation scheduler shutting down");
                        break;
                    }
                }
                popped = self.shared.lpop(self.runner.queue_key()) => {
                    match popped {
                        Ok(Some(sid_str)) => {
                            if let Ok(sid) = sid_str.parse::<Uuid>() {
                                let scheduler = self.clone();
                                let semaphore = semaphore.clone();
                                tasks.spawn(async move {
                                    let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                                    scheduler.run_job(sid).await;
                                });
                            }
                        }
                        Ok(None) => {
                            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "shared state unreachable, backing off");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }

        while tasks.join_next().await.is_some() {}
    }

    async fn run_job(&self, sid: Uuid) {
        let Ok(Some(raw)) = self.shared.get(&format!("{}{sid}", self.runner.data_prefix())).await else {
            warn!(session = %sid, "missing simulation job payload in shared state");
            return;
        };
        let Ok(job): Result<SimulationJob, _> = serde_json::from_str(&raw) else {
            warn!(session = %sid, "malformed simulation job payload");
            return;
        };

        self.shared
            .hset(self.runner.status_prefix(), &sid.to_string(), "running".to_string())
            .await
            .ok();
        self.events.publish(sid, json!({"event": "sim_start", "progress": 2})).await.ok();
        self.logger.info(sid, "simulation job dequeued", Some(json!({"model": job.model_name}))).ok();

        match self.runner.run(&job).await {
            Ok(()) => {
                self.shared
                    .hset(self.runner.status_prefix(), &sid.to_string(), "complete".to_string())
                    .await
                    .ok();
                self.audit.append(sid, &job.model_name, "sim_complete", "");
            }
            Err(e) => {
                self.shared
                    .hset(self.runner.status_prefix(), &sid.to_string(), "error".to_string())
                    .await
                    .ok();
                self.events
                    .publish(sid, json!({"event": "sim_error", "progress": -1, "detail": e.to_string()}))
                    .await
                    .ok();
                self.logger.error(sid, &format!("simulation failed: {e}"), None).ok();
                self.audit.append(sid, &job.model_name, "sim_error", &e.to_string());
            }
        }
    }
}

/// Shared helper: emits a progress event only if it advances past the
/// session's last-published percentage, matching the "strictly increasing"
/// publish rule both simulators follow.
pub struct ProgressGate {
    last: i32,
}

impl ProgressGate {
    pub fn new(start: i32) -> Self {
        Self { last: start }
    }

    pub fn advance(&mut self, progress: i32) -> bool {
        if progress > self.last {
            self.last = progress;
            true
        } else {
            false
        }
    }
}

/// Scans a line against an ordered step-map table, returning the first
/// match whose progress exceeds `gate`'s last published value.
pub fn match_step<'a>(line: &str, table: &'a [StepMapEntry], gate: &mut ProgressGate) -> Option<(&'a str, i32)> {
    for entry in table {
        if line.contains(entry.substring) && gate.advance(entry.progress) {
            return Some((entry.event, entry.progress));
        }
    }
    None
}

pub fn expect_outputs(dir: &std::path::Path, expected: &[&str]) -> CoreResult<()> {
    let missing: Vec<PathBuf> = expected
        .iter()
        .map(|kind| dir.join(format!("{kind}.nii.gz")))
        .filter(|p| !p.exists())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(CoreError::MissingOutput(
            missing.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_gate_only_advances_on_strictly_greater_values() {
        let mut gate = ProgressGate::new(5);
        assert!(gate.advance(10));
        assert!(!gate.advance(10));
        assert!(!gate.advance(3));
        assert!(gate.advance(20));
    }

    #[test]
    fn match_step_returns_the_first_row_whose_substring_matches_and_advances() {
        let table = [
            StepMapEntry { substring: "STEP 3", event: "roast_step_electrode", progress: 20 },
            StepMapEntry { substring: "STEP 4", event: "roast_step_mesh", progress: 35 },
        ];
        let mut gate = ProgressGate::new(10);
        let hit = match_step("running STEP 3 now", &table, &mut gate);
        assert_eq!(hit, Some(("roast_step_electrode", 20)));
        // A repeat of the same line must not re-fire since progress didn't advance.
        assert_eq!(match_step("running STEP 3 now", &table, &mut gate), None);
    }

    #[test]
    fn expect_outputs_reports_every_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("voltage.nii.gz"), b"x").unwrap();
        let err = expect_outputs(dir.path(), &["voltage", "efield", "emag"]).unwrap_err();
        assert_eq!(err.kind(), "missing_output");
    }
}
