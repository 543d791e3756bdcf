use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mri_core::error::{CoreError, CoreResult};
use mri_core::event_bus::EventBus;
use mri_core::logger::StructuredLogger;
use mri_core::session::SessionStore;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::info;

use crate::recipe::RoastConfig;
use crate::simulation::{expect_outputs, match_step, ProgressGate, SimulationJob, SimulationRunner, StepMapEntry};

const STEP_MAP: &[StepMapEntry] = &[
    StepMapEntry { substring: "STEP 2.5", event: "roast_step_csf_fix", progress: 10 },
    StepMapEntry { substring: "STEP 3", event: "roast_step_electrode", progress: 20 },
    StepMapEntry { substring: "STEP 4", event: "roast_step_mesh", progress: 35 },
    StepMapEntry { substring: "STEP 5", event: "roast_step_solve", progress: 60 },
    StepMapEntry { substring: "STEP 6", event: "roast_step_postprocess", progress: 85 },
    StepMapEntry { substring: "ROAST_RUN: COMPLETE", event: "roast_complete", progress: 100 },
];

const EXPECTED_OUTPUTS: &[&str] = &["voltage", "efield", "emag"];

/// Drives the ROAST tDCS simulator binary: a per-session working directory
/// bypassing ROAST's own SPM segmentation step, a generated `config.json`,
/// and a compiled MATLAB-runtime launcher whose stdout carries step markers.
pub struct RoastRunner {
    pub sessions: Arc<SessionStore>,
    pub events: Arc<EventBus>,
    pub logger: Arc<StructuredLogger>,
    pub build_dir: PathBuf,
    pub matlab_runtime_path: PathBuf,
    pub timeout: Duration,
}

impl RoastRunner {
    /// Gunzips the native T1 and the chosen segmentation mask into the
    /// working directory, and writes a dummy `c1T1_T1orT2.nii` so ROAST
    /// skips its own SPM-based segmentation (step 1) in favour of ours.
    fn prepare_working_directory(&self, sid: uuid::Uuid, model_name: &str, work_dir: &Path) -> CoreResult<PathBuf> {
        let t1_gz = self.sessions.native_input(sid)?;
        let t1_nii = work_dir.join("T1.nii");
        gunzip(&t1_gz, &t1_nii)?;

        let mask_gz = self.sessions.model_output(sid, model_name)?;
        let mask_nii = work_dir.join("T1_T1orT2_masks.nii");
        gunzip(&mask_gz, &mask_nii)?;

        let dummy_c1 = work_dir.join("c1T1_T1orT2.nii");
        std::fs::copy(&t1_nii, &dummy_c1)?;

        Ok(t1_nii)
    }

    fn write_config(&self, job: &SimulationJob, t1_path: &Path, work_dir: &Path) -> CoreResult<PathBuf> {
        let mut cfg = RoastConfig::new(t1_path.display().to_string(), job.recipe.clone())?;
        if let Some(electype) = &job.electrode_type {
            cfg.electype = electype.clone();
        }
        if let Some(elecsize) = &job.electrode_size {
            cfg.elecsize = elecsize.clone();
        }
        if let Some(elecori) = &job.electrode_ori {
            cfg.elecori = elecori.clone();
        }
        if let Some(mesh_options) = &job.mesh_options {
            cfg.meshoptions = mesh_options.clone();
        }
        if let Some(tag) = &job.simulation_tag {
            cfg.simulationtag = tag.clone();
        }

        let config_path = work_dir.join("config.json");
        let body = serde_json::to_vec_pretty(&cfg).map_err(|e| anyhow::anyhow!(e))?;
        std::fs::write(&config_path, body)?;
        Ok(config_path)
    }

    fn build_command(&self, config_path: &Path) -> CoreResult<Command> {
        let launcher = self.build_dir.join("run_roast_run.sh");
        if !launcher.exists() {
            return Err(CoreError::Subprocess(format!(
                "ROAST launcher not found: {}",
                launcher.display()
            )));
        }
        let mut cmd = Command::new(launcher);
        cmd.arg(&self.matlab_runtime_path).arg(config_path);
        Ok(cmd)
    }
}

#[async_trait]
impl SimulationRunner for RoastRunner {
    fn queue_key(&self) -> &'static str {
        "roast_job_queue"
    }

    fn data_prefix(&self) -> &'static str {
        "roast_job_data:"
    }

    fn status_prefix(&self) -> &'static str {
        "roast_job_status"
    }

    fn progress_prefix(&self) -> &'static str {
        "roast_progress"
    }

    fn worker_name_prefix(&self) -> &'static str {
        "roast"
    }

    async fn run(&self, job: &SimulationJob) -> CoreResult<()> {
        let sid = job.session_id;
        let work_dir = self.sessions.simulation_workdir(sid, "roast", None)?;

        self.events.publish(sid, json!({"event": "roast_prepare", "progress": 5})).await.ok();
        let t1_path = self.prepare_working_directory(sid, &job.model_name, &work_dir)?;

        let config_path = self.write_config(job, &t1_path, &work_dir)?;
        let mut cmd = self.build_command(&config_path)?;
        cmd.current_dir(&work_dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        info!(session = %sid, "launching ROAST binary");
        let mut child = cmd.spawn().map_err(|e| CoreError::Subprocess(e.to_string()))?;
        let stdout = child.stdout.take().expect("piped stdout");
        let mut lines = BufReader::new(stdout).lines();

        let mut gate = ProgressGate::new(5);
        let read_loop = async {
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some((event, progress)) = match_step(&line, STEP_MAP, &mut gate) {
                    self.events.publish(sid, json!({"event": event, "progress": progress})).await.ok();
                }
            }
        };

        if tokio::time::timeout(self.timeout, read_loop).await.is_err() {
            child.kill().await.ok();
            return Err(CoreError::Timeout);
        }

        let status = child.wait().await.map_err(|e| CoreError::Subprocess(e.to_string()))?;
        if !status.success() {
            return Err(CoreError::Subprocess(format!("ROAST exited with {status}")));
        }

        expect_outputs(&work_dir, EXPECTED_OUTPUTS)?;
        self.events.publish(sid, json!({"event": "roast_complete", "progress": 100})).await.ok();
        Ok(())
    }
}

fn gunzip(src: &Path, dest: &Path) -> CoreResult<()> {
    use std::io::Read;
    let file = std::fs::File::open(src)?;
    let mut decoder = flate2::read::GzDecoder::new(file);
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf)?;
    std::fs::write(dest, buf)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_command_fails_fast_when_launcher_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RoastRunner {
            sessions: Arc::new(SessionStore::new(
                dir.path().to_path_buf(),
                Arc::new(mri_core::clock::SystemClock),
                Arc::new(StructuredLogger::new(dir.path().to_path_buf())),
            )),
            events: Arc::new(EventBus::new(
                Arc::new(mri_core::shared_state::InMemorySharedState::new()),
                "secret".into(),
            )),
            logger: Arc::new(StructuredLogger::new(dir.path().to_path_buf())),
            build_dir: dir.path().to_path_buf(),
            matlab_runtime_path: PathBuf::from("/opt/mcr"),
            timeout: Duration::from_secs(1),
        };
        let err = runner.build_command(&dir.path().join("config.json")).unwrap_err();
        assert_eq!(err.kind(), "subprocess");
    }
}
