use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mri_core::error::{CoreError, CoreResult};
use mri_core::event_bus::EventBus;
use mri_core::logger::StructuredLogger;
use mri_core::session::SessionStore;
use mri_pipeline::{Volume, VolumeStore};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::info;

use crate::label_remap::remap_label;
use crate::simulation::{match_step, ProgressGate, SimulationJob, SimulationRunner, StepMapEntry};

const SUBJECT: &str = "subject";

const CHARM_MAP: &[StepMapEntry] = &[
    StepMapEntry { substring: "registering", event: "simnibs_charm_register", progress: 10 },
    StepMapEntry { substring: "segmenting", event: "simnibs_charm_segment", progress: 20 },
    StepMapEntry { substring: "classif", event: "simnibs_charm_tissue", progress: 30 },
    StepMapEntry { substring: "surface", event: "simnibs_charm_surface", progress: 40 },
    StepMapEntry { substring: "meshing", event: "simnibs_charm_mesh", progress: 50 },
    StepMapEntry { substring: "finaliz", event: "simnibs_charm_finalize", progress: 57 },
    StepMapEntry { substring: "saving", event: "simnibs_charm_saving", progress: 59 },
];

const HEARTBEAT_START: i32 = 65;
const HEARTBEAT_CEILING: i32 = 88;
const HEARTBEAT_STEP: i32 = 2;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Drives the second simulator's head-meshing-plus-FEM pipeline: `charm`
/// builds a subject head mesh, then an external FEM solver runs the tDCS
/// solve while this task emits heartbeat progress since the solve itself
/// produces no line-based output worth parsing.
pub struct SimNibsRunner {
    pub sessions: Arc<SessionStore>,
    pub events: Arc<EventBus>,
    pub logger: Arc<StructuredLogger>,
    pub volumes: Arc<dyn VolumeStore>,
    pub charm_bin: PathBuf,
    pub fem_solver_bin: PathBuf,
    pub timeout: Duration,
}

impl SimNibsRunner {
    async fn prepare_working_directory(&self, sid: uuid::Uuid, model_name: &str, work_dir: &Path) -> CoreResult<PathBuf> {
        let t1_gz = self.sessions.native_input(sid)?;
        let t1_nii = work_dir.join("T1.nii");
        gunzip(&t1_gz, &t1_nii)?;

        let mask_gz = self.sessions.model_output(sid, model_name)?;
        let mask_nii = work_dir.join("T1_T1orT2_masks.nii");
        self.remap_mask(&mask_gz, &mask_nii).await?;

        Ok(t1_nii)
    }

    /// Loads the source segmentation, rewrites every voxel through the
    /// static tissue-code table, and saves it uncompressed for `charm`.
    async fn remap_mask(&self, src: &Path, dest: &Path) -> CoreResult<()> {
        let volume = self.volumes.load(src).await?;
        let mut remapped = volume.data.clone();
        remapped.mapv_inplace(|v| remap_label(v.round().clamp(0.0, 255.0) as u8) as f32);
        let out = Volume {
            data: remapped,
            metadata: volume.metadata,
        };
        self.volumes.save(dest, &out).await
    }

    async fn run_charm(&self, sid: uuid::Uuid, t1_path: &Path, work_dir: &Path) -> CoreResult<PathBuf> {
        self.events.publish(sid, json!({"event": "simnibs_charm", "progress": 5})).await.ok();
        info!(session = %sid, "running charm head meshing");

        let mut cmd = Command::new(&self.charm_bin);
        cmd.arg(SUBJECT)
            .arg(t1_path)
            .current_dir(work_dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| CoreError::Subprocess(e.to_string()))?;
        let stdout = child.stdout.take().expect("piped stdout");
        let mut lines = BufReader::new(stdout).lines();

        let mut gate = ProgressGate::new(5);
        let read_loop = async {
            while let Ok(Some(line)) = lines.next_line().await {
                let lowered = line.to_lowercase();
                if let Some((event, progress)) = match_step(&lowered, CHARM_MAP, &mut gate) {
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
            return Err(CoreError::Subprocess(format!("charm exited with {status}")));
        }

        let mesh_path = work_dir.join(format!("m2m_{SUBJECT}")).join(format!("{SUBJECT}.msh"));
        if !mesh_path.exists() {
            return Err(CoreError::MissingOutput(mesh_path.display().to_string()));
        }
        self.events.publish(sid, json!({"event": "simnibs_charm_done", "progress": 60})).await.ok();
        Ok(mesh_path)
    }

    async fn run_fem(&self, sid: uuid::Uuid, mesh_path: &Path, job: &SimulationJob, work_dir: &Path) -> CoreResult<PathBuf> {
        self.events.publish(sid, json!({"event": "simnibs_fem_setup", "progress": 62})).await.ok();

        let fem_dir = work_dir.join("fem");
        std::fs::create_dir_all(&fem_dir)?;

        let pairs: Vec<(String, f64)> = job.recipe.iter().map(|(pos, ma)| (pos.clone(), ma / 1000.0)).collect();
        let electype = job.electrode_type.clone().unwrap_or_default();
        let config = json!({
            "mesh": mesh_path.display().to_string(),
            "pathfem": fem_dir.display().to_string(),
            "currents_amperes": pairs.iter().map(|(_, a)| a).collect::<Vec<_>>(),
            "electrodes": pairs.iter().enumerate().map(|(i, (pos, _))| {
                json!({
                    "channel": i + 1,
                    "centre": pos,
                    "type": electype.get(i).cloned().unwrap_or_else(|| "pad".to_string()),
                })
            }).collect::<Vec<_>>(),
        });
        let config_path = fem_dir.join("fem_config.json");
        std::fs::write(&config_path, serde_json::to_vec_pretty(&config).map_err(|e| anyhow::anyhow!(e))?)?;

        self.events.publish(sid, json!({"event": "simnibs_fem_solve", "progress": HEARTBEAT_START})).await.ok();

        let mut cmd = Command::new(&self.fem_solver_bin);
        cmd.arg(&config_path)
            .current_dir(work_dir)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| CoreError::Subprocess(e.to_string()))?;

        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut progress = HEARTBEAT_START;
        let status = loop {
            tokio::select! {
                result = child.wait() => {
                    break result.map_err(|e| CoreError::Subprocess(e.to_string()))?;
                }
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                    if tokio::time::Instant::now() > deadline {
                        child.kill().await.ok();
                        return Err(CoreError::Timeout);
                    }
                    progress = (progress + HEARTBEAT_STEP).min(HEARTBEAT_CEILING);
                    self.events.publish(sid, json!({"event": "simnibs_fem_solve", "progress": progress})).await.ok();
                }
            }
        };

        if !status.success() {
            return Err(CoreError::Subprocess(format!("FEM solver exited with {status}")));
        }

        self.events.publish(sid, json!({"event": "simnibs_post", "progress": 90})).await.ok();
        Ok(fem_dir)
    }

    fn collect_outputs(&self, sid: uuid::Uuid, fem_dir: &Path, out_dir: &Path) -> CoreResult<()> {
        std::fs::create_dir_all(out_dir)?;
        let candidates: Vec<(&str, Vec<String>)> = vec![
            ("emag", vec![format!("{SUBJECT}_TDCS_1_normE.nii.gz"), format!("{SUBJECT}_TDCS_1_E.nii.gz")]),
            ("voltage", vec![format!("{SUBJECT}_TDCS_1_v.nii.gz")]),
        ];

        let mut missing = Vec::new();
        for (kind, names) in &candidates {
            let found = names.iter().find_map(|name| find_recursive(fem_dir, name));
            match found {
                Some(src) => {
                    std::fs::copy(&src, out_dir.join(format!("{kind}.nii.gz")))?;
                }
                None => missing.push(*kind),
            }
        }

        if missing.is_empty() {
            self.logger.info(sid, "simnibs outputs collected", None).ok();
            Ok(())
        } else {
            Err(CoreError::MissingOutput(format!("simnibs outputs missing: {}", missing.join(", "))))
        }
    }
}

#[async_trait]
impl SimulationRunner for SimNibsRunner {
    fn queue_key(&self) -> &'static str {
        "simnibs_job_queue"
    }

    fn data_prefix(&self) -> &'static str {
        "simnibs_job_data:"
    }

    fn status_prefix(&self) -> &'static str {
        "simnibs_job_status"
    }

    fn progress_prefix(&self) -> &'static str {
        "simnibs_progress"
    }

    fn worker_name_prefix(&self) -> &'static str {
        "simnibs"
    }

    async fn run(&self, job: &SimulationJob) -> CoreResult<()> {
        let sid = job.session_id;
        let work_dir = self.sessions.simulation_workdir(sid, "simnibs", Some(&job.model_name))?;

        self.events.publish(sid, json!({"event": "simnibs_prepare", "progress": 4})).await.ok();
        let t1_path = self.prepare_working_directory(sid, &job.model_name, &work_dir).await?;

        let mesh_path = self.run_charm(sid, &t1_path, &work_dir).await?;
        let fem_dir = self.run_fem(sid, &mesh_path, job, &work_dir).await?;
        self.collect_outputs(sid, &fem_dir, &work_dir.join("outputs"))?;

        self.events.publish(sid, json!({"event": "simnibs_complete", "progress": 100})).await.ok();
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

fn find_recursive(dir: &Path, filename: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = find_recursive(&path, filename) {
                return Some(found);
            }
        } else if path.file_name().and_then(|n| n.to_str()) == Some(filename) {
            return Some(path);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_recursive_locates_nested_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("subject_TDCS_1_v.nii.gz"), b"x").unwrap();

        let found = find_recursive(dir.path(), "subject_TDCS_1_v.nii.gz");
        assert_eq!(found, Some(nested.join("subject_TDCS_1_v.nii.gz")));
    }

    #[test]
    fn find_recursive_returns_none_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(find_recursive(dir.path(), "missing.nii.gz"), None);
    }
}
