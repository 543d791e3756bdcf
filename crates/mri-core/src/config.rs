use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

/// Process-wide configuration, assembled once at startup from the
/// environment (with an optional `.env` file consulted first).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub session_root: PathBuf,
    pub model_root: PathBuf,
    pub shared_host: String,
    pub shared_port: u16,
    pub hmac_secret: String,
    pub gpu_count: usize,
    pub job_timeout: Duration,
    pub sim_max_workers: usize,
    pub sim_timeout: Duration,
    pub mri_convert_path: PathBuf,
    pub mri_vol2vol_path: PathBuf,
    pub roast_build_dir: PathBuf,
    pub matlab_runtime_path: PathBuf,
    pub simnibs_bin: PathBuf,
    pub charm_bin: PathBuf,
    pub retention_window: Duration,
    pub audit_db_path: PathBuf,
}

fn env_var(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl AppConfig {
    /// Loads `.env` if present, then reads every variable from the
    /// environment, falling back to development-friendly defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let session_root = PathBuf::from(env_var("SESSION_ROOT", "./sessions"));
        let model_root = PathBuf::from(env_var("MODEL_ROOT", "./models"));
        let shared_host = env_var("SHARED_HOST", "127.0.0.1");
        let shared_port: u16 = env_var("SHARED_PORT", "6379")
            .parse()
            .context("SHARED_PORT must be a valid port number")?;
        let hmac_secret = std::env::var("HMAC_SECRET")
            .context("HMAC_SECRET must be set (signing key for event envelopes)")?;
        let gpu_count: usize = env_var("GPU_COUNT", "1")
            .parse()
            .context("GPU_COUNT must be a non-negative integer")?;
        let job_timeout_secs: u64 = env_var("JOB_TIMEOUT_SECONDS", "0")
            .parse()
            .context("JOB_TIMEOUT_SECONDS must be an integer")?;
        let sim_max_workers: usize = env_var("SIM_MAX_WORKERS", "2")
            .parse()
            .context("SIM_MAX_WORKERS must be a non-negative integer")?;
        let sim_timeout_secs: u64 = env_var("SIM_TIMEOUT_SECONDS", "3600")
            .parse()
            .context("SIM_TIMEOUT_SECONDS must be an integer")?;

        Ok(Self {
            session_root,
            model_root: model_root.clone(),
            shared_host,
            shared_port,
            hmac_secret,
            gpu_count,
            job_timeout: Duration::from_secs(job_timeout_secs),
            sim_max_workers,
            sim_timeout: Duration::from_secs(sim_timeout_secs),
            mri_convert_path: PathBuf::from(env_var("MRI_CONVERT_PATH", "/usr/local/freesurfer/bin/mri_convert")),
            mri_vol2vol_path: PathBuf::from(env_var("MRI_VOL2VOL_PATH", "/usr/local/freesurfer/bin/mri_vol2vol")),
            roast_build_dir: PathBuf::from(env_var("ROAST_BUILD_DIR", "/opt/roast-11/build")),
            matlab_runtime_path: PathBuf::from(env_var("MATLAB_RUNTIME_PATH", "/opt/mcr/v912")),
            simnibs_bin: PathBuf::from(env_var("SIMNIBS_BIN", "/opt/simnibs/bin/simnibs")),
            charm_bin: PathBuf::from(env_var("CHARM_BIN", "/opt/simnibs/bin/charm")),
            retention_window: Duration::from_secs(
                env_var("RETENTION_WINDOW_SECONDS", &(24 * 3600).to_string())
                    .parse()
                    .context("RETENTION_WINDOW_SECONDS must be an integer")?,
            ),
            audit_db_path: PathBuf::from(env_var(
                "AUDIT_DB_PATH",
                &model_root
                    .parent()
                    .unwrap_or(&model_root)
                    .join("audit.db")
                    .to_string_lossy(),
            )),
        })
    }
}
