use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::logger::StructuredLogger;

/// Owns the on-disk layout for every session and maps
/// `(session_id, stage, artifact)` to a path. The session directory is the
/// sole mutable state of a session; every other component addresses it only
/// by path.
pub struct SessionStore {
    root: PathBuf,
    clock: Arc<dyn Clock>,
    logger: Arc<StructuredLogger>,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>, clock: Arc<dyn Clock>, logger: Arc<StructuredLogger>) -> Self {
        Self {
            root: root.into(),
            clock,
            logger,
        }
    }

    fn session_dir(&self, sid: Uuid) -> PathBuf {
        self.root.join(sid.to_string())
    }

    /// Creates a fresh session directory, writes the opening log line, and
    /// returns the new id. After this call every path function below is
    /// well-defined for `sid`.
    pub fn create(&self) -> CoreResult<Uuid> {
        let sid = self.clock.new_id();
        let dir = self.session_dir(sid);
        std::fs::create_dir_all(&dir)?;
        self.logger.info(sid, "session created", None)?;
        Ok(sid)
    }

    /// Path functions are pure and deterministic given `(sid, role)`; they
    /// create parent directories on first use but never create the file
    /// itself.
    pub fn native_input(&self, sid: Uuid) -> CoreResult<PathBuf> {
        self.materialize(self.session_dir(sid).join("input_native.nii.gz"))
    }

    pub fn conformed_input(&self, sid: Uuid) -> CoreResult<PathBuf> {
        self.materialize(self.session_dir(sid).join("input_fs.nii"))
    }

    pub fn model_output(&self, sid: Uuid, model: &str) -> CoreResult<PathBuf> {
        self.materialize(self.session_dir(sid).join(model).join("output.nii.gz"))
    }

    pub fn model_output_fs(&self, sid: Uuid, model: &str) -> CoreResult<PathBuf> {
        self.materialize(self.session_dir(sid).join(model).join("output_fs.nii.gz"))
    }

    pub fn simulation_workdir(&self, sid: Uuid, simulator: &str, model: Option<&str>) -> CoreResult<PathBuf> {
        let dir = match model {
            Some(model) => self.session_dir(sid).join(simulator).join(model),
            None => self.session_dir(sid).join(simulator),
        };
        self.materialize_dir(dir)
    }

    pub fn simulation_output(&self, sid: Uuid, simulator: &str, model: &str, kind: &str) -> CoreResult<PathBuf> {
        self.materialize(
            self.session_dir(sid)
                .join(simulator)
                .join(model)
                .join(format!("{kind}.nii.gz")),
        )
    }

    pub fn logs_path(&self, sid: Uuid) -> PathBuf {
        self.session_dir(sid).join("logs.jsonl")
    }

    fn materialize(&self, path: PathBuf) -> CoreResult<PathBuf> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(path)
    }

    fn materialize_dir(&self, path: PathBuf) -> CoreResult<PathBuf> {
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Writes `data` to `path` atomically by staging to a sibling temp path
    /// and renaming it into place, so readers never observe a partial file.
    pub fn write_atomic(&self, path: &Path, data: &[u8]) -> CoreResult<()> {
        let tmp = path.with_extension("tmp-write");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Scans the root and removes every session subtree whose directory
    /// mtime precedes `now - max_age`. Never removes a directory that fails
    /// to be exclusively claimed for removal — implementations must survive
    /// a concurrent writer by retrying the sweep, not by locking it out.
    pub fn reap(&self, max_age: Duration) -> CoreResult<Vec<Uuid>> {
        let mut removed = Vec::new();
        if !self.root.exists() {
            return Ok(removed);
        }
        let cutoff = self.clock.now() - chrono::Duration::from_std(max_age).unwrap_or_default();

        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Ok(sid) = Uuid::parse_str(name) else {
                continue;
            };

            let metadata = entry.metadata()?;
            let mtime = metadata.modified()?;
            let mtime: chrono::DateTime<chrono::Utc> = mtime.into();
            if mtime >= cutoff {
                continue;
            }

            match std::fs::remove_dir_all(&path) {
                Ok(()) => {
                    info!(session = %sid, "reaped expired session");
                    self.logger.info(sid, "session reaped", None).ok();
                    removed.push(sid);
                }
                Err(e) => {
                    warn!(session = %sid, error = %e, "session reap failed, will retry on next sweep");
                }
            }
        }
        Ok(removed)
    }

    pub fn require_exists(&self, sid: Uuid) -> CoreResult<()> {
        if self.session_dir(sid).exists() {
            Ok(())
        } else {
            Err(CoreError::UnknownSession(sid))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FixedClock;
    use crate::logger::StructuredLogger;
    use tempfile::tempdir;

    fn store(root: &Path, clock: Arc<dyn Clock>) -> SessionStore {
        let logger = Arc::new(StructuredLogger::new(root.to_path_buf()));
        SessionStore::new(root.to_path_buf(), clock, logger)
    }

    #[test]
    fn idempotent_paths() {
        let dir = tempdir().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(chrono::Utc::now()));
        let s = store(dir.path(), clock);
        let sid = s.create().unwrap();

        let p1 = s.model_output(sid, "grace-native").unwrap();
        let p2 = s.model_output(sid, "grace-native").unwrap();
        assert_eq!(p1, p2);
    }

    #[test]
    fn reap_never_removes_a_fresh_session() {
        use crate::clock::SystemClock;

        let dir = tempdir().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let s = store(dir.path(), clock);

        let fresh_sid = s.create().unwrap();
        let removed = s.reap(Duration::from_secs(24 * 3600)).unwrap();

        assert!(!removed.contains(&fresh_sid));
        assert!(s.require_exists(fresh_sid).is_ok());
    }
}
