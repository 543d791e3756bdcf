use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;
use tracing::error;
use uuid::Uuid;

use crate::error::CoreResult;

#[derive(Debug, Serialize)]
struct LogLine<'a> {
    ts: String,
    level: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    extra: Option<Value>,
}

/// Append-only per-session JSON-lines log. One file per session at
/// `<session_root>/<sid>/logs.jsonl`.
pub struct StructuredLogger {
    root: PathBuf,
}

impl StructuredLogger {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn log_path(&self, sid: Uuid) -> PathBuf {
        self.root.join(sid.to_string()).join("logs.jsonl")
    }

    fn write_line(&self, sid: Uuid, level: &str, message: &str, extra: Option<Value>) -> CoreResult<()> {
        let line = LogLine {
            ts: Utc::now().to_rfc3339(),
            level,
            message,
            extra,
        };
        let path = self.log_path(sid);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        let serialized = serde_json::to_string(&line).map_err(|e| anyhow::anyhow!(e))?;
        writeln!(file, "{serialized}")?;
        Ok(())
    }

    pub fn info(&self, sid: Uuid, message: &str, extra: Option<Value>) -> CoreResult<()> {
        self.write_line(sid, "INFO", message, extra)
    }

    pub fn error(&self, sid: Uuid, message: &str, extra: Option<Value>) -> CoreResult<()> {
        self.write_line(sid, "ERROR", message, extra)
    }

    pub fn event(&self, sid: Uuid, event_payload: Value) -> CoreResult<()> {
        self.write_line(sid, "EVENT", "SSE event", Some(event_payload))
    }
}

/// Best-effort observable history: a relational audit table mirroring the
/// original system's `audit` table. Failure to write a row never fails the
/// calling operation; it is logged at ERROR instead.
pub struct AuditSink {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRow {
    pub id: i64,
    pub ts: String,
    pub session_id: String,
    pub model: String,
    pub event: String,
    pub detail: String,
}

impl AuditSink {
    pub fn open(path: &std::path::Path) -> CoreResult<Self> {
        let conn = Connection::open(path).map_err(|e| anyhow::anyhow!(e))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                session_id TEXT NOT NULL,
                model TEXT NOT NULL,
                event TEXT NOT NULL,
                detail TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| anyhow::anyhow!(e))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Appends an audit row. Errors are logged and swallowed per the
    /// best-effort contract — callers never see an audit failure.
    pub fn append(&self, sid: Uuid, model: &str, event: &str, detail: &str) {
        let result = (|| -> rusqlite::Result<()> {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO audit (ts, session_id, model, event, detail) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![Utc::now().to_rfc3339(), sid.to_string(), model, event, detail],
            )?;
            Ok(())
        })();

        if let Err(e) = result {
            error!(session = %sid, error = %e, "audit append failed");
        }
    }

    /// Returns the most recent `limit` rows, newest first.
    pub fn recent(&self, limit: usize) -> CoreResult<Vec<AuditRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT id, ts, session_id, model, event, detail FROM audit ORDER BY id DESC LIMIT ?1")
            .map_err(|e| anyhow::anyhow!(e))?;
        let rows = stmt
            .query_map(rusqlite::params![limit as i64], |row| {
                Ok(AuditRow {
                    id: row.get(0)?,
                    ts: row.get(1)?,
                    session_id: row.get(2)?,
                    model: row.get(3)?,
                    event: row.get(4)?,
                    detail: row.get(5)?,
                })
            })
            .map_err(|e| anyhow::anyhow!(e))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| anyhow::anyhow!(e))?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn logger_appends_jsonl_line() {
        let dir = tempdir().unwrap();
        let logger = StructuredLogger::new(dir.path().to_path_buf());
        let sid = Uuid::new_v4();
        logger.info(sid, "hello", None).unwrap();

        let contents = std::fs::read_to_string(logger.log_path(sid)).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("\"level\":\"INFO\""));
    }

    #[test]
    fn audit_sink_records_and_reads_back() {
        let dir = tempdir().unwrap();
        let sink = AuditSink::open(&dir.path().join("audit.db")).unwrap();
        let sid = Uuid::new_v4();
        sink.append(sid, "grace-native", "model_complete", "");
        let rows = sink.recent(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event, "model_complete");
    }
}
