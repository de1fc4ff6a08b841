//! Tamper-evident audit trail of synthesis activity.
//!
//! Every stage transition a request goes through is appended as a record
//! whose chain hash covers the previous record's chain hash, so any edit to
//! history breaks verification from that point on. Storage is SQLite when a
//! path is configured, pure in-memory otherwise.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{EngineError, EngineResult};

/// Wraps `Connection` in a `Mutex` so the log is `Sync` as well as `Send`;
/// `rusqlite::Connection` on its own is only `Send`.
struct DbConn(Mutex<Connection>);

impl std::fmt::Debug for DbConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DbConn(<sqlite>)")
    }
}

/// Stage a request passed through, as recorded in the trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditStage {
    Received,
    Screened,
    Assessed,
    Reused,
    SynthesisAttempt,
    Precheck,
    TestsRun,
    Postcheck,
    Integrated,
    Failed,
}

impl AuditStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStage::Received => "received",
            AuditStage::Screened => "screened",
            AuditStage::Assessed => "assessed",
            AuditStage::Reused => "reused",
            AuditStage::SynthesisAttempt => "synthesis_attempt",
            AuditStage::Precheck => "precheck",
            AuditStage::TestsRun => "tests_run",
            AuditStage::Postcheck => "postcheck",
            AuditStage::Integrated => "integrated",
            AuditStage::Failed => "failed",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "received" => AuditStage::Received,
            "screened" => AuditStage::Screened,
            "assessed" => AuditStage::Assessed,
            "reused" => AuditStage::Reused,
            "synthesis_attempt" => AuditStage::SynthesisAttempt,
            "precheck" => AuditStage::Precheck,
            "tests_run" => AuditStage::TestsRun,
            "postcheck" => AuditStage::Postcheck,
            "integrated" => AuditStage::Integrated,
            _ => AuditStage::Failed,
        }
    }
}

impl std::fmt::Display for AuditStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct AuditRecord {
    /// 1-based position in the trail.
    pub seq: u64,
    pub timestamp_ms: u64,
    pub request_id: String,
    pub stage: AuditStage,
    /// Iteration the record belongs to, when stage is per-iteration.
    pub iteration: Option<u32>,
    pub detail: String,
}

const CREATE_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS audit_trail (
    seq          INTEGER PRIMARY KEY,
    timestamp_ms INTEGER NOT NULL,
    request_id   TEXT    NOT NULL,
    stage        TEXT    NOT NULL,
    iteration    INTEGER,
    detail       TEXT    NOT NULL,
    chain_hash   TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_request ON audit_trail(request_id);
CREATE INDEX IF NOT EXISTS idx_audit_stage   ON audit_trail(stage);
";

type DbRow = (u64, u64, String, String, Option<u32>, String, String);

/// Load the full trail in insertion order. Free function so the `Statement`
/// borrow stays local.
fn load_rows(conn: &Connection) -> Result<Vec<DbRow>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT seq, timestamp_ms, request_id, stage, iteration, detail, chain_hash \
         FROM audit_trail ORDER BY seq ASC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, u64>(0)?,
                row.get::<_, u64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<u32>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })
        .and_then(|mapped| mapped.collect::<Result<Vec<_>, _>>())?;
    Ok(rows)
}

/// Append-only audit log with a SHA-256 hash chain over its records.
pub struct AuditLog {
    records: Vec<AuditRecord>,
    hash_chain: Vec<String>,
    conn: Option<DbConn>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("records_len", &self.records.len())
            .field("conn", &self.conn)
            .finish()
    }
}

impl AuditLog {
    /// Pure in-memory log, no persistence.
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            hash_chain: Vec::new(),
            conn: None,
        }
    }

    /// Open (or create) a SQLite-backed log at `path` and load the existing
    /// trail so the chain continues where it left off.
    pub fn open_db(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch(CREATE_SCHEMA_SQL)?;

        let rows = load_rows(&conn)?;
        let mut records = Vec::with_capacity(rows.len());
        let mut hash_chain = Vec::with_capacity(rows.len());
        for (seq, timestamp_ms, request_id, stage, iteration, detail, chain_hash) in rows {
            records.push(AuditRecord {
                seq,
                timestamp_ms,
                request_id,
                stage: AuditStage::from_str(&stage),
                iteration,
                detail,
            });
            hash_chain.push(chain_hash);
        }

        info!(
            path = %path.display(),
            records = records.len(),
            "opened audit trail"
        );
        Ok(Self {
            records,
            hash_chain,
            conn: Some(DbConn(Mutex::new(conn))),
        })
    }

    /// Append one record, returning its sequence number.
    pub fn append(
        &mut self,
        request_id: &str,
        stage: AuditStage,
        iteration: Option<u32>,
        detail: impl Into<String>,
    ) -> EngineResult<u64> {
        let record = AuditRecord {
            seq: self.records.len() as u64 + 1,
            timestamp_ms: chrono::Utc::now().timestamp_millis() as u64,
            request_id: request_id.to_string(),
            stage,
            iteration,
            detail: detail.into(),
        };
        let chain_hash = self.chain_hash(&record_hash(&record));

        if let Some(db) = &self.conn {
            let conn = db
                .0
                .lock()
                .map_err(|_| EngineError::Audit("audit connection lock poisoned".to_string()))?;
            conn.execute(
                "INSERT INTO audit_trail \
                 (seq, timestamp_ms, request_id, stage, iteration, detail, chain_hash) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7)",
                params![
                    record.seq,
                    record.timestamp_ms,
                    record.request_id,
                    record.stage.as_str(),
                    record.iteration,
                    record.detail,
                    chain_hash,
                ],
            )?;
        }

        let seq = record.seq;
        self.records.push(record);
        self.hash_chain.push(chain_hash);
        Ok(seq)
    }

    pub fn records(&self) -> &[AuditRecord] {
        &self.records
    }

    pub fn records_for(&self, request_id: &str) -> Vec<&AuditRecord> {
        self.records
            .iter()
            .filter(|r| r.request_id == request_id)
            .collect()
    }

    /// Recompute the chain over the loaded records; false means some record
    /// or hash was altered after the fact.
    pub fn verify_integrity(&self) -> bool {
        let mut last: Option<&String> = None;
        for (i, record) in self.records.iter().enumerate() {
            let mut hasher = Sha256::new();
            if let Some(prev) = last {
                hasher.update(prev.as_bytes());
            }
            hasher.update(record_hash(record).as_bytes());
            let expected = format!("{:x}", hasher.finalize());
            if self.hash_chain[i] != expected {
                return false;
            }
            last = Some(&self.hash_chain[i]);
        }
        true
    }

    fn chain_hash(&self, record_hash: &str) -> String {
        let mut hasher = Sha256::new();
        if let Some(prev) = self.hash_chain.last() {
            hasher.update(prev.as_bytes());
        }
        hasher.update(record_hash.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

fn record_hash(record: &AuditRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record.seq.to_string().as_bytes());
    hasher.update(record.timestamp_ms.to_string().as_bytes());
    hasher.update(record.request_id.as_bytes());
    hasher.update(record.stage.as_str().as_bytes());
    if let Some(iteration) = record.iteration {
        hasher.update(iteration.to_string().as_bytes());
    }
    hasher.update(record.detail.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_verify_in_memory() {
        let mut log = AuditLog::new();
        log.append("req-1", AuditStage::Received, None, "sum a csv column")
            .unwrap();
        log.append("req-1", AuditStage::Assessed, None, "gap: spreadsheet analysis")
            .unwrap();
        log.append("req-1", AuditStage::Integrated, Some(1), "capability registered")
            .unwrap();
        assert_eq!(log.records().len(), 3);
        assert_eq!(log.records()[0].seq, 1);
        assert!(log.verify_integrity());
    }

    #[test]
    fn test_tampered_record_breaks_chain() {
        let mut log = AuditLog::new();
        log.append("req-1", AuditStage::Received, None, "original detail")
            .unwrap();
        log.append("req-1", AuditStage::Failed, Some(3), "iterations exhausted")
            .unwrap();
        assert!(log.verify_integrity());

        log.records[0].detail = "rewritten after the fact".to_string();
        assert!(!log.verify_integrity());
    }

    #[test]
    fn test_records_for_filters_by_request() {
        let mut log = AuditLog::new();
        log.append("req-a", AuditStage::Received, None, "a").unwrap();
        log.append("req-b", AuditStage::Received, None, "b").unwrap();
        log.append("req-a", AuditStage::Failed, None, "a failed").unwrap();
        let for_a = log.records_for("req-a");
        assert_eq!(for_a.len(), 2);
        assert!(for_a.iter().all(|r| r.request_id == "req-a"));
    }

    #[test]
    fn test_sqlite_round_trip_continues_chain() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("audit.sqlite");

        {
            let mut log = AuditLog::open_db(&db_path).unwrap();
            log.append("req-1", AuditStage::Received, None, "first run")
                .unwrap();
            log.append("req-1", AuditStage::Integrated, Some(2), "done")
                .unwrap();
        }

        let mut reopened = AuditLog::open_db(&db_path).unwrap();
        assert_eq!(reopened.records().len(), 2);
        assert!(reopened.verify_integrity());

        reopened
            .append("req-2", AuditStage::Received, None, "second run")
            .unwrap();
        assert_eq!(reopened.records().len(), 3);
        assert!(reopened.verify_integrity());
    }

    #[test]
    fn test_sqlite_tamper_detected_on_reload() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("audit.sqlite");

        {
            let mut log = AuditLog::open_db(&db_path).unwrap();
            log.append("req-1", AuditStage::Received, None, "honest detail")
                .unwrap();
            log.append("req-1", AuditStage::Failed, None, "tests failed")
                .unwrap();
        }

        {
            let conn = Connection::open(&db_path).unwrap();
            conn.execute(
                "UPDATE audit_trail SET detail = 'forged detail' WHERE seq = 1",
                [],
            )
            .unwrap();
        }

        let reopened = AuditLog::open_db(&db_path).unwrap();
        assert!(!reopened.verify_integrity());
    }
}
