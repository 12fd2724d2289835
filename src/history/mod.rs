//! Run history — a local store of finished executions.
//!
//! The engine only knows the [`OutcomeRecorder`] trait. `record` is invoked
//! at most once per run, strictly after the exit code has been computed, and
//! every error it raises is caught and discarded by the caller: history is
//! diagnostics, never a reason to change a run's result.
//!
//! The default implementation keeps one SQLite row per run under
//! `~/.linewatch/history.db` (override with `LINEWATCH_HISTORY`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::outcome::ExecutionOutcome;

/// Request metadata recorded alongside each outcome.
#[derive(Debug, Clone)]
pub struct RunMeta {
    pub run_id: Uuid,
    /// The watched command line, or "-" in pipe mode.
    pub command: String,
    /// The default pattern in effect.
    pub pattern: String,
    pub started_at: DateTime<Utc>,
}

impl RunMeta {
    pub fn new(command: String, pattern: String) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            command,
            pattern,
            started_at: Utc::now(),
        }
    }

    /// Stable fingerprint of (command, pattern), used to group repeat runs
    /// of the same invocation for later statistics.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.command.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.pattern.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

/// Where finished runs go. Failures are the caller's to swallow.
pub trait OutcomeRecorder {
    fn record(&self, outcome: &ExecutionOutcome, meta: &RunMeta) -> Result<()>;
}

/// Recorder for `--no-history`.
pub struct NoopRecorder;

impl OutcomeRecorder for NoopRecorder {
    fn record(&self, _outcome: &ExecutionOutcome, _meta: &RunMeta) -> Result<()> {
        Ok(())
    }
}

/// SQLite-backed run history.
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Resolve the default store location.
    pub fn open_default() -> Result<Self> {
        if let Some(path) = std::env::var_os("LINEWATCH_HISTORY") {
            return Ok(Self::at(PathBuf::from(path)));
        }
        let home = std::env::var_os("HOME").context("HOME is not set")?;
        Ok(Self::at(
            Path::new(&home).join(".linewatch").join("history.db"),
        ))
    }

    fn connect(&self) -> Result<Connection> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let conn = Connection::open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS runs (
                id              TEXT PRIMARY KEY,
                recorded_at     TEXT NOT NULL,
                command         TEXT NOT NULL,
                pattern         TEXT NOT NULL,
                fingerprint     TEXT NOT NULL,
                reason          TEXT NOT NULL,
                exit_code       INTEGER NOT NULL,
                child_status    INTEGER,
                matched_line    TEXT,
                match_count     INTEGER NOT NULL,
                total_ms        INTEGER NOT NULL,
                first_output_ms INTEGER,
                first_match_ms  INTEGER,
                lines           INTEGER NOT NULL,
                bytes           INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS runs_fingerprint ON runs (fingerprint);",
        )?;
        Ok(conn)
    }
}

impl OutcomeRecorder for HistoryStore {
    fn record(&self, outcome: &ExecutionOutcome, meta: &RunMeta) -> Result<()> {
        let conn = self.connect()?;
        let (lines, bytes) = outcome
            .channels
            .values()
            .fold((0u64, 0u64), |(l, b), s| (l + s.lines, b + s.bytes));

        conn.execute(
            "INSERT INTO runs (id, recorded_at, command, pattern, fingerprint, reason,
                               exit_code, child_status, matched_line, match_count,
                               total_ms, first_output_ms, first_match_ms, lines, bytes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                meta.run_id.to_string(),
                meta.started_at.to_rfc3339(),
                meta.command,
                meta.pattern,
                meta.fingerprint(),
                outcome.reason.as_str(),
                outcome.exit_code,
                outcome.child_status,
                outcome.matched.as_ref().map(|m| m.line.as_str()),
                // SQLite has no unsigned integer type; store counters as i64.
                outcome.match_count as i64,
                outcome.timing.total_ms as i64,
                outcome.timing.first_output_ms.map(|v| v as i64),
                outcome.timing.first_match_ms.map(|v| v as i64),
                lines as i64,
                bytes as i64,
            ],
        )?;
        debug!(run_id = %meta.run_id, path = %self.path.display(), "run recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{ExecutionOutcome, ExitReason, TimingSummary};
    use std::collections::BTreeMap;

    fn outcome(reason: ExitReason) -> ExecutionOutcome {
        ExecutionOutcome {
            reason,
            exit_code: 1,
            child_status: Some(0),
            patterns: BTreeMap::new(),
            matched: None,
            matches: vec![],
            match_count: 0,
            capture: vec![],
            channels: BTreeMap::new(),
            timing: TimingSummary {
                first_output_ms: Some(12),
                first_match_ms: None,
                total_ms: 340,
            },
            error: None,
        }
    }

    #[test]
    fn records_a_row_and_creates_the_schema() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::at(dir.path().join("nested").join("history.db"));
        let meta = RunMeta::new("cargo test".to_string(), "ERROR".to_string());

        store
            .record(&outcome(ExitReason::CompletedNoMatch), &meta)
            .unwrap();
        store
            .record(
                &outcome(ExitReason::TimeoutIdle),
                &RunMeta::new("cargo test".to_string(), "ERROR".to_string()),
            )
            .unwrap();

        let conn = Connection::open(dir.path().join("nested").join("history.db")).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM runs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
        let (reason, total_ms, first_output_ms): (String, i64, Option<i64>) = conn
            .query_row(
                "SELECT reason, total_ms, first_output_ms FROM runs WHERE id = ?1",
                [meta.run_id.to_string()],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(reason, "completed-no-match");
        assert_eq!(total_ms, 340);
        assert_eq!(first_output_ms, Some(12));
    }

    #[test]
    fn fingerprint_is_stable_per_command_and_pattern() {
        let a = RunMeta::new("make build".to_string(), "ERROR".to_string());
        let b = RunMeta::new("make build".to_string(), "ERROR".to_string());
        let c = RunMeta::new("make build".to_string(), "WARN".to_string());
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn noop_recorder_accepts_anything() {
        NoopRecorder
            .record(
                &outcome(ExitReason::Matched),
                &RunMeta::new("-".to_string(), "x".to_string()),
            )
            .unwrap();
    }
}
