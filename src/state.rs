//! Crash-safe state store
//!
//! SQLite (WAL mode) at `<state_root>/state.db`. One row write per
//! externally visible state transition, committed before the next transition
//! begins. Step rows are idempotent by `(run_id, step_id)`; `total_tokens`
//! is recomputed from persisted step rows on every completion so the run row
//! stays the authoritative sum.
//!
//! Resume reads a consistent snapshot of a run's step states.

use crate::events::Event;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error opening state store: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// RECORDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "queued" => RunStatus::Queued,
            "running" => RunStatus::Running,
            "completed" => RunStatus::Completed,
            "cancelled" => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        }
    }
}

/// Step state machine: Pending → Running → {Completed, Failed, Retrying};
/// Retrying returns to Running after its delay. Relaying is a Running
/// sub-state and is never persisted separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
}

impl StepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::Pending => "pending",
            StepState::Running => "running",
            StepState::Completed => "completed",
            StepState::Failed => "failed",
            StepState::Retrying => "retrying",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "pending" => StepState::Pending,
            "running" => StepState::Running,
            "completed" => StepState::Completed,
            "retrying" => StepState::Retrying,
            _ => StepState::Failed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: String,
    pub pipeline_name: String,
    pub status: RunStatus,
    pub input: String,
    pub labels: BTreeMap<String, String>,
    pub current_step: Option<String>,
    pub total_tokens: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct StepRecord {
    pub step_id: String,
    pub state: StepState,
    pub retry_count: u32,
    pub tokens_used: u64,
    pub workspace_path: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ============================================================================
// STORE
// ============================================================================

/// Single-writer-per-row, multi-reader persistent store.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open (or create) `<state_root>/state.db`.
    pub fn open(state_root: &Path) -> Result<Self, StateError> {
        std::fs::create_dir_all(state_root)?;
        let conn = Connection::open(state_root.join("state.db"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Ephemeral store for tests.
    pub fn in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init(conn: &Connection) -> Result<(), StateError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS pipeline_run (
                run_id        TEXT PRIMARY KEY,
                pipeline_name TEXT NOT NULL,
                status        TEXT NOT NULL,
                input         TEXT NOT NULL,
                labels_json   TEXT NOT NULL DEFAULT '{}',
                current_step  TEXT,
                total_tokens  INTEGER NOT NULL DEFAULT 0,
                started_at    TEXT NOT NULL,
                completed_at  TEXT
            );
            CREATE TABLE IF NOT EXISTS step_state (
                run_id         TEXT NOT NULL REFERENCES pipeline_run(run_id),
                step_id        TEXT NOT NULL,
                state          TEXT NOT NULL,
                retry_count    INTEGER NOT NULL DEFAULT 0,
                tokens_used    INTEGER NOT NULL DEFAULT 0,
                workspace_path TEXT,
                error_message  TEXT,
                started_at     TEXT,
                completed_at   TEXT,
                PRIMARY KEY (run_id, step_id)
            );
            CREATE TABLE IF NOT EXISTS event_log (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id      TEXT NOT NULL,
                step_id     TEXT,
                state       TEXT NOT NULL,
                payload     TEXT NOT NULL,
                timestamp   TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS artifact (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id     TEXT NOT NULL,
                step_id    TEXT NOT NULL,
                name       TEXT NOT NULL,
                path       TEXT NOT NULL,
                type       TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS performance_metric (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id    TEXT NOT NULL,
                step_id   TEXT,
                name      TEXT NOT NULL,
                value     REAL NOT NULL,
                timestamp TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // pipeline_run
    // ------------------------------------------------------------------

    pub fn create_run(&self, run: &RunRecord) -> Result<(), StateError> {
        let labels = serde_json::to_string(&run.labels).unwrap_or_else(|_| "{}".to_string());
        self.conn.lock().execute(
            "INSERT INTO pipeline_run
             (run_id, pipeline_name, status, input, labels_json, current_step,
              total_tokens, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run.run_id,
                run.pipeline_name,
                run.status.as_str(),
                run.input,
                labels,
                run.current_step,
                run.total_tokens as i64,
                run.started_at.to_rfc3339(),
                run.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        current_step: Option<&str>,
    ) -> Result<(), StateError> {
        self.conn.lock().execute(
            "UPDATE pipeline_run SET status = ?2, current_step = ?3 WHERE run_id = ?1",
            params![run_id, status.as_str(), current_step],
        )?;
        Ok(())
    }

    /// Terminal run write: status, completion time, and the authoritative
    /// token sum recomputed from persisted step rows.
    pub fn finish_run(&self, run_id: &str, status: RunStatus) -> Result<u64, StateError> {
        let conn = self.conn.lock();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(tokens_used), 0) FROM step_state WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        conn.execute(
            "UPDATE pipeline_run
             SET status = ?2, total_tokens = ?3, completed_at = ?4, current_step = NULL
             WHERE run_id = ?1",
            params![
                run_id,
                status.as_str(),
                total,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(total as u64)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, StateError> {
        let conn = self.conn.lock();
        let run = conn
            .query_row(
                "SELECT run_id, pipeline_name, status, input, labels_json, current_step,
                        total_tokens, started_at, completed_at
                 FROM pipeline_run WHERE run_id = ?1",
                params![run_id],
                Self::row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    pub fn list_runs(&self) -> Result<Vec<RunRecord>, StateError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT run_id, pipeline_name, status, input, labels_json, current_step,
                    total_tokens, started_at, completed_at
             FROM pipeline_run ORDER BY started_at DESC",
        )?;
        let rows = stmt
            .query_map([], Self::row_to_run)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
        let labels_json: String = row.get(4)?;
        let started_at: String = row.get(7)?;
        let completed_at: Option<String> = row.get(8)?;
        Ok(RunRecord {
            run_id: row.get(0)?,
            pipeline_name: row.get(1)?,
            status: RunStatus::parse(&row.get::<_, String>(2)?),
            input: row.get(3)?,
            labels: serde_json::from_str(&labels_json).unwrap_or_default(),
            current_step: row.get(5)?,
            total_tokens: row.get::<_, i64>(6)? as u64,
            started_at: parse_ts(&started_at),
            completed_at: completed_at.as_deref().map(parse_ts),
        })
    }

    // ------------------------------------------------------------------
    // step_state
    // ------------------------------------------------------------------

    /// Idempotent by primary key: writing the same step twice leaves one row
    /// carrying the latest values.
    pub fn upsert_step(&self, run_id: &str, step: &StepRecord) -> Result<(), StateError> {
        self.conn.lock().execute(
            "INSERT INTO step_state
             (run_id, step_id, state, retry_count, tokens_used, workspace_path,
              error_message, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(run_id, step_id) DO UPDATE SET
               state = excluded.state,
               retry_count = excluded.retry_count,
               tokens_used = excluded.tokens_used,
               workspace_path = excluded.workspace_path,
               error_message = excluded.error_message,
               started_at = excluded.started_at,
               completed_at = excluded.completed_at",
            params![
                run_id,
                step.step_id,
                step.state.as_str(),
                step.retry_count,
                step.tokens_used as i64,
                step.workspace_path,
                step.error_message,
                step.started_at.map(|t| t.to_rfc3339()),
                step.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn steps_for_run(&self, run_id: &str) -> Result<Vec<StepRecord>, StateError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT step_id, state, retry_count, tokens_used, workspace_path,
                    error_message, started_at, completed_at
             FROM step_state WHERE run_id = ?1 ORDER BY step_id",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                let started: Option<String> = row.get(6)?;
                let completed: Option<String> = row.get(7)?;
                Ok(StepRecord {
                    step_id: row.get(0)?,
                    state: StepState::parse(&row.get::<_, String>(1)?),
                    retry_count: row.get(2)?,
                    tokens_used: row.get::<_, i64>(3)? as u64,
                    workspace_path: row.get(4)?,
                    error_message: row.get(5)?,
                    started_at: started.as_deref().map(parse_ts),
                    completed_at: completed.as_deref().map(parse_ts),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Demote Running steps to Failed (they were interrupted). Returns the
    /// demoted step ids. Runs before resume scheduling.
    pub fn demote_interrupted(&self, run_id: &str) -> Result<Vec<String>, StateError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT step_id FROM step_state WHERE run_id = ?1 AND state IN ('running', 'retrying')",
        )?;
        let demoted: Vec<String> = stmt
            .query_map(params![run_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        conn.execute(
            "UPDATE step_state
             SET state = 'failed', error_message = COALESCE(error_message, 'interrupted')
             WHERE run_id = ?1 AND state IN ('running', 'retrying')",
            params![run_id],
        )?;
        Ok(demoted)
    }

    // ------------------------------------------------------------------
    // event_log / artifact / performance_metric
    // ------------------------------------------------------------------

    pub fn record_event(&self, event: &Event) -> Result<(), StateError> {
        let payload = serde_json::to_string(event).unwrap_or_default();
        self.conn.lock().execute(
            "INSERT INTO event_log (run_id, step_id, state, payload, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.run_id,
                event.step_id,
                event.kind.state_name(),
                payload,
                event.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn events_for_run(&self, run_id: &str) -> Result<Vec<String>, StateError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT payload FROM event_log WHERE run_id = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map(params![run_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn record_artifact(
        &self,
        record: &crate::artifact::ArtifactRecord,
    ) -> Result<(), StateError> {
        self.conn.lock().execute(
            "INSERT INTO artifact (run_id, step_id, name, path, type, size_bytes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.run_id,
                record.step_id,
                record.name,
                record.path.display().to_string(),
                record.artifact_type.as_str(),
                record.size_bytes as i64,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn record_metric(
        &self,
        run_id: &str,
        step_id: Option<&str>,
        name: &str,
        value: f64,
    ) -> Result<(), StateError> {
        self.conn.lock().execute(
            "INSERT INTO performance_metric (run_id, step_id, name, value, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, step_id, name, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish()
    }
}
