//! WAL-mode SQLite store for the latest known status of every task.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::debug;

use crate::message::TaskId;

/// Error type for status store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to open status store: {0}")]
    Open(#[source] sqlx::Error),

    #[error("failed to apply schema: {0}")]
    Schema(#[source] sqlx::Error),

    #[error("status write failed: {0}")]
    Write(#[source] sqlx::Error),
}

/// Execution state recorded for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Done,
    Error,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    fn from_column(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "done" => Self::Done,
            _ => Self::Error,
        }
    }
}

/// The latest known status of one task, keyed by `task_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusRow {
    pub task_id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_step: Option<u32>,
    pub total_steps: Option<u32>,
    pub detail: Option<String>,
}

/// WAL checkpoint modes, in order of increasing strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    Passive,
    Full,
    Restart,
    /// Checkpoint and reset the log file to zero bytes.
    Truncate,
}

impl CheckpointMode {
    fn as_sql(&self) -> &'static str {
        match self {
            Self::Passive => "PASSIVE",
            Self::Full => "FULL",
            Self::Restart => "RESTART",
            Self::Truncate => "TRUNCATE",
        }
    }
}

/// Result of a `PRAGMA wal_checkpoint` call.
#[derive(Debug, Clone)]
pub struct WalCheckpointResult {
    /// `true` if the checkpoint could not fully complete because a reader
    /// held the WAL file open.
    pub busy: bool,
    /// Total number of frames in the WAL log.
    pub log_frames: i64,
    /// Number of frames that were actually checkpointed.
    pub checkpointed_frames: i64,
}

/// Schema for the engine-owned status table.
pub const TASK_STATUS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS task_status (
    task_id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    state TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    last_step INTEGER,
    total_steps INTEGER,
    detail TEXT
)
"#;

type StatusTuple = (
    i64,
    String,
    String,
    String,
    Option<String>,
    Option<i64>,
    Option<i64>,
    Option<String>,
);

/// Durable table of latest-known task status.
///
/// Opens a single-connection pool: the handle itself is the single-writer
/// token, and only the status writer ever holds it during a run. External
/// processes may open their own read-only handles concurrently under WAL.
pub struct StatusStore {
    pool: SqlitePool,
}

impl StatusStore {
    /// Open or create the backing database at the given path.
    ///
    /// With `wal` enabled the database runs in write-ahead-log mode with
    /// `synchronous=NORMAL`, so readers are never blocked by the in-flight
    /// writer.
    pub async fn open(path: impl AsRef<Path>, wal: bool) -> Result<Self, StoreError> {
        let mut opts = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        if wal {
            opts = opts
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .map_err(StoreError::Open)?;

        Ok(Self { pool })
    }

    /// Create an in-memory store (useful for tests).
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(StoreError::Open)?;
        Ok(Self { pool })
    }

    /// Idempotently apply DDL, statement by statement.
    ///
    /// Callers may use this for their own tables in the same database; the
    /// engine applies [`TASK_STATUS_SCHEMA`] through it at startup.
    pub async fn ensure_schema(&self, ddl: &str) -> Result<(), StoreError> {
        for statement in ddl.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed)
                    .execute(&self.pool)
                    .await
                    .map_err(StoreError::Schema)?;
            }
        }
        Ok(())
    }

    /// Insert a status row, or overwrite all non-key fields if the task
    /// already has one. Atomic per call.
    pub async fn upsert(&self, row: &StatusRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO task_status
                (task_id, name, state, started_at, finished_at, last_step, total_steps, detail)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(task_id) DO UPDATE SET
                name = excluded.name,
                state = excluded.state,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at,
                last_step = excluded.last_step,
                total_steps = excluded.total_steps,
                detail = excluded.detail
            "#,
        )
        .bind(row.task_id.0)
        .bind(&row.name)
        .bind(row.state.as_str())
        .bind(row.started_at.to_rfc3339())
        .bind(row.finished_at.map(|t| t.to_rfc3339()))
        .bind(row.last_step.map(|s| s as i64))
        .bind(row.total_steps.map(|s| s as i64))
        .bind(&row.detail)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Write)?;

        Ok(())
    }

    /// Fetch the status row for one task, if any.
    pub async fn fetch_status(&self, task_id: TaskId) -> Result<Option<StatusRow>, StoreError> {
        let row: Option<StatusTuple> = sqlx::query_as(
            r#"
            SELECT task_id, name, state, started_at, finished_at, last_step, total_steps, detail
            FROM task_status
            WHERE task_id = ?
            "#,
        )
        .bind(task_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Write)?;

        Ok(row.map(Self::row_from_tuple))
    }

    /// Fetch every status row, ordered by task id.
    pub async fn fetch_all(&self) -> Result<Vec<StatusRow>, StoreError> {
        let rows: Vec<StatusTuple> = sqlx::query_as(
            r#"
            SELECT task_id, name, state, started_at, finished_at, last_step, total_steps, detail
            FROM task_status
            ORDER BY task_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Write)?;

        Ok(rows.into_iter().map(Self::row_from_tuple).collect())
    }

    /// Fold the write-ahead log back into the main database file.
    pub async fn checkpoint(&self, mode: CheckpointMode) -> Result<WalCheckpointResult, StoreError> {
        let pragma = format!("PRAGMA wal_checkpoint({})", mode.as_sql());
        let row: (i64, i64, i64) = sqlx::query_as(&pragma)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::Write)?;

        let result = WalCheckpointResult {
            busy: row.0 != 0,
            log_frames: row.1,
            checkpointed_frames: row.2,
        };

        debug!(
            mode = mode.as_sql(),
            busy = result.busy,
            log_frames = result.log_frames,
            checkpointed = result.checkpointed_frames,
            "WAL checkpoint"
        );

        Ok(result)
    }

    /// Release the connection.
    pub async fn close(self) {
        self.pool.close().await;
    }

    fn row_from_tuple(t: StatusTuple) -> StatusRow {
        let (task_id, name, state, started_at, finished_at, last_step, total_steps, detail) = t;
        StatusRow {
            task_id: TaskId(task_id),
            name,
            state: TaskState::from_column(&state),
            started_at: parse_utc(&started_at),
            finished_at: finished_at.as_deref().map(parse_utc),
            last_step: last_step.map(|s| s as u32),
            total_steps: total_steps.map(|s| s as u32),
            detail,
        }
    }
}

fn parse_utc(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
