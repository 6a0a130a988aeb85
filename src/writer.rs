//! Single-consumer status writer.
//!
//! All status writes funnel through this one task. SQLite permits only one
//! writer at a time even under WAL, so the writer exclusively owns the store
//! handle for the duration of a run; workers never touch the database.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::message::{TaskId, TaskMessage, TaskStatus};
use crate::store::{CheckpointMode, StatusRow, StatusStore, StoreError, TaskState};

/// How many times a failed write is retried before the run is failed.
/// Retrying is safe here: this task is the sole writer.
const WRITE_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// When to fold the write-ahead log back into the main database file.
///
/// A checkpoint runs after `every_upserts` writes or after `interval` has
/// elapsed since the last one, whichever comes first. This amortizes
/// checkpoint cost while bounding log growth under sustained throughput.
#[derive(Debug, Clone)]
pub struct CheckpointPolicy {
    pub every_upserts: usize,
    pub interval: Duration,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            every_upserts: 500,
            interval: Duration::from_secs(2),
        }
    }
}

/// Tallies accumulated while draining the run's messages.
#[derive(Debug, Default, Clone)]
pub(crate) struct WriterReport {
    pub done: usize,
    pub error: usize,
    pub checkpoints: usize,
}

/// Drains the aggregated message stream and applies it to the status store.
pub(crate) struct StatusWriter {
    store: Option<StatusStore>,
    policy: CheckpointPolicy,
    // Rows in flight, keyed by task id. The writer is the only mutator of
    // the store, so this cache is authoritative; entries are dropped once
    // the terminal row is durably recorded.
    rows: HashMap<TaskId, StatusRow>,
}

impl StatusWriter {
    /// Create a writer. With no store, messages are tallied but not persisted.
    pub(crate) fn new(store: Option<StatusStore>, policy: CheckpointPolicy) -> Self {
        Self {
            store,
            policy,
            rows: HashMap::new(),
        }
    }

    /// Consume messages until every producer is gone, then perform a final
    /// truncating checkpoint and release the store handle.
    ///
    /// The handle is released on every exit path; a write fault does not
    /// leak the connection.
    pub(crate) async fn run(
        mut self,
        mut rx: mpsc::Receiver<TaskMessage>,
    ) -> Result<WriterReport, StoreError> {
        let mut report = WriterReport::default();
        let drained = self.drain(&mut rx, &mut report).await;

        if let Some(store) = self.store.take() {
            // Channel closed cleanly: fold the log one last time so no
            // status update is lost.
            let finale = match &drained {
                Ok(()) => Self::checkpoint_with_retry(&store).await,
                Err(_) => Ok(()),
            };
            store.close().await;
            drained?;
            finale?;
            report.checkpoints += 1;
        } else {
            drained?;
        }

        info!(
            done = report.done,
            error = report.error,
            checkpoints = report.checkpoints,
            "status writer drained"
        );
        Ok(report)
    }

    async fn drain(
        &mut self,
        rx: &mut mpsc::Receiver<TaskMessage>,
        report: &mut WriterReport,
    ) -> Result<(), StoreError> {
        let mut since_checkpoint = 0usize;
        let mut last_checkpoint = Instant::now();

        while let Some(msg) = rx.recv().await {
            let wrote = self.apply(&msg, report).await?;

            if wrote {
                since_checkpoint += 1;
                if since_checkpoint >= self.policy.every_upserts
                    || last_checkpoint.elapsed() >= self.policy.interval
                {
                    if let Some(store) = &self.store {
                        Self::checkpoint_with_retry(store).await?;
                        report.checkpoints += 1;
                    }
                    since_checkpoint = 0;
                    last_checkpoint = Instant::now();
                }
            }
        }
        Ok(())
    }

    /// Apply one message. Returns whether a row was written.
    async fn apply(
        &mut self,
        msg: &TaskMessage,
        report: &mut WriterReport,
    ) -> Result<bool, StoreError> {
        if let TaskMessage::Finished { status, .. } = msg {
            match status {
                TaskStatus::Done => report.done += 1,
                TaskStatus::Error => report.error += 1,
            }
        }

        let Some(store) = &self.store else {
            return Ok(false);
        };

        let row = match msg {
            TaskMessage::Started {
                task_id,
                name,
                started_at,
            } => {
                let row = StatusRow {
                    task_id: *task_id,
                    name: name.clone(),
                    state: TaskState::Running,
                    started_at: *started_at,
                    finished_at: None,
                    last_step: None,
                    total_steps: None,
                    detail: None,
                };
                self.rows.insert(*task_id, row.clone());
                row
            }
            TaskMessage::Progress {
                task_id,
                step,
                total,
                label,
            } => {
                let cached = self.rows.get(task_id).cloned();
                let existing = match cached {
                    Some(row) => Some(row),
                    None => store.fetch_status(*task_id).await?,
                };
                let Some(mut row) = existing else {
                    debug!(task_id = task_id.0, "progress for unknown task, skipping");
                    return Ok(false);
                };
                row.last_step = Some(*step);
                row.total_steps = Some(*total);
                row.detail = Some(label.clone());
                self.rows.insert(*task_id, row.clone());
                row
            }
            TaskMessage::Finished {
                task_id,
                status,
                finished_at,
                result,
                message,
            } => {
                // Fall back to the stored row so duplicate deliveries of a
                // terminal message stay idempotent.
                let cached = self.rows.remove(task_id);
                let existing = match cached {
                    Some(row) => Some(row),
                    None => store.fetch_status(*task_id).await?,
                };
                let Some(mut row) = existing else {
                    debug!(task_id = task_id.0, "finish for unknown task, skipping");
                    return Ok(false);
                };
                row.state = match status {
                    TaskStatus::Done => TaskState::Done,
                    TaskStatus::Error => TaskState::Error,
                };
                row.finished_at = Some(*finished_at);
                row.detail = match status {
                    TaskStatus::Done => result.clone(),
                    TaskStatus::Error => message.clone(),
                };
                row
            }
        };

        Self::upsert_with_retry(store, &row).await?;
        Ok(true)
    }

    async fn upsert_with_retry(store: &StatusStore, row: &StatusRow) -> Result<(), StoreError> {
        let mut attempt = 0;
        loop {
            match store.upsert(row).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < WRITE_RETRIES => {
                    attempt += 1;
                    warn!(
                        task_id = row.task_id.0,
                        attempt,
                        error = %e,
                        "status upsert failed, retrying"
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => {
                    error!(task_id = row.task_id.0, error = %e, "status upsert failed");
                    return Err(e);
                }
            }
        }
    }

    async fn checkpoint_with_retry(store: &StatusStore) -> Result<(), StoreError> {
        let mut attempt = 0;
        loop {
            match store.checkpoint(CheckpointMode::Truncate).await {
                Ok(_) => return Ok(()),
                Err(e) if attempt < WRITE_RETRIES => {
                    attempt += 1;
                    warn!(attempt, error = %e, "checkpoint failed, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => {
                    error!(error = %e, "checkpoint failed");
                    return Err(e);
                }
            }
        }
    }
}
