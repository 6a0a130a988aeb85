//! Pool orchestrator: dispatches tasks to a bounded worker pool and
//! supervises the status writer.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::message::{self, Task, TaskId, TaskMessage};
use crate::store::{StatusStore, StoreError, TASK_STATUS_SCHEMA};
use crate::worker::{self, TaskRoutine};
use crate::writer::{CheckpointPolicy, StatusWriter};

/// Errors that abort a whole run.
///
/// Per-task faults never appear here; they are captured at the worker
/// boundary and surface as `error` rows in the status store.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The status store could not be opened or its schema applied.
    /// Raised before any task is dispatched.
    #[error("status store setup failed: {0}")]
    Store(#[from] StoreError),

    /// A status write failed after exhausting retries. In-flight tasks
    /// still ran to completion; only persistence was lost.
    #[error("status writer failed: {0}")]
    StoreWrite(#[source] StoreError),

    /// The status writer disappeared without signaling completion.
    #[error("message channel closed unexpectedly")]
    ChannelClosed,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Tasks that finished with `done` status.
    pub done: usize,
    /// Tasks that finished with `error` status.
    pub error: usize,
    /// WAL checkpoints issued, including the final truncating one.
    pub checkpoints: usize,
}

impl RunSummary {
    /// Total number of tasks that reached a terminal state.
    pub fn total(&self) -> usize {
        self.done + self.error
    }
}

/// Requests a running engine to stop dispatching new tasks.
///
/// In-flight tasks finish normally and the run drains and checkpoints as
/// usual, so no status update is lost.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Stop pulling new tasks from the source.
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

/// Builder for configuring an [`Engine`].
pub struct EngineBuilder {
    db_path: PathBuf,
    workers: usize,
    wal: bool,
    store_task_status: bool,
    checkpoint_policy: CheckpointPolicy,
    channel_capacity: usize,
}

impl EngineBuilder {
    /// Create a builder with the given status database path.
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            workers: 4,
            wal: true,
            store_task_status: true,
            checkpoint_policy: CheckpointPolicy::default(),
            channel_capacity: 256,
        }
    }

    /// Set the worker pool size.
    ///
    /// # Panics
    ///
    /// Panics if `n` is 0.
    pub fn workers(mut self, n: usize) -> Self {
        assert!(n > 0, "worker pool must have at least one slot");
        self.workers = n;
        self
    }

    /// Enable or disable write-ahead-log mode on the status store.
    pub fn wal(mut self, wal: bool) -> Self {
        self.wal = wal;
        self
    }

    /// Enable or disable status persistence entirely.
    ///
    /// With persistence disabled no database is opened; the run still
    /// produces a [`RunSummary`].
    pub fn store_task_status(mut self, enabled: bool) -> Self {
        self.store_task_status = enabled;
        self
    }

    /// Set the checkpoint batching policy.
    pub fn checkpoint_policy(mut self, policy: CheckpointPolicy) -> Self {
        self.checkpoint_policy = policy;
        self
    }

    /// Set the message channel capacity.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        assert!(capacity > 0, "channel capacity must be at least 1");
        self.channel_capacity = capacity;
        self
    }

    /// Build the engine.
    pub fn build(self) -> Engine {
        let (stop_tx, stop_rx) = watch::channel(false);
        Engine {
            db_path: self.db_path,
            workers: self.workers,
            wal: self.wal,
            store_task_status: self.store_task_status,
            checkpoint_policy: self.checkpoint_policy,
            channel_capacity: self.channel_capacity,
            stop_tx,
            stop_rx,
        }
    }
}

/// Runs a stream of tasks across a bounded pool of concurrent workers,
/// recording each task's latest status through the single status writer.
pub struct Engine {
    db_path: PathBuf,
    workers: usize,
    wal: bool,
    store_task_status: bool,
    checkpoint_policy: CheckpointPolicy,
    channel_capacity: usize,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl Engine {
    /// Start configuring an engine.
    pub fn builder(db_path: impl Into<PathBuf>) -> EngineBuilder {
        EngineBuilder::new(db_path)
    }

    /// Handle for requesting a cooperative stop of a running engine.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.stop_tx.clone(),
        }
    }

    /// Run every task from the source to completion and return the tallies.
    ///
    /// The source is pulled lazily, one task per free worker slot, so an
    /// unbounded generator is as valid as a `Vec`. The call blocks until
    /// all dispatched tasks have finished and the status writer has applied
    /// and checkpointed every message.
    ///
    /// A failing task never fails the run; only setup errors and a dead
    /// status writer do.
    pub async fn run(
        &self,
        tasks: impl IntoIterator<Item = Task>,
        routine: Arc<dyn TaskRoutine>,
    ) -> Result<RunSummary, EngineError> {
        // Idle -> Running: the store must be ready before any dispatch.
        let store = if self.store_task_status {
            let store = StatusStore::open(&self.db_path, self.wal).await?;
            store.ensure_schema(TASK_STATUS_SCHEMA).await?;
            Some(store)
        } else {
            None
        };

        let (sink, rx) = message::channel(self.channel_capacity);
        let writer = StatusWriter::new(store, self.checkpoint_policy.clone());
        let writer_handle = tokio::spawn(writer.run(rx));

        info!(
            workers = self.workers,
            store = self.store_task_status,
            "run started"
        );

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let stop_rx = self.stop_rx.clone();
        let mut handles: Vec<(TaskId, JoinHandle<()>)> = Vec::new();
        let mut source = tasks.into_iter();
        let mut dispatched = 0usize;

        loop {
            if *stop_rx.borrow() {
                info!(dispatched, "stop requested, no further tasks dispatched");
                break;
            }

            // A free slot is required before the next task is even pulled,
            // which keeps exactly `workers` tasks in flight and lets the
            // source stream lazily.
            let permit = semaphore.clone().acquire_owned().await.unwrap();

            if *stop_rx.borrow() {
                info!(dispatched, "stop requested, no further tasks dispatched");
                break;
            }

            let Some(task) = source.next() else {
                break;
            };
            dispatched += 1;

            let task_id = task.id;
            let routine = routine.clone();
            let sink = sink.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                worker::execute(task, routine, sink).await;
            });
            handles.push((task_id, handle));
        }

        // Running -> Draining: wait for every in-flight task's terminal
        // message. A panicked worker gets its Finished synthesized here so
        // the exactly-one-Finished invariant holds for every dispatched task.
        for (task_id, handle) in handles {
            if let Err(join_err) = handle.await {
                warn!(task_id = task_id.0, error = %join_err, "worker panicked");
                let msg = TaskMessage::finished_err(task_id, format!("task panicked: {join_err}"));
                if sink.send(msg).await.is_err() {
                    warn!(task_id = task_id.0, "could not record panic, channel closed");
                }
            }
        }

        // Draining -> Done: release the last producer, then wait for the
        // writer to drain, checkpoint, and close the store.
        drop(sink);
        let report = match writer_handle.await {
            Ok(Ok(report)) => report,
            Ok(Err(store_err)) => return Err(EngineError::StoreWrite(store_err)),
            Err(_) => return Err(EngineError::ChannelClosed),
        };

        let summary = RunSummary {
            done: report.done,
            error: report.error,
            checkpoints: report.checkpoints,
        };
        info!(
            dispatched,
            done = summary.done,
            error = summary.error,
            "run complete"
        );
        Ok(summary)
    }
}
