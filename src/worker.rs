//! Task execution with fault isolation.
//!
//! A worker brackets one caller-supplied routine with lifecycle messages:
//! `Started` first, then exactly one `Finished` whether the routine returns
//! normally or fails. A routine's error never propagates past its own task,
//! which is what keeps one failing task from affecting the rest of the pool.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::message::{ChannelClosed, MessageSink, Task, TaskId, TaskMessage};

/// Caller-supplied routine executed once per task.
///
/// Returning `Ok` marks the task done, with an optional result string
/// recorded in the status store. Returning `Err` marks it failed; the
/// error's display chain becomes the task's recorded detail. Workers
/// perform no storage writes of their own.
#[async_trait]
pub trait TaskRoutine: Send + Sync {
    async fn run(
        &self,
        task: &Task,
        progress: ProgressReporter,
    ) -> anyhow::Result<Option<String>>;
}

type RoutineFuture = Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send>>;
type BoxedRoutineFn = Box<dyn Fn(Task, ProgressReporter) -> RoutineFuture + Send + Sync>;

struct FnRoutine(BoxedRoutineFn);

#[async_trait]
impl TaskRoutine for FnRoutine {
    async fn run(
        &self,
        task: &Task,
        progress: ProgressReporter,
    ) -> anyhow::Result<Option<String>> {
        (self.0)(task.clone(), progress).await
    }
}

/// Wrap an async closure as a [`TaskRoutine`].
pub fn routine_fn<F, Fut>(f: F) -> Arc<dyn TaskRoutine>
where
    F: Fn(Task, ProgressReporter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<String>>> + Send + 'static,
{
    Arc::new(FnRoutine(Box::new(move |task, progress| {
        Box::pin(f(task, progress))
    })))
}

/// Reports progress for a single task.
///
/// Bound to one task id, so a routine cannot emit messages on behalf of
/// another task.
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: TaskId,
    sink: MessageSink,
}

impl ProgressReporter {
    pub(crate) fn new(task_id: TaskId, sink: MessageSink) -> Self {
        Self { task_id, sink }
    }

    /// Record a progress step, `1 <= step <= total`, non-decreasing.
    ///
    /// A closed channel only happens once the run is tearing down or the
    /// status writer has failed; routines may ignore the error and run on.
    pub async fn step(
        &self,
        step: u32,
        total: u32,
        label: impl Into<String>,
    ) -> Result<(), ChannelClosed> {
        self.sink
            .send(TaskMessage::progress(self.task_id, step, total, label))
            .await
    }
}

/// Execute one task, emitting `Started` first and exactly one `Finished`
/// regardless of the routine's outcome.
///
/// If the consumer is already gone the messages are dropped; the task still
/// runs to completion so that a failed status writer never aborts work in
/// flight.
pub async fn execute(task: Task, routine: Arc<dyn TaskRoutine>, sink: MessageSink) {
    if sink.send(TaskMessage::started(&task)).await.is_err() {
        debug!(task_id = task.id.0, "started message dropped, channel closed");
    }
    debug!(task_id = task.id.0, name = %task.name, "task started");

    let progress = ProgressReporter::new(task.id, sink.clone());
    let terminal = match routine.run(&task, progress).await {
        Ok(result) => {
            debug!(task_id = task.id.0, "task done");
            TaskMessage::finished_ok(task.id, result)
        }
        Err(fault) => {
            warn!(task_id = task.id.0, error = %fault, "task routine failed");
            TaskMessage::finished_err(task.id, format!("{fault:#}"))
        }
    };

    if sink.send(terminal).await.is_err() {
        debug!(task_id = task.id.0, "finished message dropped, channel closed");
    }
}
