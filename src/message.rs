//! Lifecycle messages and the channel workers emit them through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Unique identifier for a task within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub i64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// An opaque unit of work dispatched to a worker.
///
/// The engine attaches no payload; whatever a routine needs beyond the id
/// and name is owned by the routine itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
}

impl Task {
    /// Create a task with the given id and human-readable name.
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id: TaskId(id),
            name: name.into(),
        }
    }
}

/// Terminal status of a finished task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Done,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

/// A lifecycle event emitted while a task executes.
///
/// For a given task the order is always `Started`, zero or more `Progress`,
/// then exactly one `Finished`. Messages for different tasks interleave
/// freely on the shared channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskMessage {
    /// The task has been picked up by a worker.
    Started {
        task_id: TaskId,
        name: String,
        started_at: DateTime<Utc>,
    },
    /// The task reported a progress step, `1 <= step <= total`.
    Progress {
        task_id: TaskId,
        step: u32,
        total: u32,
        label: String,
    },
    /// The task reached a terminal state.
    ///
    /// `result` is present iff the status is `Done`; `message` carries the
    /// captured fault description iff the status is `Error`.
    Finished {
        task_id: TaskId,
        status: TaskStatus,
        finished_at: DateTime<Utc>,
        result: Option<String>,
        message: Option<String>,
    },
}

impl TaskMessage {
    /// Build a `Started` message for the given task, stamped now.
    pub fn started(task: &Task) -> Self {
        Self::Started {
            task_id: task.id,
            name: task.name.clone(),
            started_at: Utc::now(),
        }
    }

    /// Build a `Progress` message.
    pub fn progress(task_id: TaskId, step: u32, total: u32, label: impl Into<String>) -> Self {
        Self::Progress {
            task_id,
            step,
            total,
            label: label.into(),
        }
    }

    /// Build a successful `Finished` message, stamped now.
    pub fn finished_ok(task_id: TaskId, result: Option<String>) -> Self {
        Self::Finished {
            task_id,
            status: TaskStatus::Done,
            finished_at: Utc::now(),
            result,
            message: None,
        }
    }

    /// Build a failed `Finished` message, stamped now.
    pub fn finished_err(task_id: TaskId, message: impl Into<String>) -> Self {
        Self::Finished {
            task_id,
            status: TaskStatus::Error,
            finished_at: Utc::now(),
            result: None,
            message: Some(message.into()),
        }
    }

    /// The id of the task this message belongs to.
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Started { task_id, .. }
            | Self::Progress { task_id, .. }
            | Self::Finished { task_id, .. } => *task_id,
        }
    }
}

/// The message channel closed before the run completed.
///
/// Only happens once the consumer is gone; during a healthy run every send
/// is accepted (or backpressured) by the status writer.
#[derive(Error, Debug)]
#[error("message channel closed before the run completed")]
pub struct ChannelClosed;

/// Sending half of the message channel handed to workers.
#[derive(Clone)]
pub struct MessageSink {
    tx: mpsc::Sender<TaskMessage>,
}

impl MessageSink {
    /// Send a message, waiting if the channel is at capacity.
    pub async fn send(&self, msg: TaskMessage) -> Result<(), ChannelClosed> {
        self.tx.send(msg).await.map_err(|_| ChannelClosed)
    }
}

/// Create a bounded message channel.
///
/// The capacity bounds how far producers can run ahead of the status
/// writer; a full channel backpressures workers instead of buffering
/// without limit.
pub fn channel(capacity: usize) -> (MessageSink, mpsc::Receiver<TaskMessage>) {
    let (tx, rx) = mpsc::channel(capacity);
    (MessageSink { tx }, rx)
}
