//! # Pipeloom
//!
//! A small task-orchestration engine: run a stream of independent tasks
//! across a bounded pool of concurrent workers, collect lifecycle events
//! over a message channel, and durably record the latest status of every
//! task in a WAL-mode SQLite store that other processes can read while
//! work is still in flight.
//!
//! - **Bounded pool** - exactly `workers` tasks in flight, sourced lazily
//! - **Fault isolation** - a failing task is recorded as `error` and never
//!   aborts the pool
//! - **Single writer** - all status writes funnel through one consumer, so
//!   workers never contend for the database
//! - **Bounded log** - the write-ahead log is checkpointed on a count/time
//!   policy and truncated on shutdown
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pipeloom::{Engine, Task, routine_fn};
//!
//! let routine = routine_fn(|task, progress| async move {
//!     progress.step(1, 2, "extracted").await.ok();
//!     progress.step(2, 2, "loaded").await.ok();
//!     Ok(Some(format!("ok:{}", task.name)))
//! });
//!
//! let engine = Engine::builder("etl.db").workers(4).build();
//! let summary = engine
//!     .run([Task::new(1, "posts"), Task::new(2, "todos")], routine)
//!     .await?;
//! assert_eq!(summary.total(), 2);
//! ```

pub mod engine;
pub mod message;
pub mod store;
pub mod worker;
pub mod writer;

pub use engine::{Engine, EngineBuilder, EngineError, RunSummary, ShutdownHandle};
pub use message::{channel, ChannelClosed, MessageSink, Task, TaskId, TaskMessage, TaskStatus};
pub use store::{
    CheckpointMode, StatusRow, StatusStore, StoreError, TaskState, WalCheckpointResult,
    TASK_STATUS_SCHEMA,
};
pub use worker::{execute, routine_fn, ProgressReporter, TaskRoutine};
pub use writer::CheckpointPolicy;
