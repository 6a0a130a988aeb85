//! Per-task ordering and exactly-once guarantees for lifecycle messages.

use std::sync::Arc;

use anyhow::anyhow;
use pipeloom::{channel, execute, routine_fn, Task, TaskMessage, TaskRoutine, TaskStatus};

/// Run one task against a probe channel and collect everything it emitted.
async fn collect_messages(task: Task, routine: Arc<dyn TaskRoutine>) -> Vec<TaskMessage> {
    let (sink, mut rx) = channel(64);
    execute(task, routine, sink).await;

    let mut messages = Vec::new();
    while let Some(msg) = rx.recv().await {
        messages.push(msg);
    }
    messages
}

#[tokio::test]
async fn success_emits_started_then_finished_exactly_once() {
    let routine = routine_fn(|task, _progress| async move {
        Ok(Some(format!("ok:{}", task.name)))
    });

    let messages = collect_messages(Task::new(1, "posts"), routine).await;
    assert_eq!(messages.len(), 2);

    match &messages[0] {
        TaskMessage::Started { task_id, name, .. } => {
            assert_eq!(task_id.0, 1);
            assert_eq!(name, "posts");
        }
        other => panic!("expected Started first, got {other:?}"),
    }
    match &messages[1] {
        TaskMessage::Finished {
            status,
            result,
            message,
            ..
        } => {
            assert_eq!(*status, TaskStatus::Done);
            assert_eq!(result.as_deref(), Some("ok:posts"));
            assert!(message.is_none());
        }
        other => panic!("expected Finished last, got {other:?}"),
    }
}

#[tokio::test]
async fn failure_emits_finished_error_with_the_fault_description() {
    let routine = routine_fn(|_task, _progress| async move {
        Err::<Option<String>, _>(anyhow!("boom"))
    });

    let messages = collect_messages(Task::new(2, "todos"), routine).await;
    assert_eq!(messages.len(), 2);

    assert!(matches!(messages[0], TaskMessage::Started { .. }));
    match &messages[1] {
        TaskMessage::Finished {
            status,
            result,
            message,
            ..
        } => {
            assert_eq!(*status, TaskStatus::Error);
            assert!(result.is_none());
            assert!(message.as_deref().unwrap().contains("boom"));
        }
        other => panic!("expected Finished last, got {other:?}"),
    }
}

#[tokio::test]
async fn progress_steps_are_ordered_and_bounded() {
    let routine = routine_fn(|_task, progress| async move {
        progress.step(1, 3, "extracted").await.ok();
        progress.step(2, 3, "transformed").await.ok();
        progress.step(3, 3, "loaded").await.ok();
        Ok(None)
    });

    let messages = collect_messages(Task::new(3, "users"), routine).await;
    assert_eq!(messages.len(), 5);
    assert!(matches!(messages[0], TaskMessage::Started { .. }));
    assert!(matches!(messages[4], TaskMessage::Finished { .. }));

    let mut previous = 0;
    for msg in &messages[1..4] {
        match msg {
            TaskMessage::Progress {
                task_id,
                step,
                total,
                ..
            } => {
                assert_eq!(task_id.0, 3);
                assert!(*step >= previous, "steps must be non-decreasing");
                assert!(*step >= 1 && *step <= *total);
                previous = *step;
            }
            other => panic!("expected Progress, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn every_message_carries_the_dispatched_task_id() {
    let routine = routine_fn(|_task, progress| async move {
        progress.step(1, 1, "worked").await.ok();
        Ok(None)
    });

    let messages = collect_messages(Task::new(42, "tagged"), routine).await;
    assert!(!messages.is_empty());
    assert!(messages.iter().all(|m| m.task_id().0 == 42));
}
