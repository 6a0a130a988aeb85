//! Tests for the WAL-mode status store.

use chrono::Utc;
use pipeloom::{
    CheckpointMode, StatusRow, StatusStore, StoreError, TaskId, TaskState, TASK_STATUS_SCHEMA,
};
use tempfile::TempDir;

fn running_row(task_id: i64, name: &str) -> StatusRow {
    StatusRow {
        task_id: TaskId(task_id),
        name: name.to_string(),
        state: TaskState::Running,
        started_at: Utc::now(),
        finished_at: None,
        last_step: None,
        total_steps: None,
        detail: None,
    }
}

async fn setup_store() -> StatusStore {
    let store = StatusStore::open_in_memory().await.unwrap();
    store.ensure_schema(TASK_STATUS_SCHEMA).await.unwrap();
    store
}

#[tokio::test]
async fn upsert_then_fetch_round_trips() {
    let store = setup_store().await;

    let row = running_row(1, "posts");
    store.upsert(&row).await.unwrap();

    let fetched = store.fetch_status(TaskId(1)).await.unwrap().unwrap();
    assert_eq!(fetched, row);

    assert!(store.fetch_status(TaskId(99)).await.unwrap().is_none());
}

#[tokio::test]
async fn upsert_overwrites_non_key_fields() {
    let store = setup_store().await;

    store.upsert(&running_row(1, "posts")).await.unwrap();

    let mut terminal = running_row(1, "posts");
    terminal.state = TaskState::Done;
    terminal.finished_at = Some(Utc::now());
    terminal.last_step = Some(3);
    terminal.total_steps = Some(3);
    terminal.detail = Some("ok:posts".to_string());
    store.upsert(&terminal).await.unwrap();

    let rows = store.fetch_all().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].state, TaskState::Done);
    assert_eq!(rows[0].last_step, Some(3));
    assert_eq!(rows[0].detail.as_deref(), Some("ok:posts"));
}

#[tokio::test]
async fn upsert_same_row_twice_is_idempotent() {
    let store = setup_store().await;

    let mut row = running_row(2, "todos");
    row.state = TaskState::Error;
    row.finished_at = Some(Utc::now());
    row.detail = Some("boom".to_string());

    store.upsert(&row).await.unwrap();
    let first = store.fetch_status(TaskId(2)).await.unwrap().unwrap();

    store.upsert(&row).await.unwrap();
    let second = store.fetch_status(TaskId(2)).await.unwrap().unwrap();

    assert_eq!(first, second);
    assert_eq!(store.fetch_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn ensure_schema_is_idempotent() {
    let store = setup_store().await;

    // Re-applying the engine schema must be a no-op.
    store.ensure_schema(TASK_STATUS_SCHEMA).await.unwrap();

    // Caller-defined DDL with multiple statements works the same way.
    let ddl = r#"
        CREATE TABLE IF NOT EXISTS posts(id INTEGER PRIMARY KEY, title TEXT);
        CREATE INDEX IF NOT EXISTS idx_posts_title ON posts(title);
    "#;
    store.ensure_schema(ddl).await.unwrap();
    store.ensure_schema(ddl).await.unwrap();
}

#[tokio::test]
async fn fetch_all_orders_by_task_id() {
    let store = setup_store().await;

    store.upsert(&running_row(3, "c")).await.unwrap();
    store.upsert(&running_row(1, "a")).await.unwrap();
    store.upsert(&running_row(2, "b")).await.unwrap();

    let rows = store.fetch_all().await.unwrap();
    let ids: Vec<i64> = rows.iter().map(|r| r.task_id.0).collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn open_creates_a_missing_database_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("status.db");

    let store = StatusStore::open(&path, true).await.unwrap();
    store.ensure_schema(TASK_STATUS_SCHEMA).await.unwrap();
    store.close().await;

    assert!(path.exists());
}

#[tokio::test]
async fn open_fails_on_unwritable_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("no_such_dir").join("status.db");

    let result = StatusStore::open(&path, true).await;
    assert!(matches!(result, Err(StoreError::Open(_))));
}

#[tokio::test]
async fn checkpoint_modes_run_on_a_file_backed_store() {
    let dir = TempDir::new().unwrap();
    let store = StatusStore::open(dir.path().join("status.db"), true)
        .await
        .unwrap();
    store.ensure_schema(TASK_STATUS_SCHEMA).await.unwrap();
    store.upsert(&running_row(1, "posts")).await.unwrap();

    for mode in [
        CheckpointMode::Passive,
        CheckpointMode::Full,
        CheckpointMode::Restart,
        CheckpointMode::Truncate,
    ] {
        let result = store.checkpoint(mode).await;
        assert!(result.is_ok(), "checkpoint({mode:?}) failed: {result:?}");
    }
    store.close().await;
}

#[tokio::test]
async fn truncate_checkpoint_resets_the_log() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("status.db");
    let wal_path = dir.path().join("status.db-wal");

    let store = StatusStore::open(&db_path, true).await.unwrap();
    store.ensure_schema(TASK_STATUS_SCHEMA).await.unwrap();

    for i in 1..=50 {
        store.upsert(&running_row(i, "load")).await.unwrap();
    }
    let wal_len = std::fs::metadata(&wal_path).map(|m| m.len()).unwrap_or(0);
    assert!(wal_len > 0, "expected a non-empty WAL after 50 upserts");

    let result = store.checkpoint(CheckpointMode::Truncate).await.unwrap();
    assert!(!result.busy);
    assert_eq!(
        result.log_frames, result.checkpointed_frames,
        "every frame should have been folded into the main file"
    );

    let wal_len = std::fs::metadata(&wal_path).map(|m| m.len()).unwrap_or(0);
    assert_eq!(wal_len, 0, "TRUNCATE should reset the log to zero bytes");

    store.close().await;
}
