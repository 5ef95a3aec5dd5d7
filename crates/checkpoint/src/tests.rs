//! Unit tests for the checkpoint crate.

use sync_core::{ColumnValue, KeyValue, LogFilePos, TableId};
use tempfile::TempDir;

use crate::{
    Checkpoint, FilesystemStore, MemoryStore, NewDiff, PositionKind, ProgressStore,
    TableProgress,
};

fn id_key(id: i64) -> KeyValue {
    KeyValue::from_parts(["id"], vec![ColumnValue::Int(id)])
}

fn users() -> TableId {
    TableId::new("app", "users")
}

fn diff(min: i64, max: i64) -> NewDiff {
    NewDiff {
        source: users(),
        target: TableId::new("app_new", "users"),
        min_id_value: id_key(min),
        max_id_value: id_key(max),
    }
}

/// Exercises every store operation against one backend.
async fn exercise_store(store: &dyn ProgressStore) {
    assert_eq!(store.load_table("t1", &users()).await.unwrap(), None);

    let progress = TableProgress {
        row_copy_complete: false,
        max_id_value: Some(id_key(100)),
        curr_id_value: Some(id_key(1)),
    };
    store.save_table("t1", &users(), &progress).await.unwrap();
    let progress = TableProgress {
        curr_id_value: Some(id_key(40)),
        ..progress
    };
    store.save_table("t1", &users(), &progress).await.unwrap();
    assert_eq!(
        store.load_table("t1", &users()).await.unwrap(),
        Some(progress)
    );
    assert_eq!(store.load_table("t2", &users()).await.unwrap(), None);

    store
        .save_position("t1", PositionKind::Start, &LogFilePos::new("bin.000001", 4))
        .await
        .unwrap();
    store
        .save_position("t1", PositionKind::Applied, &LogFilePos::new("bin.000002", 900))
        .await
        .unwrap();
    let positions = store.load_positions("t1").await.unwrap();
    assert_eq!(positions.start, Some(LogFilePos::new("bin.000001", 4)));
    assert_eq!(positions.parsed, None);
    assert_eq!(
        positions.resume_from(),
        Some(&LogFilePos::new("bin.000002", 900))
    );

    store
        .save_rollback_position("t1", "target:3306", &LogFilePos::new("tgt.000009", 77))
        .await
        .unwrap();
    assert_eq!(
        store
            .load_rollback_position("t1", "target:3306")
            .await
            .unwrap(),
        Some(LogFilePos::new("tgt.000009", 77))
    );

    let first = store.insert_diff("t1", diff(1, 10)).await.unwrap();
    let second = store.insert_diff("t1", diff(10, 20)).await.unwrap();
    assert_ne!(first, second);

    let unfixed = store.unfixed_diffs("t1", 10).await.unwrap();
    assert_eq!(unfixed.len(), 2);
    assert_eq!(unfixed[0].min_id_value, id_key(1));
    assert_eq!(store.unfixed_diffs("t1", 1).await.unwrap().len(), 1);

    store.mark_diff_fixed("t1", first).await.unwrap();
    let unfixed = store.unfixed_diffs("t1", 10).await.unwrap();
    assert_eq!(unfixed.len(), 1);
    assert_eq!(unfixed[0].id, second);

    // Fixed records are kept, never deleted
    let all = store.list_diffs("t1").await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().any(|d| d.id == first && d.is_fix));
}

// ============================================================================
// Checkpoint Trait Tests
// ============================================================================

#[test]
fn test_log_file_pos_cli_roundtrip() {
    let pos = LogFilePos::new("mysql-bin.000042", 1337);
    let cli = pos.to_cli_string();
    assert_eq!(cli, "mysql-bin.000042:1337");
    assert_eq!(LogFilePos::from_cli_string(&cli).unwrap(), pos);
}

#[test]
fn test_log_file_pos_cli_rejects_garbage() {
    let err = LogFilePos::from_cli_string("mysql-bin.000042").unwrap_err();
    assert!(err.to_string().contains("mysql-binlog"));
    assert!(LogFilePos::from_cli_string("bin:notanumber").is_err());
}

// ============================================================================
// Store Tests
// ============================================================================

#[tokio::test]
async fn test_memory_store() {
    exercise_store(&MemoryStore::new()).await;
}

#[tokio::test]
async fn test_filesystem_store() {
    let dir = TempDir::new().unwrap();
    let store = FilesystemStore::open(dir.path()).unwrap();
    exercise_store(&store).await;
    assert!(dir.path().join("progress.json").exists());
}

#[tokio::test]
async fn test_filesystem_store_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = FilesystemStore::open(dir.path()).unwrap();
        store
            .save_position("t1", PositionKind::Stop, &LogFilePos::new("bin.000003", 10))
            .await
            .unwrap();
        store.insert_diff("t1", diff(5, 6)).await.unwrap();
    }

    let store = FilesystemStore::open(dir.path()).unwrap();
    assert_eq!(
        store.load_positions("t1").await.unwrap().stop,
        Some(LogFilePos::new("bin.000003", 10))
    );
    // Ids keep increasing after reopen
    let next = store.insert_diff("t1", diff(7, 8)).await.unwrap();
    assert_eq!(next, 2);
    assert_eq!(store.list_diffs("t1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_mark_unknown_diff_fails() {
    let store = MemoryStore::new();
    assert!(store.mark_diff_fixed("t1", 99).await.is_err());
}
