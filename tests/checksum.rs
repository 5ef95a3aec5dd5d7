//! Range checksumming and diff repair.

use std::time::Duration;

use checkpoint::{NewDiff, ProgressStore};
use mysql_migrate::checksum::ChecksumEngine;
use mysql_migrate::testing::{key, kv_def, kv_row, test_options, TestSession, TEST_TASK_ID};
use sync_core::{PrimaryRangeValue, TableId};
use tokio::sync::{mpsc, watch};

fn range(token: u64, min: i64, max: i64) -> PrimaryRangeValue {
    PrimaryRangeValue::new(token, "app", "t", key(min), key(max))
}

#[tokio::test]
async fn test_consistent_ranges_record_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let id = TableId::new("app", "t");
    let fixture = TestSession::new(vec![kv_def("app", "t")]);
    let table = fixture.table(&id).await;
    let rows: Vec<_> = (1..=6).map(|i| kv_row(i, "v")).collect();
    fixture.source.seed(&table, rows.clone());
    fixture.target.seed(&table, rows);

    let (tx, rx) = mpsc::channel(4);
    let (_done_tx, done_rx) = watch::channel(true);
    let engine = tokio::spawn(
        ChecksumEngine::new(fixture.session.clone(), test_options()).start(rx, done_rx),
    );
    tx.send(range(1, 1, 3)).await?;
    tx.send(range(2, 3, 6)).await?;
    drop(tx);

    let summary = engine.await??;
    assert_eq!(summary.ranges_checked, 2);
    assert_eq!(summary.mismatches, 0);
    assert_eq!(summary.rounds, 0);
    assert!(fixture.store.list_diffs(TEST_TASK_ID).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_mismatch_is_recorded_and_repaired() -> Result<(), Box<dyn std::error::Error>> {
    let id = TableId::new("app", "t");
    let fixture = TestSession::new(vec![kv_def("app", "t")]);
    let table = fixture.table(&id).await;
    fixture
        .source
        .seed(&table, [kv_row(1, "a"), kv_row(2, "b"), kv_row(3, "c")]);
    fixture
        .target
        .seed(&table, [kv_row(1, "a"), kv_row(2, "stale"), kv_row(3, "c")]);

    let (tx, rx) = mpsc::channel(4);
    let (_done_tx, done_rx) = watch::channel(true);
    tx.send(range(1, 1, 3)).await?;
    drop(tx);

    let summary = ChecksumEngine::new(fixture.session.clone(), test_options())
        .start(rx, done_rx)
        .await?;

    assert_eq!(summary.mismatches, 1);
    assert_eq!(summary.fixed, 1);
    assert_eq!(summary.unfixed, 0);
    assert_eq!(fixture.target.rows(&table), fixture.source.rows(&table));
    assert_eq!(fixture.target.operations(), vec!["replace (id=2)"]);

    let diffs = fixture.store.list_diffs(TEST_TASK_ID).await?;
    assert_eq!(diffs.len(), 1);
    assert!(diffs[0].is_fix);
    assert_eq!(diffs[0].min_id_value, key(1));
    assert_eq!(diffs[0].max_id_value, key(3));
    Ok(())
}

#[tokio::test]
async fn test_repair_deletes_rows_missing_from_source() -> Result<(), Box<dyn std::error::Error>> {
    let id = TableId::new("app", "t");
    let fixture = TestSession::new(vec![kv_def("app", "t")]);
    let table = fixture.table(&id).await;
    fixture.source.seed(&table, [kv_row(5, "e"), kv_row(9, "i")]);
    fixture
        .target
        .seed(&table, [kv_row(5, "e"), kv_row(7, "orphan"), kv_row(9, "i")]);
    let diff_id = fixture
        .store
        .insert_diff(
            TEST_TASK_ID,
            NewDiff {
                source: id.clone(),
                target: id.clone(),
                min_id_value: key(5),
                max_id_value: key(9),
            },
        )
        .await?;

    let summary = ChecksumEngine::new(fixture.session.clone(), test_options())
        .repair()
        .await?;

    assert_eq!(summary.fixed, 1);
    assert_eq!(summary.rounds, 1);
    assert_eq!(fixture.target.get(&table, &key(7)), None);
    assert_eq!(fixture.target.operations(), vec!["delete (id=7)"]);
    let diffs = fixture.store.list_diffs(TEST_TASK_ID).await?;
    assert!(diffs.iter().any(|d| d.id == diff_id && d.is_fix));
    assert!(fixture.store.unfixed_diffs(TEST_TASK_ID, 10).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_diff_already_consistent_is_marked_fixed_without_writes(
) -> Result<(), Box<dyn std::error::Error>> {
    let id = TableId::new("app", "t");
    let fixture = TestSession::new(vec![kv_def("app", "t")]);
    let table = fixture.table(&id).await;
    fixture.source.seed(&table, [kv_row(1, "a")]);
    fixture.target.seed(&table, [kv_row(1, "a")]);
    fixture
        .store
        .insert_diff(
            TEST_TASK_ID,
            NewDiff {
                source: id.clone(),
                target: id.clone(),
                min_id_value: key(1),
                max_id_value: key(1),
            },
        )
        .await?;

    let summary = ChecksumEngine::new(fixture.session.clone(), test_options())
        .repair()
        .await?;
    assert_eq!(summary.fixed, 1);
    assert!(fixture.target.operations().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_repair_waits_for_row_copy() -> Result<(), Box<dyn std::error::Error>> {
    let id = TableId::new("app", "t");
    let fixture = TestSession::new(vec![kv_def("app", "t")]);
    let table = fixture.table(&id).await;
    fixture.source.seed(&table, [kv_row(1, "a")]);
    fixture.target.seed(&table, [kv_row(1, "b")]);

    let (tx, rx) = mpsc::channel(4);
    let (done_tx, done_rx) = watch::channel(false);
    tx.send(range(1, 1, 1)).await?;
    drop(tx);
    let engine = tokio::spawn(
        ChecksumEngine::new(fixture.session.clone(), test_options()).start(rx, done_rx),
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!engine.is_finished());
    assert_eq!(fixture.target.get(&table, &key(1)), Some(kv_row(1, "b")));

    done_tx.send_replace(true);
    let summary = tokio::time::timeout(Duration::from_secs(5), engine).await???;
    assert_eq!(summary.fixed, 1);
    assert_eq!(fixture.target.get(&table, &key(1)), Some(kv_row(1, "a")));
    Ok(())
}

#[tokio::test]
async fn test_repair_is_skipped_when_row_copy_fails() {
    let fixture = TestSession::new(vec![kv_def("app", "t")]);
    let (tx, rx) = mpsc::channel(4);
    let (done_tx, done_rx) = watch::channel(false);
    drop(tx);
    drop(done_tx);

    let result = ChecksumEngine::new(fixture.session.clone(), test_options())
        .start(rx, done_rx)
        .await;
    assert!(result.is_err());
}
