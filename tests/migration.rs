//! Copy, binlog apply and checksum running together.

use std::sync::Arc;
use std::time::Duration;

use checkpoint::{FilesystemStore, ProgressStore};
use mysql_migrate::migrate::Migration;
use mysql_migrate::session::Session;
use mysql_migrate::testing::{
    kv_def, kv_image, kv_row, test_options, EventBuilder, ScriptStep, ScriptedBinlogConnector,
    TestSession, TEST_TASK_ID,
};
use mysql_migrate_binlog_source::RawRowChange;
use sync_core::{LogFilePos, TableId};

const TIMEOUT: Duration = Duration::from_secs(20);

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("mysql_migrate=info")
        .try_init()
        .ok();
}

#[tokio::test]
async fn test_target_converges_while_source_changes() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let id = TableId::new("app", "orders");
    let fixture = TestSession::with_batch_size(vec![kv_def("app", "orders")], 8);
    let table = fixture.table(&id).await;

    // The source already reflects every change the binlog carries.
    fixture.source.seed(
        &table,
        (1..=51)
            .filter(|i| *i != 20)
            .map(|i| kv_row(i, if i == 10 { "updated" } else { "v" })),
    );
    // Left over from an earlier attempt.
    fixture.target.seed(&table, [kv_row(20, "v"), kv_row(33, "stale")]);

    let mut events = EventBuilder::new("mysql-bin.000001", 4);
    let connector = Arc::new(ScriptedBinlogConnector::from_events([
        events.rows(&id, 2, vec![RawRowChange::insert(kv_image(51, "v"))]),
        events.rows(
            &id,
            2,
            vec![RawRowChange::update(kv_image(10, "v"), kv_image(10, "updated"))],
        ),
        events.rows(&id, 2, vec![RawRowChange::delete(kv_image(20, "v"))]),
    ]));

    let summary = tokio::time::timeout(
        TIMEOUT,
        Migration::new(fixture.session.clone(), test_options())
            .with_binlog(connector, true)
            .run(),
    )
    .await??;

    assert_eq!(summary.copy.tables_completed, 1);
    let apply = summary.apply.ok_or("binlog apply did not run")?;
    assert_eq!(apply.events_parsed, 3);
    let checksum = summary.checksum.ok_or("checksum did not run")?;
    assert_eq!(checksum.unfixed, 0);
    assert_eq!(fixture.target.rows(&table), fixture.source.rows(&table));
    assert!(fixture
        .store
        .unfixed_diffs(TEST_TASK_ID, 100)
        .await?
        .is_empty());
    Ok(())
}

#[tokio::test]
async fn test_copy_only_records_start_position() -> Result<(), Box<dyn std::error::Error>> {
    let id = TableId::new("app", "t");
    let fixture = TestSession::new(vec![kv_def("app", "t")]);
    let table = fixture.table(&id).await;
    fixture.source.seed(&table, [kv_row(1, "a"), kv_row(2, "b")]);

    let connector = Arc::new(
        ScriptedBinlogConnector::new(Vec::<ScriptStep>::new()).hold_open(),
    );
    connector.set_current_position(LogFilePos::new("mysql-bin.000012", 777));

    let summary = tokio::time::timeout(
        TIMEOUT,
        Migration::new(fixture.session.clone(), test_options())
            .with_binlog(connector.clone(), false)
            .run(),
    )
    .await??;

    assert!(summary.apply.is_none());
    assert!(connector.connects().is_empty());
    let positions = fixture.store.load_positions(TEST_TASK_ID).await?;
    assert_eq!(positions.start, Some(LogFilePos::new("mysql-bin.000012", 777)));
    assert_eq!(fixture.target.rows(&table), fixture.source.rows(&table));
    Ok(())
}

#[tokio::test]
async fn test_migration_without_checksum() -> Result<(), Box<dyn std::error::Error>> {
    let id = TableId::new("app", "t");
    let fixture = TestSession::new(vec![kv_def("app", "t")]);
    let table = fixture.table(&id).await;
    fixture.source.seed(&table, [kv_row(1, "a")]);

    let mut options = test_options();
    options.checksum = false;
    let summary = Migration::new(fixture.session.clone(), options).run().await?;

    assert!(summary.checksum.is_none());
    assert!(summary.apply.is_none());
    assert_eq!(summary.copy.rows_copied, 1);
    Ok(())
}

#[tokio::test]
async fn test_migration_needs_tables() {
    let fixture = TestSession::new(Vec::new());
    let result = Migration::new(fixture.session.clone(), test_options())
        .run()
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_invalid_options_are_rejected() {
    let fixture = TestSession::new(vec![kv_def("app", "t")]);
    let mut options = test_options();
    options.copy_parallelism = 0;
    let result = Migration::new(fixture.session.clone(), options).run().await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_progress_survives_a_restart() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let id = TableId::new("app", "t");
    let fixture = TestSession::with_batch_size(vec![kv_def("app", "t")], 5);
    let table = fixture.table(&id).await;
    fixture
        .source
        .seed(&table, (1..=30).map(|i| kv_row(i, "v")));

    let session = Session {
        store: Arc::new(FilesystemStore::open(dir.path())?),
        ..fixture.session.clone()
    };
    Migration::new(session.clone(), test_options()).run().await?;
    assert_eq!(fixture.target.rows(&table).len(), 30);

    fixture.target.clear_operations();
    let restarted = Session {
        store: Arc::new(FilesystemStore::open(dir.path())?),
        ..session
    };
    let progress = restarted
        .store
        .load_table(TEST_TASK_ID, &id)
        .await?
        .ok_or("progress not persisted")?;
    assert!(progress.row_copy_complete);

    let summary = Migration::new(restarted, test_options()).run().await?;
    assert_eq!(summary.copy.ranges_copied, 0);
    assert!(fixture.target.operations().is_empty());
    Ok(())
}
