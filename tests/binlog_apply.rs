//! Binlog apply against a scripted replication stream.

use std::sync::Arc;
use std::time::Duration;

use checkpoint::{PositionKind, ProgressStore};
use mysql_async::Value;
use mysql_migrate::binlog_apply::{prepare_start_position, BinlogApplyEngine};
use mysql_migrate::testing::{
    key, kv_def, kv_image, kv_row, test_options, EventBuilder, ScriptStep,
    ScriptedBinlogConnector, TestSession, TEST_TASK_ID,
};
use mysql_migrate_binlog_source::{BinlogEvent, RawRowChange};
use sync_core::{Column, ColumnType, ColumnValue, LogFilePos, TableId};

const TIMEOUT: Duration = Duration::from_secs(10);

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("mysql_migrate=debug")
        .try_init()
        .ok();
}

fn resume_of(event: &BinlogEvent) -> LogFilePos {
    match event {
        BinlogEvent::Rows(rows) => rows.resume.clone(),
        other => other.end().clone(),
    }
}

#[tokio::test]
async fn test_key_change_becomes_delete_and_replace() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let id = TableId::new("app", "t");
    let fixture = TestSession::new(vec![kv_def("app", "t")]);
    let table = fixture.table(&id).await;
    fixture.target.seed(&table, [kv_row(5, "x")]);

    let mut events = EventBuilder::new("mysql-bin.000001", 4);
    let connector = Arc::new(ScriptedBinlogConnector::from_events([events.rows(
        &id,
        2,
        vec![RawRowChange::update(kv_image(5, "x"), kv_image(9, "x"))],
    )]));

    let summary = BinlogApplyEngine::new(fixture.session.clone(), test_options(), connector)
        .start()
        .await?;

    assert_eq!(summary.operations_applied, 2);
    assert_eq!(fixture.target.rows(&table), vec![kv_row(9, "x")]);
    let mut ops = fixture.target.operations();
    ops.sort();
    assert_eq!(ops, vec!["delete (id=5)", "replace (id=9)"]);
    Ok(())
}

#[tokio::test]
async fn test_changes_to_one_row_apply_in_order() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let id = TableId::new("app", "t");
    let fixture = TestSession::new(vec![kv_def("app", "t")]);
    let table = fixture.table(&id).await;

    let mut events = EventBuilder::new("mysql-bin.000001", 4);
    let mut script = vec![
        events.rows(&id, 2, vec![RawRowChange::insert(kv_image(42, "a"))]),
        events.other(),
        events.rows(
            &id,
            2,
            vec![RawRowChange::update(kv_image(42, "a"), kv_image(42, "b"))],
        ),
        events.rows(&id, 2, vec![RawRowChange::delete(kv_image(42, "b"))]),
    ];
    // Unrelated rows interleaved on other keys.
    for i in 0..20 {
        script.push(events.rows(&id, 2, vec![RawRowChange::insert(kv_image(100 + i, "z"))]));
    }
    let connector = Arc::new(ScriptedBinlogConnector::from_events(script));

    tokio::time::timeout(
        TIMEOUT,
        BinlogApplyEngine::new(fixture.session.clone(), test_options(), connector).start(),
    )
    .await??;

    let ops_on_42: Vec<String> = fixture
        .target
        .operations()
        .into_iter()
        .filter(|op| op.ends_with("(id=42)"))
        .collect();
    assert_eq!(
        ops_on_42,
        vec!["replace (id=42)", "replace (id=42)", "delete (id=42)"]
    );
    assert_eq!(fixture.target.get(&table, &key(42)), None);
    assert_eq!(fixture.target.rows(&table).len(), 20);
    Ok(())
}

#[tokio::test]
async fn test_applied_and_rollback_positions_are_persisted() -> Result<(), Box<dyn std::error::Error>> {
    let id = TableId::new("app", "t");
    let fixture = TestSession::new(vec![kv_def("app", "t")]);
    fixture
        .target
        .set_master_status(LogFilePos::new("target-bin.000007", 990));

    let mut events = EventBuilder::new("mysql-bin.000001", 4);
    let first = events.rows(&id, 2, vec![RawRowChange::insert(kv_image(1, "a"))]);
    let last = events.rows(&id, 2, vec![RawRowChange::insert(kv_image(2, "b"))]);
    let trailing = events.other();
    let connector = Arc::new(ScriptedBinlogConnector::from_events([
        first,
        last.clone(),
        trailing.clone(),
    ]));

    let summary = BinlogApplyEngine::new(fixture.session.clone(), test_options(), connector)
        .start()
        .await?;

    assert_eq!(summary.events_parsed, 3);
    assert_eq!(summary.parsed.as_ref(), Some(trailing.end()));
    assert_eq!(summary.applied, Some(resume_of(&last)));

    let positions = fixture.store.load_positions(TEST_TASK_ID).await?;
    assert_eq!(positions.start, Some(LogFilePos::new("mysql-bin.000001", 4)));
    assert_eq!(positions.parsed.as_ref(), Some(trailing.end()));
    assert_eq!(positions.applied, Some(resume_of(&last)));
    assert_eq!(
        fixture
            .store
            .load_rollback_position(TEST_TASK_ID, "target:3306")
            .await?,
        Some(LogFilePos::new("target-bin.000007", 990))
    );
    Ok(())
}

#[tokio::test]
async fn test_apply_resumes_from_applied_position() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = TestSession::new(vec![kv_def("app", "t")]);
    let start = LogFilePos::new("mysql-bin.000001", 4);
    let applied = LogFilePos::new("mysql-bin.000002", 1200);
    fixture
        .store
        .save_position(TEST_TASK_ID, PositionKind::Start, &start)
        .await?;
    fixture
        .store
        .save_position(TEST_TASK_ID, PositionKind::Applied, &applied)
        .await?;

    let connector = Arc::new(ScriptedBinlogConnector::new(Vec::<ScriptStep>::new()));
    assert_eq!(
        prepare_start_position(&fixture.session, connector.as_ref(), None).await?,
        applied
    );

    BinlogApplyEngine::new(fixture.session.clone(), test_options(), connector.clone())
        .start()
        .await?;
    assert_eq!(connector.connects(), vec![applied]);
    Ok(())
}

#[tokio::test]
async fn test_explicit_start_position_is_used_once() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = TestSession::new(vec![kv_def("app", "t")]);
    let connector = ScriptedBinlogConnector::new(Vec::<ScriptStep>::new());
    connector.set_current_position(LogFilePos::new("mysql-bin.000009", 4));

    let explicit = LogFilePos::new("mysql-bin.000003", 120);
    let start =
        prepare_start_position(&fixture.session, &connector, Some(explicit.clone())).await?;
    assert_eq!(start, explicit);

    // A stored position wins over a new explicit one.
    let again = prepare_start_position(
        &fixture.session,
        &connector,
        Some(LogFilePos::new("mysql-bin.000005", 4)),
    )
    .await?;
    assert_eq!(again, explicit);
    Ok(())
}

#[tokio::test]
async fn test_column_count_change_rebuilds_metadata() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let id = TableId::new("app", "t");
    let fixture = TestSession::new(vec![kv_def("app", "t")]);
    // Cache the two-column layout before the table is altered.
    fixture.table(&id).await;
    let mut altered = kv_def("app", "t");
    altered.columns.push(Column::new("w", ColumnType::VarChar));
    fixture.metadata.set_def(altered);

    let mut events = EventBuilder::new("mysql-bin.000001", 4);
    let wide = vec![
        Value::Int(2),
        Value::Bytes(b"b".to_vec()),
        Value::Bytes(b"c".to_vec()),
    ];
    let connector = Arc::new(ScriptedBinlogConnector::from_events([
        events.rows(&id, 2, vec![RawRowChange::insert(kv_image(1, "a"))]),
        events.rows(&id, 3, vec![RawRowChange::insert(wide)]),
    ]));

    tokio::time::timeout(
        TIMEOUT,
        BinlogApplyEngine::new(fixture.session.clone(), test_options(), connector).start(),
    )
    .await??;

    assert_eq!(fixture.metadata.rebuild_count(), 1);
    let table = fixture.table(&id).await;
    assert_eq!(table.column_count(), 3);
    assert_eq!(
        fixture.target.get(&table, &key(2)),
        Some(vec![
            ColumnValue::Int(2),
            ColumnValue::from("b"),
            ColumnValue::from("c")
        ])
    );
    assert!(fixture.target.get(&table, &key(1)).is_some());
    Ok(())
}

#[tokio::test]
async fn test_unexplained_column_count_is_fatal() {
    let id = TableId::new("app", "t");
    let fixture = TestSession::new(vec![kv_def("app", "t")]);

    let mut events = EventBuilder::new("mysql-bin.000001", 4);
    let connector = Arc::new(ScriptedBinlogConnector::from_events([events.rows(
        &id,
        5,
        vec![RawRowChange::insert(vec![Value::Int(1); 5])],
    )]));

    let result = tokio::time::timeout(
        TIMEOUT,
        BinlogApplyEngine::new(fixture.session.clone(), test_options(), connector).start(),
    )
    .await
    .expect("apply did not finish");
    assert!(result.is_err());
}

#[tokio::test]
async fn test_parsing_halts_at_stop_position() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let id = TableId::new("app", "t");
    let fixture = TestSession::new(vec![kv_def("app", "t")]);
    let table = fixture.table(&id).await;

    let mut events = EventBuilder::new("mysql-bin.000001", 4);
    let first = events.rows(&id, 2, vec![RawRowChange::insert(kv_image(1, "a"))]);
    let second = events.rows(&id, 2, vec![RawRowChange::insert(kv_image(2, "b"))]);
    fixture
        .store
        .save_position(TEST_TASK_ID, PositionKind::Stop, second.end())
        .await?;
    let connector =
        Arc::new(ScriptedBinlogConnector::from_events([first, second.clone()]).hold_open());

    let summary = tokio::time::timeout(
        TIMEOUT,
        BinlogApplyEngine::new(fixture.session.clone(), test_options(), connector).start(),
    )
    .await??;

    assert!(summary.reached_stop);
    assert_eq!(summary.events_parsed, 2);
    assert_eq!(summary.parsed.as_ref(), Some(second.end()));
    assert_eq!(fixture.target.rows(&table), vec![kv_row(1, "a"), kv_row(2, "b")]);
    Ok(())
}

#[tokio::test]
async fn test_stream_failure_reconnects_from_last_rows_event() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let id = TableId::new("app", "t");
    let fixture = TestSession::new(vec![kv_def("app", "t")]);
    let table = fixture.table(&id).await;

    let mut events = EventBuilder::new("mysql-bin.000001", 4);
    let header = events.other();
    let first = events.rows(&id, 2, vec![RawRowChange::insert(kv_image(1, "a"))]);
    let second = events.rows(&id, 2, vec![RawRowChange::insert(kv_image(2, "b"))]);
    let connector = Arc::new(ScriptedBinlogConnector::new([
        ScriptStep::Event(header),
        ScriptStep::Event(first.clone()),
        ScriptStep::Fail("connection reset by peer".to_string()),
        ScriptStep::Event(second),
    ]));

    tokio::time::timeout(
        TIMEOUT,
        BinlogApplyEngine::new(fixture.session.clone(), test_options(), connector.clone())
            .start(),
    )
    .await??;

    assert_eq!(
        connector.connects(),
        vec![LogFilePos::new("mysql-bin.000001", 4), resume_of(&first)]
    );
    assert_eq!(fixture.target.rows(&table), vec![kv_row(1, "a"), kv_row(2, "b")]);
    Ok(())
}

#[tokio::test]
async fn test_persistent_stream_failure_is_fatal() {
    let fixture = TestSession::new(vec![kv_def("app", "t")]);
    let connector = Arc::new(ScriptedBinlogConnector::new(
        (0..5).map(|_| ScriptStep::Fail("connection refused".to_string())),
    ));

    let result = tokio::time::timeout(
        TIMEOUT,
        BinlogApplyEngine::new(fixture.session.clone(), test_options(), connector).start(),
    )
    .await
    .expect("apply did not finish");
    assert!(result.is_err());
}

#[tokio::test]
async fn test_events_of_unmigrated_tables_are_skipped() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = TestSession::new(vec![kv_def("app", "t")]);
    let other = TableId::new("app", "audit_log");

    let mut events = EventBuilder::new("mysql-bin.000001", 4);
    let connector = Arc::new(ScriptedBinlogConnector::from_events([
        events.rows(&other, 2, vec![RawRowChange::insert(kv_image(1, "a"))]),
        events.rotate("mysql-bin.000002"),
    ]));

    let summary = BinlogApplyEngine::new(fixture.session.clone(), test_options(), connector)
        .start()
        .await?;
    assert_eq!(summary.events_parsed, 2);
    assert_eq!(summary.operations_applied, 0);
    assert_eq!(summary.parsed, Some(LogFilePos::new("mysql-bin.000002", 4)));
    assert!(fixture.target.operations().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_applied_position_never_moves_backwards() -> Result<(), Box<dyn std::error::Error>> {
    let id = TableId::new("app", "t");
    let fixture = TestSession::new(vec![kv_def("app", "t")]);

    let mut events = EventBuilder::new("mysql-bin.000001", 4);
    let mut script = Vec::new();
    for i in 0..200 {
        script.push(events.rows(
            &id,
            2,
            vec![
                RawRowChange::insert(kv_image(i, "a")),
                RawRowChange::update(kv_image(i, "a"), kv_image(i, "b")),
            ],
        ));
        if i % 50 == 49 {
            script.push(events.rotate(format!("mysql-bin.{:06}", 2 + i / 50)));
        }
    }
    let connector = Arc::new(ScriptedBinlogConnector::from_events(script));

    let engine = BinlogApplyEngine::new(fixture.session.clone(), test_options(), connector);
    let mut snapshots = engine.subscribe();
    let observer = tokio::spawn(async move {
        let mut seen = Vec::new();
        while snapshots.changed().await.is_ok() {
            if let Some(applied) = snapshots.borrow_and_update().applied.clone() {
                seen.push(applied);
            }
        }
        seen
    });

    let summary = tokio::time::timeout(TIMEOUT, engine.start()).await??;
    assert_eq!(summary.operations_applied, 400);
    let seen = tokio::time::timeout(TIMEOUT, observer).await??;
    assert!(!seen.is_empty());
    for pair in seen.windows(2) {
        assert!(pair[1] >= pair[0], "{} after {}", pair[1], pair[0]);
    }
    Ok(())
}

#[tokio::test]
async fn test_replayed_events_leave_target_unchanged() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let id = TableId::new("app", "t");
    let fixture = TestSession::new(vec![kv_def("app", "t")]);
    let table = fixture.table(&id).await;

    let mut events = EventBuilder::new("mysql-bin.000001", 4);
    let script = vec![
        events.rows(
            &id,
            2,
            vec![
                RawRowChange::insert(kv_image(1, "a")),
                RawRowChange::insert(kv_image(2, "b")),
                RawRowChange::insert(kv_image(3, "c")),
            ],
        ),
        events.rows(
            &id,
            2,
            vec![RawRowChange::update(kv_image(1, "a"), kv_image(1, "a2"))],
        ),
        events.rows(
            &id,
            2,
            vec![RawRowChange::update(kv_image(3, "c"), kv_image(7, "c"))],
        ),
        events.rows(&id, 2, vec![RawRowChange::delete(kv_image(2, "b"))]),
        events.rows(&id, 2, vec![RawRowChange::insert(kv_image(2, "b2"))]),
    ];

    let connector = Arc::new(ScriptedBinlogConnector::from_events(script.clone()));
    BinlogApplyEngine::new(fixture.session.clone(), test_options(), connector)
        .start()
        .await?;
    let once = fixture.target.rows(&table);
    assert_eq!(once, vec![kv_row(1, "a2"), kv_row(2, "b2"), kv_row(7, "c")]);

    // Restarting from an earlier coordinate applies the same events again.
    for from in [0, 2] {
        let resume = resume_of(&script[from]);
        fixture
            .store
            .save_position(TEST_TASK_ID, PositionKind::Applied, &resume)
            .await?;
        let replay = Arc::new(ScriptedBinlogConnector::from_events(
            script[from..].to_vec(),
        ));
        let summary =
            BinlogApplyEngine::new(fixture.session.clone(), test_options(), replay.clone())
                .start()
                .await?;

        assert_eq!(replay.connects(), vec![resume]);
        assert_eq!(summary.events_parsed, (script.len() - from) as u64);
        assert_eq!(fixture.target.rows(&table), once);
    }
    Ok(())
}
