//! In-memory collaborators for driving the engines without MySQL.
//!
//! [`TestSession`] wires a [`MemoryEndpoint`] per side, a
//! [`StaticMetadataProvider`] and a `MemoryStore` into a [`Session`].

mod binlog;
mod memory_endpoint;
mod metadata;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use checkpoint::MemoryStore;
use sync_core::{Column, ColumnType, ColumnValue, KeyValue, Row, Side, Table, TableDef, TableId};

pub use binlog::{kv_image, EventBuilder, ScriptStep, ScriptedBinlogConnector};
pub use memory_endpoint::{row_hash, MemoryEndpoint};
pub use metadata::StaticMetadataProvider;

use crate::config::EngineOptions;
use crate::retry::RetryPolicy;
use crate::session::Session;

pub const TEST_TASK_ID: &str = "test-task";

/// Definition of `schema.table(id BIGINT PRIMARY KEY, v VARCHAR)`.
pub fn kv_def(schema: &str, table: &str) -> TableDef {
    TableDef {
        source: TableId::new(schema, table),
        target: TableId::new(schema, table),
        columns: vec![
            Column::new("id", ColumnType::BigInt).not_null(),
            Column::new("v", ColumnType::VarChar),
        ],
        column_map: HashMap::new(),
        key_columns: vec!["id".to_string()],
        unique_columns: vec!["id".to_string()],
        ignored_columns: Vec::new(),
    }
}

pub fn kv_table(schema: &str, table: &str, batch_size: usize) -> Table {
    match Table::new(kv_def(schema, table), batch_size, 1) {
        Ok(table) => table,
        Err(e) => panic!("invalid test table: {e}"),
    }
}

pub fn kv_row(id: i64, v: &str) -> Row {
    vec![ColumnValue::Int(id), ColumnValue::from(v)]
}

pub fn key(id: i64) -> KeyValue {
    KeyValue::from_parts(["id"], vec![ColumnValue::Int(id)])
}

/// Engine options sized for tests: small queues, short intervals.
pub fn test_options() -> EngineOptions {
    EngineOptions {
        copy_parallelism: 3,
        apply_parallelism: 3,
        checksum_parallelism: 2,
        fix_parallelism: 2,
        queue_capacity: 4,
        checkpoint_interval: Duration::from_millis(10),
        stop_poll_interval: Duration::from_millis(10),
        retry: RetryPolicy::new(3, Duration::from_millis(1)),
        ..EngineOptions::default()
    }
}

pub struct TestSession {
    pub session: Session,
    pub source: Arc<MemoryEndpoint>,
    pub target: Arc<MemoryEndpoint>,
    pub metadata: Arc<StaticMetadataProvider>,
    pub store: Arc<MemoryStore>,
}

impl TestSession {
    pub fn new(defs: Vec<TableDef>) -> Self {
        Self::with_batch_size(defs, 100)
    }

    pub fn with_batch_size(defs: Vec<TableDef>, batch_size: usize) -> Self {
        let tables = defs.iter().map(|d| d.source.clone()).collect();
        let source = Arc::new(MemoryEndpoint::new("source:3306", Side::Source));
        let target = Arc::new(MemoryEndpoint::new("target:3306", Side::Target));
        let metadata = Arc::new(StaticMetadataProvider::new(defs, batch_size));
        let store = Arc::new(MemoryStore::new());
        let session = Session {
            task_id: TEST_TASK_ID.to_string(),
            source: source.clone(),
            target: target.clone(),
            metadata: metadata.clone(),
            store: store.clone(),
            tables,
            retry: RetryPolicy::new(3, Duration::from_millis(1)),
        };
        Self {
            session,
            source,
            target,
            metadata,
            store,
        }
    }

    pub async fn table(&self, id: &TableId) -> Arc<Table> {
        match self.session.metadata.resolve(id).await {
            Ok(table) => table,
            Err(e) => panic!("table {id} is not configured: {e}"),
        }
    }
}
