//! Replication client built on `mysql_async`'s binlog stream.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use mysql_async::binlog::events::EventData;
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::prelude::Queryable;
use mysql_async::{BinlogStream, BinlogStreamRequest, Pool, Row, Value};
use sync_core::{LogFilePos, TableId};
use tracing::{debug, info};

use crate::event::{BinlogEvent, RawRowChange, RowsEvent};
use crate::source::{BinlogConnector, BinlogSource};

/// Read the server's current binlog coordinate.
///
/// MySQL 8.4 removed `SHOW MASTER STATUS` in favour of
/// `SHOW BINARY LOG STATUS`; both are tried.
pub async fn show_master_status(conn: &mut mysql_async::Conn) -> Result<LogFilePos> {
    let row: Option<Row> = match conn.query_first("SHOW MASTER STATUS").await {
        Ok(row) => row,
        Err(_) => conn
            .query_first("SHOW BINARY LOG STATUS")
            .await
            .context("Failed to read binary log status")?,
    };
    let row = row.ok_or_else(|| anyhow!("Binary logging is not enabled on the server"))?;
    let file: String = row
        .get(0)
        .ok_or_else(|| anyhow!("Binary log status has no file column"))?;
    let pos: u64 = row
        .get(1)
        .ok_or_else(|| anyhow!("Binary log status has no position column"))?;
    Ok(LogFilePos::new(file, pos))
}

/// Tracks the current log file and the start of the table-map run that
/// precedes each rows event.
#[derive(Debug, Clone)]
pub struct PositionTracker {
    file: String,
    table_map_start: Option<u64>,
    last_was_table_map: bool,
}

impl PositionTracker {
    pub fn new(from: &LogFilePos) -> Self {
        Self {
            file: from.file.clone(),
            table_map_start: None,
            last_was_table_map: false,
        }
    }

    pub fn rotate(&mut self, next: &LogFilePos) {
        self.file = next.file.clone();
        self.table_map_start = None;
        self.last_was_table_map = false;
    }

    pub fn table_map(&mut self, start: u64) {
        if !self.last_was_table_map {
            self.table_map_start = Some(start);
        }
        self.last_was_table_map = true;
    }

    /// Resume coordinate for a rows event starting at `start`.
    pub fn rows(&mut self, start: u64) -> LogFilePos {
        self.last_was_table_map = false;
        LogFilePos::new(self.file.clone(), self.table_map_start.unwrap_or(start))
    }

    pub fn other(&mut self) {
        self.last_was_table_map = false;
        self.table_map_start = None;
    }

    pub fn at(&self, pos: u64) -> LogFilePos {
        LogFilePos::new(self.file.clone(), pos)
    }
}

/// Opens binlog streams with a fixed replica server id.
pub struct MySqlBinlogConnector {
    pool: Pool,
    server_id: u32,
    tables: Option<Arc<HashSet<TableId>>>,
}

impl MySqlBinlogConnector {
    pub fn new(pool: Pool, server_id: u32) -> Self {
        Self {
            pool,
            server_id,
            tables: None,
        }
    }

    /// Only decode row events of these tables; others are passed through
    /// as position-only events.
    pub fn with_tables(mut self, tables: HashSet<TableId>) -> Self {
        self.tables = Some(Arc::new(tables));
        self
    }
}

#[async_trait]
impl BinlogConnector for MySqlBinlogConnector {
    async fn connect(&self, from: &LogFilePos) -> Result<Box<dyn BinlogSource>> {
        let conn = self
            .pool
            .get_conn()
            .await
            .context("Failed to connect to source for replication")?;
        let request = BinlogStreamRequest::new(self.server_id)
            .with_filename(from.file.as_bytes())
            .with_pos(from.pos);
        let stream = conn
            .get_binlog_stream(request)
            .await
            .with_context(|| format!("Failed to start binlog stream at {from}"))?;
        info!("Binlog stream opened at {from} (server id {})", self.server_id);

        Ok(Box::new(MySqlBinlogSource {
            stream,
            tracker: PositionTracker::new(from),
            tables: self.tables.clone(),
        }))
    }

    async fn current_position(&self) -> Result<LogFilePos> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .context("Failed to connect to source")?;
        show_master_status(&mut conn).await
    }
}

struct MySqlBinlogSource {
    stream: BinlogStream,
    tracker: PositionTracker,
    tables: Option<Arc<HashSet<TableId>>>,
}

fn binlog_value(value: BinlogValue<'static>) -> Result<Value> {
    match value {
        BinlogValue::Value(v) => Ok(v),
        BinlogValue::Jsonb(doc) => {
            let json = serde_json::Value::try_from(doc)
                .map_err(|e| anyhow!("Invalid JSON document in row image: {e}"))?;
            Ok(Value::Bytes(json.to_string().into_bytes()))
        }
        BinlogValue::JsonDiff(_) => {
            bail!("Partial JSON updates are not supported; set binlog_row_value_options=''")
        }
    }
}

fn row_values(row: Option<BinlogRow>) -> Result<Option<Vec<Value>>> {
    row.map(|r| r.unwrap().into_iter().map(binlog_value).collect())
        .transpose()
}

impl MySqlBinlogSource {
    fn wanted(&self, table: &TableId) -> bool {
        self.tables.as_ref().map_or(true, |t| t.contains(table))
    }
}

#[async_trait]
impl BinlogSource for MySqlBinlogSource {
    async fn next_event(&mut self) -> Result<Option<BinlogEvent>> {
        loop {
            let Some(event) = self.stream.next().await else {
                return Ok(None);
            };
            let event = event.context("Failed to read binlog event")?;

            let end = event.header().log_pos() as u64;
            let start = end.saturating_sub(event.header().event_size() as u64);
            let data = event
                .read_data()
                .context("Failed to decode binlog event")?;

            match data {
                Some(EventData::RotateEvent(rotate)) => {
                    let next = LogFilePos::new(rotate.name().to_string(), rotate.position());
                    self.tracker.rotate(&next);
                    debug!("Binlog rotated to {next}");
                    return Ok(Some(BinlogEvent::Rotate { next }));
                }
                Some(EventData::TableMapEvent(_)) => {
                    self.tracker.table_map(start);
                }
                Some(EventData::RowsEvent(rows_data)) => {
                    let resume = self.tracker.rows(start);
                    let end = self.tracker.at(end);
                    let tme = self
                        .stream
                        .get_tme(rows_data.table_id())
                        .ok_or_else(|| anyhow!("Rows event at {end} without a table map"))?;
                    let table = TableId::new(
                        tme.database_name().to_string(),
                        tme.table_name().to_string(),
                    );
                    if !self.wanted(&table) {
                        return Ok(Some(BinlogEvent::Other { end }));
                    }
                    let column_count = tme.columns_count() as usize;

                    let mut rows = Vec::new();
                    for row in rows_data.rows(tme) {
                        let (before, after) =
                            row.with_context(|| format!("Failed to decode rows of {table}"))?;
                        rows.push(RawRowChange {
                            before: row_values(before)?,
                            after: row_values(after)?,
                        });
                    }

                    return Ok(Some(BinlogEvent::Rows(RowsEvent {
                        resume,
                        end,
                        table,
                        column_count,
                        rows,
                    })));
                }
                _ => {
                    self.tracker.other();
                    // Artificial events carry no position
                    if end > 0 {
                        return Ok(Some(BinlogEvent::Other {
                            end: self.tracker.at(end),
                        }));
                    }
                }
            }
        }
    }
}
