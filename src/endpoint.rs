//! Data access to one side of the migration.
//!
//! Every engine talks to the source and the target through [`Endpoint`].
//! Rows cross this boundary full-width in source column order (ignored
//! columns read back as NULL), whichever side they came from.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::Pool;
use mysql_types::{decode_row, key_params, range_params, to_params};
use sync_core::{Column, KeyValue, LogFilePos, Row, Side, Table};

use crate::config::WriteMode;

/// `COUNT(*)` and the XOR of per-row checksums over a key range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RangeChecksum {
    pub count: u64,
    pub checksum: u64,
}

/// Whether a boundary lookup may return the key it starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStart {
    /// Keys at or after `from`.
    Including,
    /// Keys strictly after `from`.
    After,
}

#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Registry key of the instance, `host:port`.
    fn name(&self) -> &str;

    /// Which side of each table this endpoint reads and writes.
    fn side(&self) -> Side;

    async fn first_key(&self, table: &Table) -> Result<Option<KeyValue>>;

    async fn last_key(&self, table: &Table) -> Result<Option<KeyValue>>;

    /// Last of the next `batch_size` keys starting from `from` and not past
    /// `until`, in the instance's own key order; `None` when there are none.
    async fn next_boundary(
        &self,
        table: &Table,
        from: &KeyValue,
        until: &KeyValue,
        start: ScanStart,
    ) -> Result<Option<KeyValue>>;

    /// Rows with `min <= key <= max`, in key order.
    async fn select_range_rows(
        &self,
        table: &Table,
        min: &KeyValue,
        max: &KeyValue,
    ) -> Result<Vec<Row>>;

    /// Keys with `min <= key <= max`, in key order.
    async fn range_keys(&self, table: &Table, min: &KeyValue, max: &KeyValue)
        -> Result<Vec<KeyValue>>;

    async fn insert_rows(&self, table: &Table, rows: &[Row], mode: WriteMode) -> Result<()>;

    async fn replace_row(&self, table: &Table, row: &Row) -> Result<()>;

    async fn delete_row(&self, table: &Table, key: &KeyValue) -> Result<()>;

    async fn range_checksum(
        &self,
        table: &Table,
        min: &KeyValue,
        max: &KeyValue,
    ) -> Result<RangeChecksum>;

    /// Checksum of one row; `None` when the row does not exist.
    async fn row_checksum(&self, table: &Table, key: &KeyValue) -> Result<Option<u64>>;

    async fn select_row(&self, table: &Table, key: &KeyValue) -> Result<Option<Row>>;

    /// The instance's own current binlog coordinate.
    async fn master_status(&self) -> Result<LogFilePos>;
}

/// [`Endpoint`] over a `mysql_async` pool.
pub struct MySqlEndpoint {
    name: String,
    pool: Pool,
    side: Side,
}

impl MySqlEndpoint {
    pub fn new(name: impl Into<String>, pool: Pool, side: Side) -> Self {
        Self {
            name: name.into(),
            pool,
            side,
        }
    }

    async fn conn(&self) -> Result<mysql_async::Conn> {
        self.pool
            .get_conn()
            .await
            .with_context(|| format!("Failed to connect to {} ({})", self.name, self.side))
    }

    fn key_columns(&self, table: &Table) -> Vec<Column> {
        let columns = table.columns(self.side);
        table
            .key_positions()
            .iter()
            .map(|&i| columns[i].clone())
            .collect()
    }

    fn useful_columns(&self, table: &Table) -> Vec<Column> {
        let columns = table.columns(self.side);
        table.useful().iter().map(|&i| columns[i].clone()).collect()
    }

    fn decode_key(&self, table: &Table, row: mysql_async::Row) -> Result<KeyValue> {
        let values = decode_row(row.unwrap(), &self.key_columns(table))
            .with_context(|| format!("Failed to decode key of {}", table.name(self.side)))?;
        Ok(table.key_from_values(values))
    }

    fn decode_useful(&self, table: &Table, row: mysql_async::Row) -> Result<Row> {
        let values = decode_row(row.unwrap(), &self.useful_columns(table))
            .with_context(|| format!("Failed to decode row of {}", table.name(self.side)))?;
        Ok(table.row_from_useful(values))
    }

    async fn single_key(&self, table: &Table, sql: &str) -> Result<Option<KeyValue>> {
        let mut conn = self.conn().await?;
        let row: Option<mysql_async::Row> = conn
            .query_first(sql)
            .await
            .with_context(|| format!("Key lookup on {} failed", table.name(self.side)))?;
        row.map(|r| self.decode_key(table, r)).transpose()
    }
}

#[async_trait]
impl Endpoint for MySqlEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn side(&self) -> Side {
        self.side
    }

    async fn first_key(&self, table: &Table) -> Result<Option<KeyValue>> {
        self.single_key(table, &table.sql(self.side).select_first_key)
            .await
    }

    async fn last_key(&self, table: &Table) -> Result<Option<KeyValue>> {
        self.single_key(table, &table.sql(self.side).select_last_key)
            .await
    }

    async fn next_boundary(
        &self,
        table: &Table,
        from: &KeyValue,
        until: &KeyValue,
        start: ScanStart,
    ) -> Result<Option<KeyValue>> {
        let sql = table.sql(self.side);
        let statement = match start {
            ScanStart::Including => &sql.select_next_batch,
            ScanStart::After => &sql.select_batch_after,
        };
        let mut conn = self.conn().await?;
        let rows: Vec<mysql_async::Row> = conn
            .exec(statement, range_params(from, until))
            .await
            .with_context(|| format!("Next batch lookup on {} failed", table.name(self.side)))?;
        rows.into_iter()
            .last()
            .map(|r| self.decode_key(table, r))
            .transpose()
    }

    async fn select_range_rows(
        &self,
        table: &Table,
        min: &KeyValue,
        max: &KeyValue,
    ) -> Result<Vec<Row>> {
        let mut conn = self.conn().await?;
        let rows: Vec<mysql_async::Row> = conn
            .exec(&table.sql(self.side).select_range_rows, range_params(min, max))
            .await
            .with_context(|| format!("Range select on {} failed", table.name(self.side)))?;
        rows.into_iter()
            .map(|r| self.decode_useful(table, r))
            .collect()
    }

    async fn range_keys(
        &self,
        table: &Table,
        min: &KeyValue,
        max: &KeyValue,
    ) -> Result<Vec<KeyValue>> {
        let mut conn = self.conn().await?;
        let rows: Vec<mysql_async::Row> = conn
            .exec(&table.sql(self.side).select_range_keys, range_params(min, max))
            .await
            .with_context(|| format!("Key scan on {} failed", table.name(self.side)))?;
        rows.into_iter()
            .map(|r| self.decode_key(table, r))
            .collect()
    }

    async fn insert_rows(&self, table: &Table, rows: &[Row], mode: WriteMode) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let sql = table.sql(self.side);
        let mut conn = self.conn().await?;
        for chunk in rows.chunks(table.batch_size().max(1)) {
            let statement = match mode {
                WriteMode::InsertIgnore => sql.insert_ignore(chunk.len()),
                WriteMode::Replace => sql.replace_rows(chunk.len()),
            };
            let values: Vec<_> = chunk.iter().flat_map(|r| table.project_useful(r)).collect();
            conn.exec_drop(statement, to_params(&values))
                .await
                .with_context(|| {
                    format!(
                        "Writing {} rows into {} failed",
                        chunk.len(),
                        table.name(self.side)
                    )
                })?;
        }
        Ok(())
    }

    async fn replace_row(&self, table: &Table, row: &Row) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.exec_drop(
            &table.sql(self.side).replace_one,
            to_params(&table.project_useful(row)),
        )
        .await
        .with_context(|| format!("Replace into {} failed", table.name(self.side)))
    }

    async fn delete_row(&self, table: &Table, key: &KeyValue) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.exec_drop(&table.sql(self.side).delete_by_key, key_params(key))
            .await
            .with_context(|| format!("Delete {key} from {} failed", table.name(self.side)))
    }

    async fn range_checksum(
        &self,
        table: &Table,
        min: &KeyValue,
        max: &KeyValue,
    ) -> Result<RangeChecksum> {
        let mut conn = self.conn().await?;
        let row: Option<(u64, u64)> = conn
            .exec_first(&table.sql(self.side).select_range_checksum, range_params(min, max))
            .await
            .with_context(|| format!("Range checksum on {} failed", table.name(self.side)))?;
        let (count, checksum) = row.ok_or_else(|| anyhow!("Range checksum returned no row"))?;
        Ok(RangeChecksum { count, checksum })
    }

    async fn row_checksum(&self, table: &Table, key: &KeyValue) -> Result<Option<u64>> {
        let mut conn = self.conn().await?;
        conn.exec_first(&table.sql(self.side).select_row_checksum, key_params(key))
            .await
            .with_context(|| format!("Row checksum of {key} on {} failed", table.name(self.side)))
    }

    async fn select_row(&self, table: &Table, key: &KeyValue) -> Result<Option<Row>> {
        let mut conn = self.conn().await?;
        let row: Option<mysql_async::Row> = conn
            .exec_first(&table.sql(self.side).select_row, key_params(key))
            .await
            .with_context(|| format!("Select {key} from {} failed", table.name(self.side)))?;
        row.map(|r| self.decode_useful(table, r)).transpose()
    }

    async fn master_status(&self) -> Result<LogFilePos> {
        let mut conn = self.conn().await?;
        mysql_migrate_binlog_source::show_master_status(&mut conn)
            .await
            .with_context(|| format!("Failed to read binlog position of {}", self.name))
    }
}
