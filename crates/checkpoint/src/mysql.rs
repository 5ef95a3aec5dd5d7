//! MySQL-backed progress storage.
//!
//! Tables are created on open if they do not exist:
//!
//! - `migrate_table_progress`: per-table row-copy cursor
//! - `migrate_binlog_position`: start/parse/applied/stop coordinates per task
//! - `migrate_rollback_position`: the target's own binlog position per task
//! - `migrate_checksum_diff`: range mismatches found by checksumming

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mysql_async::prelude::Queryable;
use mysql_async::Pool;
use sync_core::{KeyValue, LogFilePos, TableId};

use crate::records::{BinlogProgress, DiffRecord, NewDiff, PositionKind, TableProgress};
use crate::store::ProgressStore;

const CREATE_TABLES: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS migrate_table_progress (
        task_id VARCHAR(128) NOT NULL,
        source_schema VARCHAR(64) NOT NULL,
        source_table VARCHAR(64) NOT NULL,
        row_copy_complete TINYINT(1) NOT NULL DEFAULT 0,
        max_id_value TEXT NULL,
        curr_id_value TEXT NULL,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
        PRIMARY KEY (task_id, source_schema, source_table)
    )",
    "CREATE TABLE IF NOT EXISTS migrate_binlog_position (
        task_id VARCHAR(128) NOT NULL PRIMARY KEY,
        start_log_file VARCHAR(255) NULL,
        start_log_pos BIGINT UNSIGNED NULL,
        parse_log_file VARCHAR(255) NULL,
        parse_log_pos BIGINT UNSIGNED NULL,
        applied_log_file VARCHAR(255) NULL,
        applied_log_pos BIGINT UNSIGNED NULL,
        stop_log_file VARCHAR(255) NULL,
        stop_log_pos BIGINT UNSIGNED NULL,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS migrate_rollback_position (
        task_id VARCHAR(128) NOT NULL,
        target_endpoint VARCHAR(255) NOT NULL,
        log_file VARCHAR(255) NOT NULL,
        log_pos BIGINT UNSIGNED NOT NULL,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
        PRIMARY KEY (task_id, target_endpoint)
    )",
    "CREATE TABLE IF NOT EXISTS migrate_checksum_diff (
        id BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY,
        task_id VARCHAR(128) NOT NULL,
        source_schema VARCHAR(64) NOT NULL,
        source_table VARCHAR(64) NOT NULL,
        target_schema VARCHAR(64) NOT NULL,
        target_table VARCHAR(64) NOT NULL,
        min_id_value TEXT NOT NULL,
        max_id_value TEXT NOT NULL,
        is_fix TINYINT(1) NOT NULL DEFAULT 0,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
        KEY idx_task_fix (task_id, is_fix)
    )",
];

const DIFF_COLUMNS: &str = "id, task_id, source_schema, source_table, target_schema, target_table, \
     min_id_value, max_id_value, is_fix, UNIX_TIMESTAMP(created_at), UNIX_TIMESTAMP(updated_at)";

type DiffRow = (
    u64,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    u8,
    i64,
    i64,
);

/// Progress store in a MySQL schema.
pub struct MySqlStore {
    pool: Pool,
}

impl MySqlStore {
    /// Connect and create the progress tables if needed.
    pub async fn open(connection_string: &str) -> Result<Self> {
        let pool = Pool::from_url(connection_string)
            .context("Invalid progress store connection string")?;
        let mut conn = pool
            .get_conn()
            .await
            .context("Failed to connect to progress store")?;
        for statement in CREATE_TABLES {
            conn.query_drop(statement)
                .await
                .context("Failed to create progress tables")?;
        }
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<mysql_async::Conn> {
        self.pool
            .get_conn()
            .await
            .context("Failed to get progress store connection")
    }
}

fn encode_key(key: &Option<KeyValue>) -> Result<Option<String>> {
    key.as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("Failed to encode key value")
}

fn decode_key(text: Option<String>) -> Result<Option<KeyValue>> {
    text.map(|t| serde_json::from_str(&t))
        .transpose()
        .context("Failed to decode key value")
}

fn position(file: Option<String>, pos: Option<u64>) -> Option<LogFilePos> {
    match (file, pos) {
        (Some(file), Some(pos)) => Some(LogFilePos::new(file, pos)),
        _ => None,
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn diff_from_row(row: DiffRow) -> Result<DiffRecord> {
    let (
        id,
        task_id,
        source_schema,
        source_table,
        target_schema,
        target_table,
        min_id_value,
        max_id_value,
        is_fix,
        created_at,
        updated_at,
    ) = row;
    Ok(DiffRecord {
        id,
        task_id,
        source: TableId::new(source_schema, source_table),
        target: TableId::new(target_schema, target_table),
        min_id_value: serde_json::from_str(&min_id_value)
            .with_context(|| format!("Diff {id}: invalid min_id_value"))?,
        max_id_value: serde_json::from_str(&max_id_value)
            .with_context(|| format!("Diff {id}: invalid max_id_value"))?,
        is_fix: is_fix != 0,
        created_at: timestamp(created_at),
        updated_at: timestamp(updated_at),
    })
}

#[async_trait]
impl ProgressStore for MySqlStore {
    async fn load_table(&self, task_id: &str, table: &TableId) -> Result<Option<TableProgress>> {
        let mut conn = self.conn().await?;
        let row: Option<(u8, Option<String>, Option<String>)> = conn
            .exec_first(
                "SELECT row_copy_complete, max_id_value, curr_id_value
                 FROM migrate_table_progress
                 WHERE task_id = ? AND source_schema = ? AND source_table = ?",
                (task_id, &table.schema, &table.table),
            )
            .await
            .with_context(|| format!("Failed to load progress of {table}"))?;

        row.map(|(complete, max, curr)| {
            Ok(TableProgress {
                row_copy_complete: complete != 0,
                max_id_value: decode_key(max)?,
                curr_id_value: decode_key(curr)?,
            })
        })
        .transpose()
    }

    async fn save_table(
        &self,
        task_id: &str,
        table: &TableId,
        progress: &TableProgress,
    ) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.exec_drop(
            "INSERT INTO migrate_table_progress
                (task_id, source_schema, source_table, row_copy_complete, max_id_value, curr_id_value)
             VALUES (?, ?, ?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE
                row_copy_complete = VALUES(row_copy_complete),
                max_id_value = VALUES(max_id_value),
                curr_id_value = VALUES(curr_id_value)",
            (
                task_id,
                &table.schema,
                &table.table,
                progress.row_copy_complete as u8,
                encode_key(&progress.max_id_value)?,
                encode_key(&progress.curr_id_value)?,
            ),
        )
        .await
        .with_context(|| format!("Failed to save progress of {table}"))
    }

    async fn load_positions(&self, task_id: &str) -> Result<BinlogProgress> {
        let mut conn = self.conn().await?;
        type PositionRow = (
            Option<String>,
            Option<u64>,
            Option<String>,
            Option<u64>,
            Option<String>,
            Option<u64>,
            Option<String>,
            Option<u64>,
        );
        let row: Option<PositionRow> = conn
            .exec_first(
                "SELECT start_log_file, start_log_pos, parse_log_file, parse_log_pos,
                        applied_log_file, applied_log_pos, stop_log_file, stop_log_pos
                 FROM migrate_binlog_position WHERE task_id = ?",
                (task_id,),
            )
            .await
            .context("Failed to load binlog positions")?;

        Ok(match row {
            Some((sf, sp, pf, pp, af, ap, tf, tp)) => BinlogProgress {
                start: position(sf, sp),
                parsed: position(pf, pp),
                applied: position(af, ap),
                stop: position(tf, tp),
            },
            None => BinlogProgress::default(),
        })
    }

    async fn save_position(
        &self,
        task_id: &str,
        kind: PositionKind,
        pos: &LogFilePos,
    ) -> Result<()> {
        let prefix = kind.column_prefix();
        let query = format!(
            "INSERT INTO migrate_binlog_position (task_id, {prefix}_log_file, {prefix}_log_pos)
             VALUES (?, ?, ?)
             ON DUPLICATE KEY UPDATE
                {prefix}_log_file = VALUES({prefix}_log_file),
                {prefix}_log_pos = VALUES({prefix}_log_pos)"
        );
        let mut conn = self.conn().await?;
        conn.exec_drop(query, (task_id, &pos.file, pos.pos))
            .await
            .with_context(|| format!("Failed to save {kind} position"))
    }

    async fn save_rollback_position(
        &self,
        task_id: &str,
        target: &str,
        pos: &LogFilePos,
    ) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.exec_drop(
            "INSERT INTO migrate_rollback_position (task_id, target_endpoint, log_file, log_pos)
             VALUES (?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE log_file = VALUES(log_file), log_pos = VALUES(log_pos)",
            (task_id, target, &pos.file, pos.pos),
        )
        .await
        .context("Failed to save rollback position")
    }

    async fn load_rollback_position(
        &self,
        task_id: &str,
        target: &str,
    ) -> Result<Option<LogFilePos>> {
        let mut conn = self.conn().await?;
        let row: Option<(String, u64)> = conn
            .exec_first(
                "SELECT log_file, log_pos FROM migrate_rollback_position
                 WHERE task_id = ? AND target_endpoint = ?",
                (task_id, target),
            )
            .await
            .context("Failed to load rollback position")?;
        Ok(row.map(|(file, pos)| LogFilePos::new(file, pos)))
    }

    async fn insert_diff(&self, task_id: &str, diff: NewDiff) -> Result<u64> {
        let mut conn = self.conn().await?;
        conn.exec_drop(
            "INSERT INTO migrate_checksum_diff
                (task_id, source_schema, source_table, target_schema, target_table,
                 min_id_value, max_id_value)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            (
                task_id,
                &diff.source.schema,
                &diff.source.table,
                &diff.target.schema,
                &diff.target.table,
                serde_json::to_string(&diff.min_id_value)?,
                serde_json::to_string(&diff.max_id_value)?,
            ),
        )
        .await
        .context("Failed to record checksum diff")?;
        conn.last_insert_id()
            .ok_or_else(|| anyhow!("No id returned for checksum diff"))
    }

    async fn unfixed_diffs(&self, task_id: &str, limit: usize) -> Result<Vec<DiffRecord>> {
        let mut conn = self.conn().await?;
        let rows: Vec<DiffRow> = conn
            .exec(
                format!(
                    "SELECT {DIFF_COLUMNS} FROM migrate_checksum_diff
                     WHERE task_id = ? AND is_fix = 0 ORDER BY id LIMIT {limit}"
                ),
                (task_id,),
            )
            .await
            .context("Failed to load unfixed checksum diffs")?;
        rows.into_iter().map(diff_from_row).collect()
    }

    async fn mark_diff_fixed(&self, task_id: &str, id: u64) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.exec_drop(
            "UPDATE migrate_checksum_diff SET is_fix = 1 WHERE task_id = ? AND id = ?",
            (task_id, id),
        )
        .await
        .with_context(|| format!("Failed to mark diff {id} fixed"))
    }

    async fn list_diffs(&self, task_id: &str) -> Result<Vec<DiffRecord>> {
        let mut conn = self.conn().await?;
        let rows: Vec<DiffRow> = conn
            .exec(
                format!("SELECT {DIFF_COLUMNS} FROM migrate_checksum_diff WHERE task_id = ? ORDER BY id"),
                (task_id,),
            )
            .await
            .context("Failed to list checksum diffs")?;
        rows.into_iter().map(diff_from_row).collect()
    }
}
