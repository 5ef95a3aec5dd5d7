//! Durable progress store trait.
//!
//! Everything a task needs to resume lives behind [`ProgressStore`]: per-table
//! row-copy cursors, binlog coordinates, the target's rollback reference and
//! the checksum diff records.

use anyhow::Result;
use async_trait::async_trait;
use sync_core::{LogFilePos, TableId};

use crate::records::{BinlogProgress, DiffRecord, NewDiff, PositionKind, TableProgress};

/// Trait for progress storage operations.
///
/// Implemented by:
/// - `MemoryStore` (tests and dry runs)
/// - `FilesystemStore` (one JSON document)
/// - `MySqlStore` (tables in a MySQL schema)
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Row-copy progress of a table; `None` if nothing was stored yet.
    async fn load_table(&self, task_id: &str, table: &TableId) -> Result<Option<TableProgress>>;

    /// Replace the row-copy progress of a table.
    async fn save_table(
        &self,
        task_id: &str,
        table: &TableId,
        progress: &TableProgress,
    ) -> Result<()>;

    /// All binlog coordinates of a task.
    async fn load_positions(&self, task_id: &str) -> Result<BinlogProgress>;

    /// Store one binlog coordinate of a task.
    async fn save_position(&self, task_id: &str, kind: PositionKind, pos: &LogFilePos)
        -> Result<()>;

    /// Store the target's own binlog position as the rollback reference.
    async fn save_rollback_position(
        &self,
        task_id: &str,
        target: &str,
        pos: &LogFilePos,
    ) -> Result<()>;

    async fn load_rollback_position(&self, task_id: &str, target: &str)
        -> Result<Option<LogFilePos>>;

    /// Record a mismatch; returns the new record's id.
    async fn insert_diff(&self, task_id: &str, diff: NewDiff) -> Result<u64>;

    /// Up to `limit` unfixed records of a task, oldest first.
    async fn unfixed_diffs(&self, task_id: &str, limit: usize) -> Result<Vec<DiffRecord>>;

    /// Flip a record's fixed flag.
    async fn mark_diff_fixed(&self, task_id: &str, id: u64) -> Result<()>;

    /// Every record of a task, fixed or not.
    async fn list_diffs(&self, task_id: &str) -> Result<Vec<DiffRecord>>;
}
