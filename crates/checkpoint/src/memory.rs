//! In-memory progress store, and the document layout shared with the
//! filesystem store.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sync_core::{LogFilePos, TableId};

use crate::records::{BinlogProgress, DiffRecord, NewDiff, PositionKind, TableProgress};
use crate::store::ProgressStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableEntry {
    task_id: String,
    table: TableId,
    progress: TableProgress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RollbackEntry {
    task_id: String,
    target: String,
    position: LogFilePos,
}

/// The whole store as one serializable value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ProgressDocument {
    tables: Vec<TableEntry>,
    positions: BTreeMap<String, BinlogProgress>,
    rollback: Vec<RollbackEntry>,
    diffs: Vec<DiffRecord>,
    next_diff_id: u64,
}

impl ProgressDocument {
    pub(crate) fn load_table(&self, task_id: &str, table: &TableId) -> Option<TableProgress> {
        self.tables
            .iter()
            .find(|e| e.task_id == task_id && &e.table == table)
            .map(|e| e.progress.clone())
    }

    pub(crate) fn save_table(&mut self, task_id: &str, table: &TableId, progress: &TableProgress) {
        match self
            .tables
            .iter_mut()
            .find(|e| e.task_id == task_id && &e.table == table)
        {
            Some(entry) => entry.progress = progress.clone(),
            None => self.tables.push(TableEntry {
                task_id: task_id.to_string(),
                table: table.clone(),
                progress: progress.clone(),
            }),
        }
    }

    pub(crate) fn load_positions(&self, task_id: &str) -> BinlogProgress {
        self.positions.get(task_id).cloned().unwrap_or_default()
    }

    pub(crate) fn save_position(&mut self, task_id: &str, kind: PositionKind, pos: &LogFilePos) {
        self.positions
            .entry(task_id.to_string())
            .or_default()
            .set(kind, pos.clone());
    }

    pub(crate) fn save_rollback(&mut self, task_id: &str, target: &str, pos: &LogFilePos) {
        match self
            .rollback
            .iter_mut()
            .find(|e| e.task_id == task_id && e.target == target)
        {
            Some(entry) => entry.position = pos.clone(),
            None => self.rollback.push(RollbackEntry {
                task_id: task_id.to_string(),
                target: target.to_string(),
                position: pos.clone(),
            }),
        }
    }

    pub(crate) fn load_rollback(&self, task_id: &str, target: &str) -> Option<LogFilePos> {
        self.rollback
            .iter()
            .find(|e| e.task_id == task_id && e.target == target)
            .map(|e| e.position.clone())
    }

    pub(crate) fn insert_diff(&mut self, task_id: &str, diff: NewDiff) -> u64 {
        self.next_diff_id += 1;
        let now = Utc::now();
        self.diffs.push(DiffRecord {
            id: self.next_diff_id,
            task_id: task_id.to_string(),
            source: diff.source,
            target: diff.target,
            min_id_value: diff.min_id_value,
            max_id_value: diff.max_id_value,
            is_fix: false,
            created_at: now,
            updated_at: now,
        });
        self.next_diff_id
    }

    pub(crate) fn unfixed_diffs(&self, task_id: &str, limit: usize) -> Vec<DiffRecord> {
        self.diffs
            .iter()
            .filter(|d| d.task_id == task_id && !d.is_fix)
            .take(limit)
            .cloned()
            .collect()
    }

    pub(crate) fn mark_diff_fixed(&mut self, task_id: &str, id: u64) -> Result<()> {
        let record = self
            .diffs
            .iter_mut()
            .find(|d| d.task_id == task_id && d.id == id)
            .ok_or_else(|| anyhow!("No diff record {id} for task '{task_id}'"))?;
        record.is_fix = true;
        record.updated_at = Utc::now();
        Ok(())
    }

    pub(crate) fn list_diffs(&self, task_id: &str) -> Vec<DiffRecord> {
        self.diffs
            .iter()
            .filter(|d| d.task_id == task_id)
            .cloned()
            .collect()
    }
}

/// Progress store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    doc: Mutex<ProgressDocument>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut ProgressDocument) -> T) -> Result<T> {
        let mut doc = self
            .doc
            .lock()
            .map_err(|_| anyhow!("progress store lock poisoned"))?;
        Ok(f(&mut doc))
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn load_table(&self, task_id: &str, table: &TableId) -> Result<Option<TableProgress>> {
        self.with(|doc| doc.load_table(task_id, table))
    }

    async fn save_table(
        &self,
        task_id: &str,
        table: &TableId,
        progress: &TableProgress,
    ) -> Result<()> {
        self.with(|doc| doc.save_table(task_id, table, progress))
    }

    async fn load_positions(&self, task_id: &str) -> Result<BinlogProgress> {
        self.with(|doc| doc.load_positions(task_id))
    }

    async fn save_position(
        &self,
        task_id: &str,
        kind: PositionKind,
        pos: &LogFilePos,
    ) -> Result<()> {
        self.with(|doc| doc.save_position(task_id, kind, pos))
    }

    async fn save_rollback_position(
        &self,
        task_id: &str,
        target: &str,
        pos: &LogFilePos,
    ) -> Result<()> {
        self.with(|doc| doc.save_rollback(task_id, target, pos))
    }

    async fn load_rollback_position(
        &self,
        task_id: &str,
        target: &str,
    ) -> Result<Option<LogFilePos>> {
        self.with(|doc| doc.load_rollback(task_id, target))
    }

    async fn insert_diff(&self, task_id: &str, diff: NewDiff) -> Result<u64> {
        self.with(|doc| doc.insert_diff(task_id, diff))
    }

    async fn unfixed_diffs(&self, task_id: &str, limit: usize) -> Result<Vec<DiffRecord>> {
        self.with(|doc| doc.unfixed_diffs(task_id, limit))
    }

    async fn mark_diff_fixed(&self, task_id: &str, id: u64) -> Result<()> {
        self.with(|doc| doc.mark_diff_fixed(task_id, id))?
    }

    async fn list_diffs(&self, task_id: &str) -> Result<Vec<DiffRecord>> {
        self.with(|doc| doc.list_diffs(task_id))
    }
}
