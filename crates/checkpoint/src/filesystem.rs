//! Filesystem-based progress storage implementation.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sync_core::{LogFilePos, TableId};

use crate::memory::ProgressDocument;
use crate::records::{BinlogProgress, DiffRecord, NewDiff, PositionKind, TableProgress};
use crate::store::ProgressStore;

const STATE_FILE: &str = "progress.json";

/// Filesystem implementation of the ProgressStore trait.
///
/// Keeps the whole store as one JSON document in a directory. Every change
/// rewrites the document through a temporary file that is renamed over the
/// old one, so a crash leaves either the previous or the new state.
pub struct FilesystemStore {
    dir: PathBuf,
    doc: Mutex<ProgressDocument>,
}

impl FilesystemStore {
    /// Open the store in `dir`, loading existing state if present.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create state directory {}", dir.display()))?;

        let path = dir.join(STATE_FILE);
        let doc = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            ProgressDocument::default()
        };
        tracing::info!("Using progress state at {}", path.display());

        Ok(Self {
            dir,
            doc: Mutex::new(doc),
        })
    }

    /// Get the directory path.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_document(&self, doc: &ProgressDocument) -> Result<()> {
        let mut file = tempfile::NamedTempFile::new_in(&self.dir)?;
        file.write_all(serde_json::to_string_pretty(doc)?.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(self.dir.join(STATE_FILE))
            .map_err(|e| anyhow!("Failed to replace progress state: {e}"))?;
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&ProgressDocument) -> T) -> Result<T> {
        let doc = self
            .doc
            .lock()
            .map_err(|_| anyhow!("progress store lock poisoned"))?;
        Ok(f(&doc))
    }

    fn update<T>(&self, f: impl FnOnce(&mut ProgressDocument) -> Result<T>) -> Result<T> {
        let mut doc = self
            .doc
            .lock()
            .map_err(|_| anyhow!("progress store lock poisoned"))?;
        let mut next = doc.clone();
        let out = f(&mut next)?;
        self.write_document(&next)?;
        *doc = next;
        Ok(out)
    }
}

#[async_trait]
impl ProgressStore for FilesystemStore {
    async fn load_table(&self, task_id: &str, table: &TableId) -> Result<Option<TableProgress>> {
        self.read(|doc| doc.load_table(task_id, table))
    }

    async fn save_table(
        &self,
        task_id: &str,
        table: &TableId,
        progress: &TableProgress,
    ) -> Result<()> {
        self.update(|doc| {
            doc.save_table(task_id, table, progress);
            Ok(())
        })
    }

    async fn load_positions(&self, task_id: &str) -> Result<BinlogProgress> {
        self.read(|doc| doc.load_positions(task_id))
    }

    async fn save_position(
        &self,
        task_id: &str,
        kind: PositionKind,
        pos: &LogFilePos,
    ) -> Result<()> {
        self.update(|doc| {
            doc.save_position(task_id, kind, pos);
            Ok(())
        })
    }

    async fn save_rollback_position(
        &self,
        task_id: &str,
        target: &str,
        pos: &LogFilePos,
    ) -> Result<()> {
        self.update(|doc| {
            doc.save_rollback(task_id, target, pos);
            Ok(())
        })
    }

    async fn load_rollback_position(
        &self,
        task_id: &str,
        target: &str,
    ) -> Result<Option<LogFilePos>> {
        self.read(|doc| doc.load_rollback(task_id, target))
    }

    async fn insert_diff(&self, task_id: &str, diff: NewDiff) -> Result<u64> {
        self.update(|doc| Ok(doc.insert_diff(task_id, diff)))
    }

    async fn unfixed_diffs(&self, task_id: &str, limit: usize) -> Result<Vec<DiffRecord>> {
        self.read(|doc| doc.unfixed_diffs(task_id, limit))
    }

    async fn mark_diff_fixed(&self, task_id: &str, id: u64) -> Result<()> {
        self.update(|doc| doc.mark_diff_fixed(task_id, id))
    }

    async fn list_diffs(&self, task_id: &str) -> Result<Vec<DiffRecord>> {
        self.read(|doc| doc.list_diffs(task_id))
    }
}
