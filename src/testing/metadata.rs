use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use sync_core::{Table, TableDef, TableId};

use crate::metadata::MetadataProvider;
use crate::session::SessionError;

/// Metadata built from fixed table definitions. Replacing a definition
/// with [`StaticMetadataProvider::set_def`] plays the part of an `ALTER
/// TABLE`: the cached version stays until the next rebuild.
pub struct StaticMetadataProvider {
    batch_size: usize,
    defs: Mutex<HashMap<TableId, TableDef>>,
    cache: Mutex<HashMap<TableId, Arc<Table>>>,
    rebuilds: AtomicUsize,
}

impl StaticMetadataProvider {
    pub fn new(defs: impl IntoIterator<Item = TableDef>, batch_size: usize) -> Self {
        Self {
            batch_size,
            defs: Mutex::new(defs.into_iter().map(|d| (d.source.clone(), d)).collect()),
            cache: Mutex::new(HashMap::new()),
            rebuilds: AtomicUsize::new(0),
        }
    }

    pub fn set_def(&self, def: TableDef) {
        self.defs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(def.source.clone(), def);
    }

    pub fn rebuild_count(&self) -> usize {
        self.rebuilds.load(Ordering::SeqCst)
    }

    fn build(&self, table: &TableId, version: u64) -> Result<Arc<Table>> {
        let def = self
            .defs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(table.clone()))?;
        Ok(Arc::new(Table::new(def, self.batch_size, version)?))
    }
}

#[async_trait]
impl MetadataProvider for StaticMetadataProvider {
    async fn resolve(&self, table: &TableId) -> Result<Arc<Table>> {
        if let Some(cached) = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
        {
            return Ok(cached.clone());
        }
        let built = self.build(table, 1)?;
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.clone(), built.clone());
        Ok(built)
    }

    async fn rebuild(&self, table: &TableId) -> Result<Arc<Table>> {
        let version = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .map_or(1, |t| t.version() + 1);
        let built = self.build(table, version)?;
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.clone(), built.clone());
        self.rebuilds.fetch_add(1, Ordering::SeqCst);
        Ok(built)
    }
}
