//! Table metadata provider.
//!
//! Resolves a configured table into an immutable [`Table`] and rebuilds it
//! when the source's column layout changes. Callers hold `Arc<Table>`
//! snapshots, so a rebuild never mutates metadata another task is using.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use mysql_async::Pool;
use mysql_types::{choose_key, load_columns, load_unique_indexes};
use sync_core::{SchemaError, Table, TableDef, TableId};
use tokio::sync::RwLock;

use crate::config::TableMapping;
use crate::session::SessionError;

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Current metadata of a migrated table. Fails with
    /// [`SessionError::NotFound`] for tables outside the task.
    async fn resolve(&self, table: &TableId) -> Result<Arc<Table>>;

    /// Reload the table's layout and swap in a new version. Only called once
    /// nothing decoded against the previous version is still in flight.
    async fn rebuild(&self, table: &TableId) -> Result<Arc<Table>>;
}

/// Metadata read from `information_schema` on both instances.
pub struct MySqlMetadataProvider {
    source: Pool,
    target: Pool,
    mappings: HashMap<TableId, TableMapping>,
    batch_size: usize,
    cache: RwLock<HashMap<TableId, Arc<Table>>>,
}

impl MySqlMetadataProvider {
    pub fn new(source: Pool, target: Pool, mappings: &[TableMapping], batch_size: usize) -> Self {
        Self {
            source,
            target,
            mappings: mappings.iter().map(|m| (m.source(), m.clone())).collect(),
            batch_size,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn mapping(&self, table: &TableId) -> Result<&TableMapping> {
        self.mappings
            .get(table)
            .ok_or_else(|| SessionError::NotFound(table.clone()).into())
    }

    async fn load(&self, mapping: &TableMapping, version: u64) -> Result<Table> {
        let source_id = mapping.source();
        let target_id = mapping.target();

        let mut conn = self
            .source
            .get_conn()
            .await
            .context("Failed to connect to source for metadata")?;
        let columns = load_columns(&mut conn, &source_id).await?;
        if columns.is_empty() {
            return Err(SessionError::NotFound(source_id).into());
        }
        let indexes = load_unique_indexes(&mut conn, &source_id).await?;
        drop(conn);

        let key_columns =
            choose_key(&indexes, &columns).ok_or_else(|| SchemaError::NoKey(source_id.clone()))?;
        let mut unique_columns: Vec<String> = indexes
            .iter()
            .flat_map(|index| index.columns.iter().cloned())
            .collect();
        unique_columns.sort();
        unique_columns.dedup();

        let table = Table::new(
            TableDef {
                source: source_id.clone(),
                target: target_id.clone(),
                columns,
                column_map: mapping.columns.clone(),
                key_columns,
                unique_columns,
                ignored_columns: mapping.ignore_columns.clone(),
            },
            self.batch_size,
            version,
        )?;

        let mut conn = self
            .target
            .get_conn()
            .await
            .context("Failed to connect to target for metadata")?;
        let target_columns = load_columns(&mut conn, &target_id).await?;
        if target_columns.is_empty() {
            bail!("Target table {target_id} does not exist");
        }
        let mapped = table.columns(sync_core::Side::Target);
        for &position in table.useful() {
            let name = &mapped[position].name;
            if !target_columns.iter().any(|c| &c.name == name) {
                bail!("Target table {target_id} has no column '{name}'");
            }
        }

        tracing::debug!(
            "Loaded metadata for {source_id} -> {target_id} (version {version}, key {:?})",
            table.key_columns()
        );
        Ok(table)
    }
}

#[async_trait]
impl MetadataProvider for MySqlMetadataProvider {
    async fn resolve(&self, table: &TableId) -> Result<Arc<Table>> {
        if let Some(cached) = self.cache.read().await.get(table) {
            return Ok(cached.clone());
        }
        let mapping = self.mapping(table)?;
        let mut cache = self.cache.write().await;
        if let Some(cached) = cache.get(table) {
            return Ok(cached.clone());
        }
        let loaded = Arc::new(self.load(mapping, 1).await?);
        cache.insert(table.clone(), loaded.clone());
        Ok(loaded)
    }

    async fn rebuild(&self, table: &TableId) -> Result<Arc<Table>> {
        let mapping = self.mapping(table)?;
        let mut cache = self.cache.write().await;
        let version = cache.get(table).map_or(1, |t| t.version() + 1);
        let rebuilt = Arc::new(self.load(mapping, version).await?);
        tracing::info!(
            "Rebuilt metadata for {table}: {} columns, version {version}",
            rebuilt.column_count()
        );
        cache.insert(table.clone(), rebuilt.clone());
        Ok(rebuilt)
    }
}
