//! Task configuration: which tables to migrate, how names map, and the
//! engine tunables.

pub mod duration;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sync_core::TableId;

pub use duration::parse_duration;

use crate::retry::RetryPolicy;

/// How copied rows are written to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum WriteMode {
    /// `INSERT IGNORE`: rows already on the target win.
    #[default]
    InsertIgnore,
    /// `REPLACE`: the copied row wins.
    Replace,
}

/// One migrated table as written in the task file.
///
/// ```toml
/// [[tables]]
/// source_schema = "app"
/// source_table = "users"
/// target_schema = "app_v2"
/// ignore_columns = ["legacy_flags"]
///
/// [tables.columns]
/// name = "full_name"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMapping {
    pub source_schema: String,
    pub source_table: String,
    pub target_schema: Option<String>,
    pub target_table: Option<String>,
    /// Source column name to target column name.
    #[serde(default)]
    pub columns: HashMap<String, String>,
    #[serde(default)]
    pub ignore_columns: Vec<String>,
}

impl TableMapping {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            source_schema: schema.into(),
            source_table: table.into(),
            target_schema: None,
            target_table: None,
            columns: HashMap::new(),
            ignore_columns: Vec::new(),
        }
    }

    pub fn source(&self) -> TableId {
        TableId::new(&self.source_schema, &self.source_table)
    }

    /// Target identity; unmapped parts keep the source names.
    pub fn target(&self) -> TableId {
        TableId::new(
            self.target_schema.as_deref().unwrap_or(&self.source_schema),
            self.target_table.as_deref().unwrap_or(&self.source_table),
        )
    }
}

/// The task file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFile {
    #[serde(default)]
    pub tables: Vec<TableMapping>,
}

impl TaskFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read task file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid task file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let file: TaskFile = toml::from_str(content)?;
        file.validate()?;
        Ok(file)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tables.is_empty() {
            bail!("No tables configured");
        }
        let mut seen = HashSet::new();
        for mapping in &self.tables {
            if mapping.source_schema.is_empty() || mapping.source_table.is_empty() {
                bail!("Table mapping with empty source schema or table");
            }
            if !seen.insert(mapping.source()) {
                bail!("Table {} is configured more than once", mapping.source());
            }
        }
        Ok(())
    }

    pub fn table_ids(&self) -> Vec<TableId> {
        self.tables.iter().map(TableMapping::source).collect()
    }
}

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_PARALLELISM: usize = 4;
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_STOP_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Tunables of the three engines.
///
/// The row limit of a copy range is part of each table's metadata, see
/// [`MetadataProvider`](crate::metadata::MetadataProvider).
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub copy_parallelism: usize,
    pub apply_parallelism: usize,
    pub checksum_parallelism: usize,
    pub fix_parallelism: usize,
    /// Capacity of every work queue.
    pub queue_capacity: usize,
    pub checkpoint_interval: Duration,
    pub stop_poll_interval: Duration,
    pub copy_write_mode: WriteMode,
    /// Forward copied ranges to checksumming.
    pub checksum: bool,
    /// Repair sweeps before giving up on unconfirmed records; 0 = unlimited.
    pub checksum_max_rounds: u32,
    pub retry: RetryPolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            copy_parallelism: DEFAULT_PARALLELISM,
            apply_parallelism: DEFAULT_PARALLELISM,
            checksum_parallelism: DEFAULT_PARALLELISM,
            fix_parallelism: DEFAULT_PARALLELISM,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            stop_poll_interval: DEFAULT_STOP_POLL_INTERVAL,
            copy_write_mode: WriteMode::InsertIgnore,
            checksum: true,
            checksum_max_rounds: 0,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineOptions {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("copy parallelism", self.copy_parallelism),
            ("apply parallelism", self.apply_parallelism),
            ("checksum parallelism", self.checksum_parallelism),
            ("fix parallelism", self.fix_parallelism),
            ("queue capacity", self.queue_capacity),
        ] {
            if value == 0 {
                bail!("{name} must be at least 1");
            }
        }
        if self.checkpoint_interval.is_zero() {
            bail!("Checkpoint interval must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TASK: &str = r#"
[[tables]]
source_schema = "app"
source_table = "users"
target_schema = "app_v2"
target_table = "people"
ignore_columns = ["legacy"]

[tables.columns]
name = "full_name"

[[tables]]
source_schema = "app"
source_table = "orders"
"#;

    #[test]
    fn test_parse_task_file() {
        let task = TaskFile::parse(TASK).unwrap();
        assert_eq!(task.tables.len(), 2);

        let users = &task.tables[0];
        assert_eq!(users.target(), TableId::new("app_v2", "people"));
        assert_eq!(users.columns.get("name").map(String::as_str), Some("full_name"));
        assert_eq!(users.ignore_columns, vec!["legacy"]);

        let orders = &task.tables[1];
        assert_eq!(orders.target(), TableId::new("app", "orders"));
        assert!(orders.columns.is_empty());
    }

    #[test]
    fn test_duplicate_tables_rejected() {
        let content = r#"
[[tables]]
source_schema = "app"
source_table = "users"

[[tables]]
source_schema = "app"
source_table = "users"
"#;
        let err = TaskFile::parse(content).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_empty_task_rejected() {
        assert!(TaskFile::parse("").is_err());
    }

    #[test]
    fn test_engine_options_validation() {
        assert!(EngineOptions::default().validate().is_ok());

        let options = EngineOptions {
            apply_parallelism: 0,
            ..EngineOptions::default()
        };
        assert!(options
            .validate()
            .unwrap_err()
            .to_string()
            .contains("apply parallelism"));
    }
}
