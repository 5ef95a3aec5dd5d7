//! Durable progress for mysql-migrate.
//!
//! Stores what a migration task needs to resume after a restart: per-table
//! row-copy cursors, the binlog coordinates of the apply engine, the target's
//! rollback reference position and the checksum diff records.
//!
//! ## Storage Backends
//!
//! - `MemoryStore` - Keeps everything in process memory
//! - `FilesystemStore` - One JSON document, replaced atomically on each change
//! - `MySqlStore` - Tables in a MySQL schema
//!
//! Binlog coordinates also implement the [`Checkpoint`] trait so that they can
//! be passed on the command line (`--start-position mysql-bin.000003:4`).

mod filesystem;
mod memory;
mod mysql;
mod records;
pub mod store;

#[cfg(test)]
mod tests;

pub use filesystem::FilesystemStore;
pub use memory::MemoryStore;
pub use mysql::MySqlStore;
pub use records::{BinlogProgress, DiffRecord, NewDiff, PositionKind, TableProgress};
pub use store::ProgressStore;

use sync_core::LogFilePos;

/// Trait for positions that can be written to and read from the command line.
///
/// # Example
///
/// ```rust
/// use checkpoint::Checkpoint;
/// use sync_core::LogFilePos;
///
/// let pos = LogFilePos::from_cli_string("mysql-bin.000003:120").unwrap();
/// assert_eq!(pos.to_cli_string(), "mysql-bin.000003:120");
/// ```
pub trait Checkpoint: serde::Serialize + for<'de> serde::Deserialize<'de> + Clone {
    /// Position type identifier, used in logs and error messages.
    const DATABASE_TYPE: &'static str;

    /// Convert to CLI-friendly string format.
    ///
    /// The returned string should be parseable by `from_cli_string()`.
    fn to_cli_string(&self) -> String;

    /// Parse from CLI string format.
    fn from_cli_string(s: &str) -> anyhow::Result<Self>
    where
        Self: Sized;
}

impl Checkpoint for LogFilePos {
    const DATABASE_TYPE: &'static str = "mysql-binlog";

    fn to_cli_string(&self) -> String {
        self.to_string()
    }

    fn from_cli_string(s: &str) -> anyhow::Result<Self> {
        s.parse::<LogFilePos>()
            .map_err(|e| anyhow::anyhow!("Invalid {} position: {e}", Self::DATABASE_TYPE))
    }
}
