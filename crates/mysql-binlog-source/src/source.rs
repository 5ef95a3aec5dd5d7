//! Traits for reading the replication stream.

use anyhow::Result;
use async_trait::async_trait;
use sync_core::LogFilePos;

use crate::event::BinlogEvent;

/// An open replication stream.
#[async_trait]
pub trait BinlogSource: Send {
    /// Get the next event from the stream.
    /// Returns None when the server closed the stream.
    async fn next_event(&mut self) -> Result<Option<BinlogEvent>>;
}

/// Opens replication streams against one source instance.
#[async_trait]
pub trait BinlogConnector: Send + Sync {
    /// Start streaming at `from`.
    async fn connect(&self, from: &LogFilePos) -> Result<Box<dyn BinlogSource>>;

    /// The source's current binlog coordinate.
    async fn current_position(&self) -> Result<LogFilePos>;
}
