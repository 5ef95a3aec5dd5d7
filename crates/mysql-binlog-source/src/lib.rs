//! MySQL binlog replication client for mysql-migrate.
//!
//! Registers as a replica, reads the row-based change stream and hands row
//! events to the apply engine with the coordinates it needs for resumable
//! checkpointing. Requires `binlog_format=ROW` and `binlog_row_image=FULL`
//! on the source.

mod event;
mod mysql;
mod source;

pub use event::{BinlogEvent, RawRowChange, RowsEvent};
pub use mysql::{show_master_status, MySqlBinlogConnector, PositionTracker};
pub use source::{BinlogConnector, BinlogSource};
