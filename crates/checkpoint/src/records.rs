//! Records kept in the durable progress store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sync_core::{KeyValue, LogFilePos, TableId};

/// Row-copy progress of one table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableProgress {
    /// Set once every range of the table has been copied.
    pub row_copy_complete: bool,
    /// Last key of the source table, resolved once at startup.
    pub max_id_value: Option<KeyValue>,
    /// Resumable copy cursor: nothing below this key is still outstanding.
    pub curr_id_value: Option<KeyValue>,
}

/// Which binlog coordinate of a task a value refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionKind {
    /// Source position captured before row copy began.
    Start,
    /// Furthest position read from the replication stream.
    Parsed,
    /// Low watermark of applied events: the safe resume point.
    Applied,
    /// Position at which parsing halts.
    Stop,
}

impl PositionKind {
    pub const ALL: [PositionKind; 4] = [
        PositionKind::Start,
        PositionKind::Parsed,
        PositionKind::Applied,
        PositionKind::Stop,
    ];

    /// Column-name prefix in the MySQL layout (`parse_log_file`, ...).
    pub fn column_prefix(&self) -> &'static str {
        match self {
            PositionKind::Start => "start",
            PositionKind::Parsed => "parse",
            PositionKind::Applied => "applied",
            PositionKind::Stop => "stop",
        }
    }
}

impl std::fmt::Display for PositionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.column_prefix())
    }
}

/// Binlog coordinates persisted for one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BinlogProgress {
    pub start: Option<LogFilePos>,
    pub parsed: Option<LogFilePos>,
    pub applied: Option<LogFilePos>,
    pub stop: Option<LogFilePos>,
}

impl BinlogProgress {
    pub fn get(&self, kind: PositionKind) -> Option<&LogFilePos> {
        match kind {
            PositionKind::Start => self.start.as_ref(),
            PositionKind::Parsed => self.parsed.as_ref(),
            PositionKind::Applied => self.applied.as_ref(),
            PositionKind::Stop => self.stop.as_ref(),
        }
    }

    pub fn set(&mut self, kind: PositionKind, pos: LogFilePos) {
        let slot = match kind {
            PositionKind::Start => &mut self.start,
            PositionKind::Parsed => &mut self.parsed,
            PositionKind::Applied => &mut self.applied,
            PositionKind::Stop => &mut self.stop,
        };
        *slot = Some(pos);
    }

    /// Where binlog apply resumes: the applied position when one exists,
    /// else the start position.
    pub fn resume_from(&self) -> Option<&LogFilePos> {
        self.applied.as_ref().or(self.start.as_ref())
    }
}

/// A detected range mismatch between source and target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffRecord {
    pub id: u64,
    pub task_id: String,
    pub source: TableId,
    pub target: TableId,
    pub min_id_value: KeyValue,
    pub max_id_value: KeyValue,
    pub is_fix: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A mismatch about to be recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDiff {
    pub source: TableId,
    pub target: TableId,
    pub min_id_value: KeyValue,
    pub max_id_value: KeyValue,
}
