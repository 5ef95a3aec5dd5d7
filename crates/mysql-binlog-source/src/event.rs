//! Events read from the replication stream.

use mysql_async::Value;
use mysql_types::{decode_row, ConversionError};
use sync_core::{Column, LogFilePos, RowMutation, TableId};

/// One changed row as raw values: `before` is absent for inserts, `after`
/// for deletes.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRowChange {
    pub before: Option<Vec<Value>>,
    pub after: Option<Vec<Value>>,
}

impl RawRowChange {
    pub fn insert(after: Vec<Value>) -> Self {
        Self {
            before: None,
            after: Some(after),
        }
    }

    pub fn update(before: Vec<Value>, after: Vec<Value>) -> Self {
        Self {
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn delete(before: Vec<Value>) -> Self {
        Self {
            before: Some(before),
            after: None,
        }
    }
}

/// A row-level change event for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct RowsEvent {
    /// Earliest coordinate from which this event can be decoded again: the
    /// start of the table-map events that precede it.
    pub resume: LogFilePos,
    /// Coordinate just past this event.
    pub end: LogFilePos,
    pub table: TableId,
    /// Column count announced by the table map.
    pub column_count: usize,
    pub rows: Vec<RawRowChange>,
}

impl RowsEvent {
    /// Decode every row against the given column layout.
    pub fn mutations(&self, columns: &[Column]) -> Result<Vec<RowMutation>, ConversionError> {
        let decode = |values: &Vec<Value>| decode_row(values.clone(), columns);

        self.rows
            .iter()
            .filter_map(|change| match (&change.before, &change.after) {
                (None, Some(after)) => Some(decode(after).map(|after| RowMutation::Insert { after })),
                (Some(before), Some(after)) => Some(
                    decode(before).and_then(|before| {
                        decode(after).map(|after| RowMutation::Update { before, after })
                    }),
                ),
                (Some(before), None) => {
                    Some(decode(before).map(|before| RowMutation::Delete { before }))
                }
                (None, None) => None,
            })
            .collect()
    }
}

/// What the apply engine sees from the replication stream.
#[derive(Debug, Clone, PartialEq)]
pub enum BinlogEvent {
    /// The server switched to a new log file.
    Rotate { next: LogFilePos },
    /// Row changes of a table.
    Rows(RowsEvent),
    /// Any other event; only its position matters.
    Other { end: LogFilePos },
}

impl BinlogEvent {
    /// Coordinate the parser has reached after this event.
    pub fn end(&self) -> &LogFilePos {
        match self {
            BinlogEvent::Rotate { next } => next,
            BinlogEvent::Rows(rows) => &rows.end,
            BinlogEvent::Other { end } => end,
        }
    }
}
