use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use mysql_async::Value;
use mysql_migrate_binlog_source::{
    BinlogConnector, BinlogEvent, BinlogSource, RawRowChange, RowsEvent,
};
use sync_core::{LogFilePos, TableId};

/// One scripted step of a replication stream.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Event(BinlogEvent),
    /// The stream fails with this message.
    Fail(String),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Replays a fixed script of events.
///
/// Every connection reads from the same script, so a reconnect continues
/// where the failed stream stopped. When the script runs out the stream
/// closes, or stays idle when built with [`ScriptedBinlogConnector::hold_open`].
pub struct ScriptedBinlogConnector {
    script: Arc<Mutex<VecDeque<ScriptStep>>>,
    connects: Mutex<Vec<LogFilePos>>,
    current: Mutex<LogFilePos>,
    hold_open: bool,
}

impl ScriptedBinlogConnector {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            script: Arc::new(Mutex::new(steps.into_iter().collect())),
            connects: Mutex::new(Vec::new()),
            current: Mutex::new(LogFilePos::new("mysql-bin.000001", 4)),
            hold_open: false,
        }
    }

    pub fn from_events(events: impl IntoIterator<Item = BinlogEvent>) -> Self {
        Self::new(events.into_iter().map(ScriptStep::Event))
    }

    /// Keep the stream open once the script is exhausted.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn set_current_position(&self, pos: LogFilePos) {
        *lock(&self.current) = pos;
    }

    /// Positions every connection was opened at.
    pub fn connects(&self) -> Vec<LogFilePos> {
        lock(&self.connects).clone()
    }
}

#[async_trait]
impl BinlogConnector for ScriptedBinlogConnector {
    async fn connect(&self, from: &LogFilePos) -> Result<Box<dyn BinlogSource>> {
        lock(&self.connects).push(from.clone());
        Ok(Box::new(ScriptedSource {
            script: self.script.clone(),
            hold_open: self.hold_open,
        }))
    }

    async fn current_position(&self) -> Result<LogFilePos> {
        Ok(lock(&self.current).clone())
    }
}

struct ScriptedSource {
    script: Arc<Mutex<VecDeque<ScriptStep>>>,
    hold_open: bool,
}

#[async_trait]
impl BinlogSource for ScriptedSource {
    async fn next_event(&mut self) -> Result<Option<BinlogEvent>> {
        let step = lock(&self.script).pop_front();
        match step {
            Some(ScriptStep::Event(event)) => Ok(Some(event)),
            Some(ScriptStep::Fail(message)) => Err(anyhow!(message)),
            None if self.hold_open => std::future::pending().await,
            None => Ok(None),
        }
    }
}

/// Builds row events at increasing positions of one log file.
pub struct EventBuilder {
    file: String,
    pos: u64,
}

impl EventBuilder {
    pub fn new(file: impl Into<String>, pos: u64) -> Self {
        Self {
            file: file.into(),
            pos,
        }
    }

    pub fn position(&self) -> LogFilePos {
        LogFilePos::new(self.file.clone(), self.pos)
    }

    /// A table map followed by a rows event; the resume coordinate is the
    /// start of the table map.
    pub fn rows(
        &mut self,
        table: &TableId,
        column_count: usize,
        rows: Vec<RawRowChange>,
    ) -> BinlogEvent {
        let resume = self.position();
        self.pos += 100;
        BinlogEvent::Rows(RowsEvent {
            resume,
            end: self.position(),
            table: table.clone(),
            column_count,
            rows,
        })
    }

    pub fn other(&mut self) -> BinlogEvent {
        self.pos += 31;
        BinlogEvent::Other {
            end: self.position(),
        }
    }

    pub fn rotate(&mut self, file: impl Into<String>) -> BinlogEvent {
        self.file = file.into();
        self.pos = 4;
        BinlogEvent::Rotate {
            next: self.position(),
        }
    }
}

/// Raw `(id, v)` row image.
pub fn kv_image(id: i64, v: &str) -> Vec<Value> {
    vec![Value::Int(id), Value::Bytes(v.as_bytes().to_vec())]
}
