use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use checkpoint::TableProgress;
use sync_core::{KeyValue, PrimaryRangeValue, TableId};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use super::{save_progress, CopySnapshot, CopySummary, TableCursor, TableWatermark};
use crate::session::Session;
use crate::watermark::{AckOutcome, WatermarkTracker};

/// Messages to the row copy bookkeeping task.
#[derive(Debug, Clone)]
pub enum CopyEvent {
    /// A range was generated and is about to be queued.
    Add {
        table: TableId,
        range: PrimaryRangeValue,
    },
    /// A range was copied.
    Ack {
        table: TableId,
        token: u64,
        rows: u64,
    },
    /// No more ranges will be generated for the table.
    Exhausted { table: TableId },
}

struct TableState {
    tracker: WatermarkTracker<u64, PrimaryRangeValue>,
    max: Option<KeyValue>,
    persisted: Option<KeyValue>,
    /// Token of the range whose `min` was last persisted; 0 for the seed.
    persisted_token: u64,
    exhausted: bool,
    complete: bool,
}

impl TableState {
    fn watermark(&self) -> TableWatermark {
        TableWatermark {
            pending: self.tracker.pending_len(),
            low: self.tracker.low().cloned(),
            high: self.tracker.high().cloned(),
            persisted: self.persisted.clone(),
            complete: self.complete,
        }
    }
}

/// Sole owner of the per-table watermark state of row copy.
pub(crate) struct CopyBookkeeper {
    session: Session,
    interval: Duration,
    tables: BTreeMap<TableId, TableState>,
    snapshots: watch::Sender<CopySnapshot>,
    summary: CopySummary,
}

impl CopyBookkeeper {
    pub fn new(
        session: Session,
        interval: Duration,
        snapshots: watch::Sender<CopySnapshot>,
    ) -> Self {
        Self {
            session,
            interval,
            tables: BTreeMap::new(),
            snapshots,
            summary: CopySummary::default(),
        }
    }

    pub fn track(&mut self, cursor: &TableCursor) {
        self.tables.insert(
            cursor.table.id().clone(),
            TableState {
                tracker: WatermarkTracker::new(),
                max: Some(cursor.max.clone()),
                persisted: Some(cursor.current.min.clone()),
                persisted_token: 0,
                exhausted: false,
                complete: false,
            },
        );
    }

    pub fn track_complete(&mut self, table: TableId) {
        self.tables.insert(
            table,
            TableState {
                tracker: WatermarkTracker::new(),
                max: None,
                persisted: None,
                persisted_token: 0,
                exhausted: true,
                complete: true,
            },
        );
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<CopyEvent>) -> Result<CopySummary> {
        self.publish();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await?,
                    None => break,
                },
                _ = ticker.tick() => self.persist_cursors().await?,
            }
        }

        self.persist_cursors().await?;
        self.summary.tables_completed = self.tables.values().filter(|t| t.complete).count();
        let incomplete: Vec<String> = self
            .tables
            .iter()
            .filter(|(_, state)| !state.complete)
            .map(|(id, _)| id.to_string())
            .collect();
        if !incomplete.is_empty() {
            tracing::warn!(
                "Row copy stopped with incomplete tables: {}",
                incomplete.join(", ")
            );
        }
        Ok(self.summary)
    }

    async fn handle(&mut self, event: CopyEvent) -> Result<()> {
        match event {
            CopyEvent::Add { table, range } => {
                if let Some(state) = self.tables.get_mut(&table) {
                    state.tracker.add(range.token, range, 1);
                }
            }
            CopyEvent::Ack { table, token, rows } => {
                let Some(state) = self.tables.get_mut(&table) else {
                    return Ok(());
                };
                match state.tracker.ack(&token) {
                    AckOutcome::Completed => {
                        self.summary.ranges_copied += 1;
                        self.summary.rows_copied += rows;
                    }
                    AckOutcome::Unknown => {
                        tracing::warn!("Acknowledgment for unknown range #{token} of {table}");
                    }
                    AckOutcome::Pending(_) => {}
                }
                self.complete_if_drained(&table).await?;
            }
            CopyEvent::Exhausted { table } => {
                if let Some(state) = self.tables.get_mut(&table) {
                    state.exhausted = true;
                }
                self.complete_if_drained(&table).await?;
            }
        }
        self.publish();
        Ok(())
    }

    async fn complete_if_drained(&mut self, table: &TableId) -> Result<()> {
        let done = self
            .tables
            .get(table)
            .is_some_and(|s| s.exhausted && !s.complete && s.tracker.is_empty());
        if !done {
            return Ok(());
        }
        self.persist_cursor(table).await?;
        let Some(state) = self.tables.get_mut(table) else {
            return Ok(());
        };
        let progress = TableProgress {
            row_copy_complete: true,
            max_id_value: state.max.clone(),
            curr_id_value: state.persisted.clone(),
        };
        save_progress(&self.session, table, &progress).await?;
        state.complete = true;
        tracing::info!("Table {table} copy complete");
        Ok(())
    }

    async fn persist_cursors(&mut self) -> Result<()> {
        let tables: Vec<TableId> = self.tables.keys().cloned().collect();
        for table in tables {
            self.persist_cursor(&table).await?;
        }
        self.publish();
        Ok(())
    }

    /// Persist the low watermark of a table as its resume cursor if it moved
    /// forward since the last write.
    ///
    /// Ranges are generated in the source's key order, so the generation
    /// token orders cursors without comparing key values here.
    async fn persist_cursor(&mut self, table: &TableId) -> Result<()> {
        let Some(state) = self.tables.get_mut(table) else {
            return Ok(());
        };
        if state.complete {
            return Ok(());
        }
        let Some(low) = state.tracker.low() else {
            return Ok(());
        };
        if low.token <= state.persisted_token {
            return Ok(());
        }
        let token = low.token;
        let cursor = low.min.clone();
        if state.persisted.as_ref().is_some_and(|p| p.key_eq(&cursor)) {
            state.persisted_token = token;
            return Ok(());
        }

        let progress = TableProgress {
            row_copy_complete: false,
            max_id_value: state.max.clone(),
            curr_id_value: Some(cursor.clone()),
        };
        save_progress(&self.session, table, &progress).await?;
        tracing::debug!("Table {table}: copy cursor persisted at {cursor}");
        state.persisted = Some(cursor);
        state.persisted_token = token;
        Ok(())
    }

    fn publish(&self) {
        let snapshot = CopySnapshot {
            tables: self
                .tables
                .iter()
                .map(|(id, state)| (id.clone(), state.watermark()))
                .collect(),
        };
        self.snapshots.send_replace(snapshot);
    }
}
