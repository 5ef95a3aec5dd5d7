//! Row-copy engine.
//!
//! Copies every row of every configured table once, in key ranges:
//!
//! ```text
//! generator ──ranges──▶ workers (N) ──rows──▶ target
//!     │                    │
//!     └──Add──▶ bookkeeping ◀──Ack──┘ ──▶ progress store
//! ```
//!
//! The generator looks up range boundaries one table at a time, picked at
//! random among the unfinished ones. Workers copy ranges in any order. The
//! bookkeeping task is the only owner of the per-table watermark state and
//! persists each table's resume cursor.

mod bookkeeping;
mod generator;
mod worker;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use checkpoint::TableProgress;
use sync_core::{KeyValue, PrimaryRangeValue, Table, TableId};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::config::EngineOptions;
use crate::pipeline::{join_stage, work_queue};
use crate::session::Session;

pub use bookkeeping::CopyEvent;

/// Watermarks of one table as last seen by the bookkeeping task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableWatermark {
    /// Ranges generated but not yet acknowledged.
    pub pending: usize,
    /// Oldest pending range, or the last completed one.
    pub low: Option<PrimaryRangeValue>,
    /// Newest acknowledged range.
    pub high: Option<PrimaryRangeValue>,
    /// Last cursor written to the progress store.
    pub persisted: Option<KeyValue>,
    pub complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CopySnapshot {
    pub tables: BTreeMap<TableId, TableWatermark>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopySummary {
    pub tables_completed: usize,
    pub ranges_copied: u64,
    pub rows_copied: u64,
}

/// Where copying a table starts from.
#[derive(Debug, Clone)]
pub(crate) struct TableCursor {
    pub table: Arc<Table>,
    /// Last key of the source at startup.
    pub max: KeyValue,
    /// Furthest range generated so far.
    pub current: PrimaryRangeValue,
    /// Whether `current` is still the `[first, first]` seed.
    pub expanded: bool,
}

pub struct RowCopyEngine {
    session: Session,
    options: EngineOptions,
    checksum: Option<mpsc::Sender<PrimaryRangeValue>>,
    copy_done: Option<watch::Sender<bool>>,
    snapshots: watch::Sender<CopySnapshot>,
}

impl RowCopyEngine {
    pub fn new(session: Session, options: EngineOptions) -> Self {
        let (snapshots, _) = watch::channel(CopySnapshot::default());
        Self {
            session,
            options,
            checksum: None,
            copy_done: None,
            snapshots,
        }
    }

    /// Forward every copied range to phase 1 checksumming.
    pub fn with_checksum(mut self, ranges: mpsc::Sender<PrimaryRangeValue>) -> Self {
        self.checksum = Some(ranges);
        self
    }

    /// Set to `true` once every table is complete.
    pub fn with_completion_signal(mut self, copy_done: watch::Sender<bool>) -> Self {
        self.copy_done = Some(copy_done);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<CopySnapshot> {
        self.snapshots.subscribe()
    }

    /// Copy until every table is complete.
    pub async fn start(self) -> Result<CopySummary> {
        let RowCopyEngine {
            session,
            options,
            checksum,
            copy_done,
            snapshots,
        } = self;
        options.validate()?;

        let (cursors, already_complete) = prepare_tables(&session).await?;
        tracing::info!(
            "Row copy starting: {} tables to copy, {} already complete",
            cursors.len(),
            already_complete.len()
        );

        let (events_tx, events_rx) = mpsc::channel(options.queue_capacity.max(1));
        let (work_tx, work_rx) = work_queue(options.queue_capacity);

        let mut bookkeeper = bookkeeping::CopyBookkeeper::new(
            session.clone(),
            options.checkpoint_interval,
            snapshots,
        );
        for cursor in &cursors {
            bookkeeper.track(cursor);
        }
        for table in &already_complete {
            bookkeeper.track_complete(table.clone());
        }
        let bookkeeping = tokio::spawn(bookkeeper.run(events_rx));

        let mut tasks = JoinSet::new();
        for worker_id in 0..options.copy_parallelism {
            tasks.spawn(
                worker::CopyWorker {
                    id: worker_id,
                    session: session.clone(),
                    write_mode: options.copy_write_mode,
                    events: events_tx.clone(),
                    checksum: checksum.clone(),
                }
                .run(work_rx.clone()),
            );
        }
        drop(checksum);
        tasks.spawn(generator::generate(session.clone(), cursors, work_tx, events_tx));

        join_stage(tasks, "Row copy").await?;
        let summary = bookkeeping
            .await
            .context("Row copy bookkeeping task panicked")??;

        tracing::info!(
            "Row copy finished: {} tables, {} ranges, {} rows",
            summary.tables_completed,
            summary.ranges_copied,
            summary.rows_copied
        );
        if let Some(copy_done) = copy_done {
            copy_done.send_replace(true);
        }
        Ok(summary)
    }
}

/// Resolve the copy bounds of every table that is not complete yet.
///
/// The table's last key is captured once and persisted; the cursor resumes
/// from the persisted low watermark when there is one, else from the first
/// key. Tables without rows are marked complete right away.
async fn prepare_tables(session: &Session) -> Result<(Vec<TableCursor>, Vec<TableId>)> {
    let mut cursors = Vec::new();
    let mut complete = Vec::new();

    for id in &session.tables {
        let table = session.metadata.resolve(id).await?;
        let mut progress = session
            .retry
            .run(format!("Loading copy progress of {id}"), || {
                session.store.load_table(&session.task_id, id)
            })
            .await?
            .unwrap_or_default();

        if progress.row_copy_complete {
            tracing::info!("Table {id} was already copied");
            complete.push(id.clone());
            continue;
        }

        let max = match progress.max_id_value.clone() {
            Some(max) => Some(max),
            None => {
                session
                    .retry
                    .run(format!("Reading last key of {id}"), || {
                        session.source.last_key(&table)
                    })
                    .await?
            }
        };
        let current = match (&max, progress.curr_id_value.clone()) {
            (None, _) => None,
            (Some(_), Some(current)) => Some(current),
            (Some(_), None) => {
                session
                    .retry
                    .run(format!("Reading first key of {id}"), || {
                        session.source.first_key(&table)
                    })
                    .await?
            }
        };

        let (Some(max), Some(current)) = (max, current) else {
            tracing::info!("Table {id} has no rows, nothing to copy");
            save_progress(
                session,
                id,
                &TableProgress {
                    row_copy_complete: true,
                    ..progress
                },
            )
            .await?;
            complete.push(id.clone());
            continue;
        };

        progress.max_id_value = Some(max.clone());
        progress.curr_id_value = Some(current.clone());
        save_progress(session, id, &progress).await?;
        tracing::info!("Table {id}: copying keys {current} ..= {max}");

        cursors.push(TableCursor {
            current: PrimaryRangeValue::new(
                0,
                &id.schema,
                &id.table,
                current.clone(),
                current,
            ),
            table,
            max,
            expanded: false,
        });
    }
    Ok((cursors, complete))
}

pub(crate) async fn save_progress(
    session: &Session,
    table: &TableId,
    progress: &TableProgress,
) -> Result<()> {
    session
        .retry
        .run(format!("Saving copy progress of {table}"), || {
            session.store.save_table(&session.task_id, table, progress)
        })
        .await
}
