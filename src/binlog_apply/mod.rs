//! Binlog-apply engine.
//!
//! Streams row events from the source and applies them to the target:
//!
//! ```text
//! parser ──key hash──▶ worker queue 0..N ──▶ target
//!   │                        │
//!   └─Register/Parsed─▶ bookkeeping ◀─Ack─┘ ──▶ progress store
//! ```
//!
//! Every operation on one key lands on the same single-consumer queue, so
//! changes to a row are applied in binlog order. Nothing is ordered across
//! rows. The applied position persisted by the bookkeeping task is the
//! resume coordinate of the oldest event not fully applied; restarting
//! there re-applies some events, which the idempotent writes absorb.

mod bookkeeping;
mod inflight;
mod parser;
mod stop;
mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use checkpoint::PositionKind;
use mysql_migrate_binlog_source::BinlogConnector;
use sync_core::LogFilePos;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::config::EngineOptions;
use crate::pipeline::join_stage;
use crate::session::Session;

pub use inflight::InflightCounter;
pub use parser::route;

/// Watermarks of binlog apply as last seen by the bookkeeping task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplySnapshot {
    pub parsed: Option<LogFilePos>,
    /// Resume coordinate of the oldest pending event, or of the last
    /// completed one.
    pub low: Option<LogFilePos>,
    pub high: Option<LogFilePos>,
    pub pending: usize,
    /// Last applied position written to the progress store.
    pub applied: Option<LogFilePos>,
    /// Target position captured with the last applied position.
    pub rollback: Option<LogFilePos>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplySummary {
    pub events_parsed: u64,
    pub operations_applied: u64,
    pub parsed: Option<LogFilePos>,
    pub applied: Option<LogFilePos>,
    pub reached_stop: bool,
}

/// Make sure a position to start streaming from is persisted, and return
/// the one apply will resume from.
///
/// Runs before row copy starts so that changes made while copying are
/// replayed afterwards. `explicit` is only used when nothing is persisted;
/// otherwise the source's current coordinate is captured.
pub async fn prepare_start_position(
    session: &Session,
    connector: &dyn BinlogConnector,
    explicit: Option<LogFilePos>,
) -> Result<LogFilePos> {
    let positions = session
        .retry
        .run("Loading binlog positions", || {
            session.store.load_positions(&session.task_id)
        })
        .await?;
    if let Some(resume) = positions.resume_from() {
        return Ok(resume.clone());
    }

    let start = match explicit {
        Some(start) => start,
        None => {
            session
                .retry
                .run("Reading source binlog position", || {
                    connector.current_position()
                })
                .await?
        }
    };
    session
        .retry
        .run("Saving start position", || {
            session
                .store
                .save_position(&session.task_id, PositionKind::Start, &start)
        })
        .await?;
    tracing::info!("Binlog start position captured at {start}");
    Ok(start)
}

pub struct BinlogApplyEngine {
    session: Session,
    options: EngineOptions,
    connector: Arc<dyn BinlogConnector>,
    snapshots: watch::Sender<ApplySnapshot>,
    inflight: Arc<InflightCounter>,
}

impl BinlogApplyEngine {
    pub fn new(session: Session, options: EngineOptions, connector: Arc<dyn BinlogConnector>) -> Self {
        let (snapshots, _) = watch::channel(ApplySnapshot::default());
        Self {
            session,
            options,
            connector,
            snapshots,
            inflight: Arc::new(InflightCounter::new()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ApplySnapshot> {
        self.snapshots.subscribe()
    }

    /// Apply until the stream ends or the stop position is reached, then
    /// drain every queued operation.
    pub async fn start(self) -> Result<ApplySummary> {
        let BinlogApplyEngine {
            session,
            options,
            connector,
            snapshots,
            inflight,
        } = self;

        let from = prepare_start_position(&session, connector.as_ref(), None).await?;
        let positions = session
            .retry
            .run("Loading binlog positions", || {
                session.store.load_positions(&session.task_id)
            })
            .await?;
        tracing::info!(
            "Binlog apply starting at {from} with {} workers",
            options.apply_parallelism
        );

        let (events_tx, events_rx) = mpsc::channel(options.queue_capacity.max(1));
        let bookkeeper = bookkeeping::ApplyBookkeeper::new(
            session.clone(),
            options.checkpoint_interval,
            positions.applied,
            snapshots,
        );
        let bookkeeping = tokio::spawn(bookkeeper.run(events_rx));

        let mut workers = JoinSet::new();
        let mut queues = Vec::with_capacity(options.apply_parallelism);
        for id in 0..options.apply_parallelism.max(1) {
            let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
            queues.push(tx);
            workers.spawn(
                worker::ApplyWorker {
                    id,
                    session: session.clone(),
                    events: events_tx.clone(),
                    inflight: inflight.clone(),
                }
                .run(rx),
            );
        }

        let (stop, poller) = stop::spawn_stop_poller(session.clone(), options.stop_poll_interval);
        let parser = parser::Parser {
            session: session.clone(),
            connector,
            queues,
            events: events_tx,
            inflight,
            stop,
            seq: 0,
        };

        let parsed = tokio::select! {
            biased;
            failed = join_stage_early(&mut workers) => Err(failed),
            parsed = parser.run(from) => parsed,
        };
        poller.abort();
        let outcome = match parsed {
            Ok(outcome) => outcome,
            Err(e) => match poller.await {
                Ok(Err(poller_error)) => return Err(poller_error),
                _ => return Err(e),
            },
        };

        join_stage(workers, "Binlog apply").await?;
        let report = bookkeeping
            .await
            .context("Binlog bookkeeping task panicked")??;

        let summary = ApplySummary {
            events_parsed: outcome.events,
            operations_applied: report.operations_applied,
            parsed: outcome.parsed,
            applied: report.applied,
            reached_stop: outcome.reached_stop,
        };
        tracing::info!(
            "Binlog apply finished: {} events, {} operations, applied up to {}",
            summary.events_parsed,
            summary.operations_applied,
            summary
                .applied
                .as_ref()
                .map_or_else(|| "nothing".to_string(), ToString::to_string)
        );
        Ok(summary)
    }
}

/// Resolve with the first worker failure; stays pending while workers run.
async fn join_stage_early(workers: &mut JoinSet<Result<()>>) -> anyhow::Error {
    loop {
        match workers.join_next().await {
            Some(Ok(Ok(()))) => continue,
            Some(Ok(Err(e))) => return e,
            Some(Err(e)) => return anyhow::Error::new(e).context("Apply worker panicked"),
            None => return std::future::pending().await,
        }
    }
}
