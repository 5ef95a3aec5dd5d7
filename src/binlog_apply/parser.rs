use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use mysql_migrate_binlog_source::{BinlogConnector, BinlogEvent, BinlogSource, RowsEvent};
use sync_core::{KeyValue, LogFilePos, RowOp, Side, Table};
use tokio::sync::{mpsc, watch};

use super::bookkeeping::{ApplyEvent, PendingKey};
use super::inflight::InflightCounter;
use super::worker::ApplyWork;
use crate::session::Session;

/// Index of the worker queue every operation on `key` goes to.
pub fn route(key: &KeyValue, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.canonical().hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ParseOutcome {
    pub events: u64,
    pub parsed: Option<LogFilePos>,
    pub reached_stop: bool,
}

/// The only reader of the replication stream.
pub(crate) struct Parser {
    pub session: Session,
    pub connector: Arc<dyn BinlogConnector>,
    pub queues: Vec<mpsc::Sender<ApplyWork>>,
    pub events: mpsc::Sender<ApplyEvent>,
    pub inflight: Arc<InflightCounter>,
    pub stop: watch::Receiver<Option<LogFilePos>>,
    pub seq: u64,
}

impl Parser {
    pub async fn run(mut self, from: LogFilePos) -> Result<ParseOutcome> {
        let mut outcome = ParseOutcome {
            parsed: Some(from.clone()),
            ..ParseOutcome::default()
        };
        let mut parsed = from.clone();
        // Where a new stream can pick up without losing a table map.
        let mut reconnect_from = from.clone();
        let mut source = self.connect(&reconnect_from).await?;
        let mut failures = 0u32;

        loop {
            if let Some(stop) = self.stop.borrow().as_ref() {
                if parsed >= *stop {
                    tracing::info!("Parsed position {parsed} reached stop position {stop}");
                    outcome.reached_stop = true;
                    break;
                }
            }

            let next = tokio::select! {
                next = source.next_event() => next,
                changed = self.stop.changed() => {
                    if changed.is_err() {
                        bail!("Stop position poller stopped");
                    }
                    continue;
                }
            };

            let event = match next {
                Ok(Some(event)) => {
                    failures = 0;
                    event
                }
                Ok(None) => {
                    tracing::info!("Binlog stream closed at {parsed}");
                    break;
                }
                Err(e) => {
                    failures += 1;
                    let budget = self.session.retry.budget;
                    if failures >= budget {
                        return Err(e).with_context(|| {
                            format!("Reading binlog failed after {budget} attempts at {parsed}")
                        });
                    }
                    tracing::warn!(
                        "Binlog stream failed at {parsed} (attempt {failures}/{budget}): {e:#}. \
                         Reconnecting from {reconnect_from}"
                    );
                    tokio::time::sleep(self.session.retry.backoff).await;
                    source = self.connect(&reconnect_from).await?;
                    continue;
                }
            };

            match &event {
                BinlogEvent::Rows(rows) => {
                    self.distribute(rows).await?;
                    reconnect_from = rows.resume.clone();
                }
                BinlogEvent::Rotate { next } => reconnect_from = next.clone(),
                BinlogEvent::Other { end } => reconnect_from = end.clone(),
            }
            parsed = event.end().clone();
            outcome.events += 1;
            outcome.parsed = Some(parsed.clone());
            self.events
                .send(ApplyEvent::Parsed(parsed.clone()))
                .await
                .map_err(|_| anyhow!("Binlog bookkeeping stopped"))?;
        }

        Ok(outcome)
    }

    async fn connect(&self, from: &LogFilePos) -> Result<Box<dyn BinlogSource>> {
        self.session
            .retry
            .run(format!("Opening binlog stream at {from}"), || {
                self.connector.connect(from)
            })
            .await
    }

    /// Current metadata of the event's table, rebuilt first when the event's
    /// column count shows the layout changed.
    async fn table_for(&self, rows: &RowsEvent) -> Result<Arc<Table>> {
        let table = self.session.metadata.resolve(&rows.table).await?;
        if rows.column_count == table.column_count() {
            return Ok(table);
        }

        let id = &rows.table;
        tracing::info!(
            "Column count of {id} changed from {} to {} at {}, draining {} in-flight operations",
            table.column_count(),
            rows.column_count,
            rows.end,
            self.inflight.count(id)
        );
        self.inflight.wait_drained(id).await;
        let rebuilt = self
            .session
            .retry
            .run(format!("Rebuilding metadata of {id}"), || {
                self.session.metadata.rebuild(id)
            })
            .await?;
        if rebuilt.column_count() != rows.column_count {
            bail!(
                "Table {id} has {} columns after rebuild but the binlog event at {} has {}",
                rebuilt.column_count(),
                rows.end,
                rows.column_count
            );
        }
        Ok(rebuilt)
    }

    async fn distribute(&mut self, rows: &RowsEvent) -> Result<()> {
        if !self.session.includes(&rows.table) {
            return Ok(());
        }
        let table = self.table_for(rows).await?;
        let mutations = rows
            .mutations(table.columns(Side::Source))
            .with_context(|| format!("Failed to decode rows of {} at {}", rows.table, rows.end))?;
        let ops: Vec<RowOp> = mutations
            .into_iter()
            .flat_map(|mutation| mutation.plan(&table))
            .collect();
        if ops.is_empty() {
            return Ok(());
        }

        self.seq += 1;
        let key: PendingKey = (self.seq, rows.resume.clone());
        self.inflight.add(table.id(), ops.len());
        self.events
            .send(ApplyEvent::Register {
                key: key.clone(),
                count: ops.len(),
            })
            .await
            .map_err(|_| anyhow!("Binlog bookkeeping stopped"))?;

        for op in ops {
            let worker = route(op.key(), self.queues.len());
            self.queues[worker]
                .send(ApplyWork {
                    table: table.clone(),
                    unit: key.clone(),
                    op,
                })
                .await
                .map_err(|_| anyhow!("Apply worker {worker} stopped"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::ColumnValue;

    fn id(value: i64) -> KeyValue {
        KeyValue::from_parts(["id"], vec![ColumnValue::Int(value)])
    }

    #[test]
    fn test_route_is_stable_per_key() {
        for workers in [1, 3, 8] {
            for value in 0..50 {
                let first = route(&id(value), workers);
                assert!(first < workers);
                assert_eq!(first, route(&id(value), workers));
            }
        }
    }

    #[test]
    fn test_route_ignores_integer_signedness() {
        let unsigned = KeyValue::from_parts(["id"], vec![ColumnValue::UInt(42)]);
        assert_eq!(route(&id(42), 16), route(&unsigned, 16));
    }

    #[test]
    fn test_route_spreads_keys() {
        let used: std::collections::HashSet<usize> = (0..200).map(|v| route(&id(v), 4)).collect();
        assert_eq!(used.len(), 4);
    }
}
