use std::sync::Arc;

use anyhow::{anyhow, Result};
use sync_core::{RowOp, Table};
use tokio::sync::mpsc;

use super::bookkeeping::{ApplyEvent, PendingKey};
use super::inflight::InflightCounter;
use crate::session::Session;

/// One row operation and the pending unit it belongs to.
#[derive(Debug, Clone)]
pub(crate) struct ApplyWork {
    pub table: Arc<Table>,
    pub unit: PendingKey,
    pub op: RowOp,
}

/// Applies the operations of one queue strictly in arrival order.
pub(crate) struct ApplyWorker {
    pub id: usize,
    pub session: Session,
    pub events: mpsc::Sender<ApplyEvent>,
    pub inflight: Arc<InflightCounter>,
}

impl ApplyWorker {
    pub async fn run(self, mut queue: mpsc::Receiver<ApplyWork>) -> Result<()> {
        let mut applied = 0u64;
        while let Some(ApplyWork { table, unit, op }) = queue.recv().await {
            let session = &self.session;
            match &op {
                RowOp::Replace { key, row } => {
                    session
                        .retry
                        .run(format!("Replacing {key} in {}", table.target_id()), || {
                            session.target.replace_row(&table, row)
                        })
                        .await?
                }
                RowOp::Delete { key } => {
                    session
                        .retry
                        .run(format!("Deleting {key} from {}", table.target_id()), || {
                            session.target.delete_row(&table, key)
                        })
                        .await?
                }
            }
            applied += 1;
            self.inflight.done(table.id());
            self.events
                .send(ApplyEvent::Ack { key: unit })
                .await
                .map_err(|_| anyhow!("Binlog bookkeeping stopped"))?;
        }
        tracing::debug!("Apply worker {} finished after {applied} operations", self.id);
        Ok(())
    }
}
