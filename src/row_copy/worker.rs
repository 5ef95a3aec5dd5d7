use anyhow::{anyhow, Result};
use sync_core::PrimaryRangeValue;
use tokio::sync::mpsc;

use super::bookkeeping::CopyEvent;
use super::generator::CopyWork;
use crate::config::WriteMode;
use crate::pipeline::{next_item, SharedReceiver};
use crate::session::Session;

pub(crate) struct CopyWorker {
    pub id: usize,
    pub session: Session,
    pub write_mode: WriteMode,
    pub events: mpsc::Sender<CopyEvent>,
    pub checksum: Option<mpsc::Sender<PrimaryRangeValue>>,
}

impl CopyWorker {
    pub async fn run(mut self, work: SharedReceiver<CopyWork>) -> Result<()> {
        let mut copied = 0u64;
        while let Some(CopyWork { table, range }) = next_item(&work).await {
            let session = &self.session;
            let rows = session
                .retry
                .run(format!("Selecting range {range}"), || {
                    session
                        .source
                        .select_range_rows(&table, &range.min, &range.max)
                })
                .await?;
            session
                .retry
                .run(format!("Writing range {range}"), || {
                    session.target.insert_rows(&table, &rows, self.write_mode)
                })
                .await?;
            tracing::debug!("Worker {} copied {} rows of {range}", self.id, rows.len());

            self.events
                .send(CopyEvent::Ack {
                    table: table.id().clone(),
                    token: range.token,
                    rows: rows.len() as u64,
                })
                .await
                .map_err(|_| anyhow!("Row copy bookkeeping stopped"))?;
            copied += 1;

            if let Some(checksum) = &self.checksum {
                if checksum.send(range).await.is_err() {
                    tracing::warn!("Checksum engine is gone, copied ranges are no longer verified");
                    self.checksum = None;
                }
            }
        }
        tracing::debug!("Copy worker {} finished after {copied} ranges", self.id);
        Ok(())
    }
}
