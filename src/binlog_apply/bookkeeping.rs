use std::time::Duration;

use anyhow::Result;
use checkpoint::PositionKind;
use sync_core::LogFilePos;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use super::ApplySnapshot;
use crate::session::Session;
use crate::watermark::{AckOutcome, WatermarkTracker};

/// Arrival sequence number and resume coordinate of a rows event. The
/// sequence number keeps map order equal to arrival order even when a
/// reconnect delivers an event a second time.
pub(crate) type PendingKey = (u64, LogFilePos);

#[derive(Debug, Clone)]
pub(crate) enum ApplyEvent {
    /// A rows event was split into `count` operations about to be queued.
    Register { key: PendingKey, count: usize },
    /// One operation of a unit was applied.
    Ack { key: PendingKey },
    /// The parser moved past an event.
    Parsed(LogFilePos),
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ApplyReport {
    pub operations_applied: u64,
    pub applied: Option<LogFilePos>,
}

/// Sole owner of the pending-unit map of binlog apply.
pub(crate) struct ApplyBookkeeper {
    session: Session,
    interval: Duration,
    tracker: WatermarkTracker<PendingKey, LogFilePos>,
    parsed: Option<LogFilePos>,
    persisted_parsed: Option<LogFilePos>,
    persisted_applied: Option<LogFilePos>,
    rollback: Option<LogFilePos>,
    operations_applied: u64,
    snapshots: watch::Sender<ApplySnapshot>,
}

impl ApplyBookkeeper {
    pub fn new(
        session: Session,
        interval: Duration,
        applied: Option<LogFilePos>,
        snapshots: watch::Sender<ApplySnapshot>,
    ) -> Self {
        Self {
            session,
            interval,
            tracker: WatermarkTracker::new(),
            parsed: None,
            persisted_parsed: None,
            persisted_applied: applied,
            rollback: None,
            operations_applied: 0,
            snapshots,
        }
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<ApplyEvent>) -> Result<ApplyReport> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = ticker.tick() => self.persist().await?,
            }
        }

        self.persist().await?;
        if !self.tracker.is_empty() {
            tracing::warn!(
                "Binlog apply stopped with {} unacknowledged events",
                self.tracker.pending_len()
            );
        }
        Ok(ApplyReport {
            operations_applied: self.operations_applied,
            applied: self.persisted_applied,
        })
    }

    fn handle(&mut self, event: ApplyEvent) {
        match event {
            ApplyEvent::Register { key, count } => {
                let resume = key.1.clone();
                self.tracker.add(key, resume, count);
            }
            ApplyEvent::Ack { key } => {
                self.operations_applied += 1;
                if self.tracker.ack(&key) == AckOutcome::Unknown {
                    tracing::warn!("Acknowledgment for unknown binlog event at {}", key.1);
                }
            }
            ApplyEvent::Parsed(pos) => self.parsed = Some(pos),
        }
        self.publish();
    }

    async fn persist(&mut self) -> Result<()> {
        let session = &self.session;

        if let Some(parsed) = &self.parsed {
            if self.persisted_parsed.as_ref() != Some(parsed) {
                session
                    .retry
                    .run("Saving parsed position", || {
                        session
                            .store
                            .save_position(&session.task_id, PositionKind::Parsed, parsed)
                    })
                    .await?;
                self.persisted_parsed = Some(parsed.clone());
            }
        }

        let Some(low) = self.tracker.low().cloned() else {
            self.publish();
            return Ok(());
        };
        let advanced = match &self.persisted_applied {
            Some(persisted) => low > *persisted,
            None => true,
        };
        if advanced {
            session
                .retry
                .run("Saving applied position", || {
                    session
                        .store
                        .save_position(&session.task_id, PositionKind::Applied, &low)
                })
                .await?;
            tracing::debug!("Applied position persisted at {low}");
            self.persisted_applied = Some(low);

            let rollback = session
                .retry
                .run("Reading target binlog position", || {
                    session.target.master_status()
                })
                .await?;
            session
                .retry
                .run("Saving rollback position", || {
                    session.store.save_rollback_position(
                        &session.task_id,
                        session.target.name(),
                        &rollback,
                    )
                })
                .await?;
            self.rollback = Some(rollback);
        }
        self.publish();
        Ok(())
    }

    fn publish(&self) {
        self.snapshots.send_replace(ApplySnapshot {
            parsed: self.parsed.clone(),
            low: self.tracker.low().cloned(),
            high: self.tracker.high().cloned(),
            pending: self.tracker.pending_len(),
            applied: self.persisted_applied.clone(),
            rollback: self.rollback.clone(),
        });
    }
}
