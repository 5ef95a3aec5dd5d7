//! Runs the engines of one migration task side by side.

use std::sync::Arc;

use anyhow::{bail, Result};
use mysql_migrate_binlog_source::BinlogConnector;
use sync_core::LogFilePos;
use tokio::sync::{mpsc, watch};

use crate::binlog_apply::{prepare_start_position, ApplySummary, BinlogApplyEngine};
use crate::checksum::{ChecksumEngine, ChecksumSummary};
use crate::config::EngineOptions;
use crate::row_copy::{CopySummary, RowCopyEngine};
use crate::session::Session;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationSummary {
    pub copy: CopySummary,
    pub checksum: Option<ChecksumSummary>,
    pub apply: Option<ApplySummary>,
}

pub struct Migration {
    session: Session,
    options: EngineOptions,
    connector: Option<Arc<dyn BinlogConnector>>,
    apply: bool,
    start_position: Option<LogFilePos>,
}

impl Migration {
    pub fn new(session: Session, options: EngineOptions) -> Self {
        Self {
            session,
            options,
            connector: None,
            apply: false,
            start_position: None,
        }
    }

    /// Capture the binlog start position through `connector` before copying,
    /// and apply the binlog alongside the copy when `apply` is set.
    pub fn with_binlog(mut self, connector: Arc<dyn BinlogConnector>, apply: bool) -> Self {
        self.connector = Some(connector);
        self.apply = apply;
        self
    }

    /// Start position to persist when none is stored yet.
    pub fn with_start_position(mut self, start: Option<LogFilePos>) -> Self {
        self.start_position = start;
        self
    }

    pub async fn run(self) -> Result<MigrationSummary> {
        let Migration {
            session,
            options,
            connector,
            apply,
            start_position,
        } = self;
        options.validate()?;
        if session.tables.is_empty() {
            bail!("No tables to migrate");
        }

        if let Some(connector) = &connector {
            let start = prepare_start_position(&session, connector.as_ref(), start_position).await?;
            tracing::info!("Changes from {start} onwards will be replayed by binlog apply");
        }

        let (copy_done_tx, copy_done_rx) = watch::channel(false);
        let mut copy = RowCopyEngine::new(session.clone(), options.clone())
            .with_completion_signal(copy_done_tx);

        let checksum = if options.checksum {
            let (ranges_tx, ranges_rx) = mpsc::channel(options.queue_capacity.max(1));
            copy = copy.with_checksum(ranges_tx);
            Some(ChecksumEngine::new(session.clone(), options.clone()).start(ranges_rx, copy_done_rx))
        } else {
            None
        };

        let apply = match (connector, apply) {
            (Some(connector), true) => {
                Some(BinlogApplyEngine::new(session.clone(), options.clone(), connector).start())
            }
            _ => None,
        };

        let (copy, checksum, apply) = tokio::try_join!(
            copy.start(),
            async {
                match checksum {
                    Some(engine) => engine.await.map(Some),
                    None => Ok(None),
                }
            },
            async {
                match apply {
                    Some(engine) => engine.await.map(Some),
                    None => Ok(None),
                }
            },
        )?;

        Ok(MigrationSummary {
            copy,
            checksum,
            apply,
        })
    }
}
