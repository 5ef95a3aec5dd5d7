//! Checksum and reconciliation engine.
//!
//! Phase 1 compares an aggregate checksum of every copied range on both
//! sides and records a diff for each mismatch. Phase 2 starts once phase 1
//! has drained and row copy has finished: it sweeps the unfixed diffs,
//! repairs them row by row and marks a diff fixed only after the range
//! checks out consistent again.

mod phase1;
mod phase2;

use anyhow::{anyhow, Result};
use sync_core::{PrimaryRangeValue, Table};
use tokio::sync::{mpsc, watch};

use crate::config::EngineOptions;
use crate::session::Session;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChecksumSummary {
    pub ranges_checked: u64,
    pub mismatches: u64,
    pub fixed: u64,
    /// Diffs still unfixed when phase 2 gave up.
    pub unfixed: u64,
    pub rounds: u32,
}

pub struct ChecksumEngine {
    session: Session,
    options: EngineOptions,
}

impl ChecksumEngine {
    pub fn new(session: Session, options: EngineOptions) -> Self {
        Self { session, options }
    }

    /// Verify every range received on `ranges`, then run the repair sweep
    /// once `copy_done` turns `true`.
    pub async fn start(
        self,
        ranges: mpsc::Receiver<PrimaryRangeValue>,
        mut copy_done: watch::Receiver<bool>,
    ) -> Result<ChecksumSummary> {
        tracing::info!(
            "Checksum phase 1 starting with {} workers",
            self.options.checksum_parallelism
        );
        let phase1 = phase1::verify_ranges(
            &self.session,
            ranges,
            self.options.checksum_parallelism,
        )
        .await?;
        tracing::info!(
            "Checksum phase 1 finished: {} ranges checked, {} mismatches",
            phase1.ranges_checked,
            phase1.mismatches
        );

        copy_done
            .wait_for(|done| *done)
            .await
            .map_err(|_| anyhow!("Row copy ended without completing, skipping repair"))?;

        let phase2 = self.repair().await?;
        Ok(ChecksumSummary {
            ranges_checked: phase1.ranges_checked,
            mismatches: phase1.mismatches,
            ..phase2
        })
    }

    /// Phase 2 on its own: sweep and repair the recorded diffs.
    pub async fn repair(self) -> Result<ChecksumSummary> {
        phase2::repair_diffs(&self.session, &self.options).await
    }
}

/// Whether a range has the same row count and checksum on both sides.
pub(crate) async fn range_consistent(
    session: &Session,
    table: &Table,
    range: &PrimaryRangeValue,
) -> Result<bool> {
    let source = session
        .retry
        .run(format!("Checksumming source range {range}"), || {
            session.source.range_checksum(table, &range.min, &range.max)
        })
        .await?;
    let target = session
        .retry
        .run(format!("Checksumming target range {range}"), || {
            session.target.range_checksum(table, &range.min, &range.max)
        })
        .await?;
    if source != target {
        tracing::debug!(
            "Range {range} differs: source {} rows / {:x}, target {} rows / {:x}",
            source.count,
            source.checksum,
            target.count,
            target.checksum
        );
    }
    Ok(source == target)
}
