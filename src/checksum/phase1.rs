use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use checkpoint::NewDiff;
use sync_core::{PrimaryRangeValue, TableId};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

use super::range_consistent;
use crate::pipeline::{join_stage, next_item, SharedReceiver};
use crate::session::Session;

#[derive(Debug, Default)]
pub(crate) struct PhaseOneCounts {
    pub ranges_checked: u64,
    pub mismatches: u64,
}

/// Check ranges until the input queue closes.
pub(crate) async fn verify_ranges(
    session: &Session,
    ranges: mpsc::Receiver<PrimaryRangeValue>,
    parallelism: usize,
) -> Result<PhaseOneCounts> {
    let ranges: SharedReceiver<PrimaryRangeValue> = Arc::new(Mutex::new(ranges));
    let checked = Arc::new(AtomicU64::new(0));
    let mismatches = Arc::new(AtomicU64::new(0));

    let mut workers = JoinSet::new();
    for _ in 0..parallelism.max(1) {
        let session = session.clone();
        let ranges = ranges.clone();
        let checked = checked.clone();
        let mismatches = mismatches.clone();
        workers.spawn(async move {
            while let Some(range) = next_item(&ranges).await {
                if !verify_range(&session, &range).await? {
                    mismatches.fetch_add(1, Ordering::Relaxed);
                }
                checked.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        });
    }
    join_stage(workers, "Checksum").await?;

    Ok(PhaseOneCounts {
        ranges_checked: checked.load(Ordering::Relaxed),
        mismatches: mismatches.load(Ordering::Relaxed),
    })
}

/// Compare one range, recording a diff when it is inconsistent.
async fn verify_range(session: &Session, range: &PrimaryRangeValue) -> Result<bool> {
    let id = TableId::new(&range.schema, &range.table);
    let table = session.metadata.resolve(&id).await?;
    if range_consistent(session, &table, range).await? {
        return Ok(true);
    }

    let diff = NewDiff {
        source: id,
        target: table.target_id().clone(),
        min_id_value: range.min.clone(),
        max_id_value: range.max.clone(),
    };
    let diff_id = session
        .retry
        .run(format!("Recording diff for {range}"), || {
            session.store.insert_diff(&session.task_id, diff.clone())
        })
        .await?;
    tracing::warn!("Range {range} is inconsistent, recorded as diff #{diff_id}");
    Ok(false)
}
