use std::cmp::Ordering;

use anyhow::{anyhow, Result};
use checkpoint::DiffRecord;
use sync_core::{KeyValue, PrimaryRangeValue, Table};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::{range_consistent, ChecksumSummary};
use crate::config::EngineOptions;
use crate::pipeline::{join_stage, next_item, work_queue};
use crate::session::Session;

/// Most diffs fetched by one poll of the store.
const DIFF_POLL_LIMIT: usize = 1000;

#[derive(Debug)]
struct FixOutcome {
    id: u64,
    fixed: bool,
}

/// Sweep the unfixed diffs until none remain or the round limit is hit.
///
/// The dispatcher owns the count of diffs handed to the fix workers and
/// polls the store again only once every outstanding diff reported back.
pub(crate) async fn repair_diffs(
    session: &Session,
    options: &EngineOptions,
) -> Result<ChecksumSummary> {
    let (fix_tx, fix_rx) = work_queue::<DiffRecord>(options.queue_capacity);
    let (done_tx, mut done_rx) = mpsc::channel::<FixOutcome>(options.queue_capacity.max(1));

    let mut workers = JoinSet::new();
    for _ in 0..options.fix_parallelism.max(1) {
        let session = session.clone();
        let fix_rx = fix_rx.clone();
        let done_tx = done_tx.clone();
        workers.spawn(async move {
            while let Some(record) = next_item(&fix_rx).await {
                let fixed = fix_diff(&session, &record).await?;
                done_tx
                    .send(FixOutcome {
                        id: record.id,
                        fixed,
                    })
                    .await
                    .map_err(|_| anyhow!("Checksum dispatcher stopped"))?;
            }
            Ok(())
        });
    }
    drop(done_tx);

    let mut summary = ChecksumSummary::default();
    loop {
        let unfixed = session
            .retry
            .run("Loading unfixed diffs", || {
                session.store.unfixed_diffs(&session.task_id, DIFF_POLL_LIMIT)
            })
            .await?;
        if unfixed.is_empty() {
            break;
        }
        summary.rounds += 1;
        tracing::info!(
            "Checksum phase 2 round {}: {} unfixed diffs",
            summary.rounds,
            unfixed.len()
        );

        let mut outstanding = 0usize;
        let mut failed = 0u64;
        let mut records = unfixed.into_iter();
        let mut next = records.next();
        while next.is_some() || outstanding > 0 {
            tokio::select! {
                sent = async {
                    match next.clone() {
                        Some(record) => fix_tx.send(record).await,
                        None => std::future::pending().await,
                    }
                } => {
                    sent.map_err(|_| anyhow!("All fix workers stopped"))?;
                    outstanding += 1;
                    next = records.next();
                }
                outcome = done_rx.recv() => {
                    let Some(outcome) = outcome else {
                        break;
                    };
                    outstanding -= 1;
                    if outcome.fixed {
                        summary.fixed += 1;
                    } else {
                        tracing::debug!("Diff #{} not confirmed fixed", outcome.id);
                        failed += 1;
                    }
                }
            }
        }
        if outstanding > 0 {
            break;
        }

        if failed > 0 {
            let limit = options.checksum_max_rounds;
            if limit != 0 && summary.rounds >= limit {
                tracing::warn!(
                    "Giving up on {failed} unconfirmed diffs after {} rounds",
                    summary.rounds
                );
                summary.unfixed = failed;
                break;
            }
            tokio::time::sleep(session.retry.backoff).await;
        }
    }

    drop(fix_tx);
    join_stage(workers, "Checksum repair").await?;
    tracing::info!(
        "Checksum phase 2 finished: {} fixed, {} unfixed",
        summary.fixed,
        summary.unfixed
    );
    Ok(summary)
}

/// Repair the range of one diff. Returns whether the range was confirmed
/// consistent afterwards; only then is the diff marked fixed.
async fn fix_diff(session: &Session, record: &DiffRecord) -> Result<bool> {
    let table = session.metadata.resolve(&record.source).await?;
    let range = PrimaryRangeValue::new(
        record.id,
        &record.source.schema,
        &record.source.table,
        record.min_id_value.clone(),
        record.max_id_value.clone(),
    );

    if !range_consistent(session, &table, &range).await? {
        let repaired = repair_rows(session, &table, &range).await?;
        tracing::info!("Diff #{} {range}: repaired {repaired} rows", record.id);
        if !range_consistent(session, &table, &range).await? {
            tracing::warn!(
                "Diff #{} {range} still inconsistent after repair, will retry",
                record.id
            );
            return Ok(false);
        }
    }

    session
        .retry
        .run(format!("Marking diff #{} fixed", record.id), || {
            session.store.mark_diff_fixed(&session.task_id, record.id)
        })
        .await?;
    Ok(true)
}

/// Compare the range row by row and make the target match the source.
async fn repair_rows(session: &Session, table: &Table, range: &PrimaryRangeValue) -> Result<usize> {
    let source_keys = session
        .retry
        .run(format!("Listing source keys of {range}"), || {
            session.source.range_keys(table, &range.min, &range.max)
        })
        .await?;
    let target_keys = session
        .retry
        .run(format!("Listing target keys of {range}"), || {
            session.target.range_keys(table, &range.min, &range.max)
        })
        .await?;

    let mut keys: Vec<KeyValue> = source_keys.into_iter().chain(target_keys).collect();
    keys.sort_by(|a, b| a.compare(b));
    keys.dedup_by(|a, b| a.compare(b) == Ordering::Equal);

    let mut repaired = 0;
    for key in &keys {
        let source = session
            .retry
            .run(format!("Checksumming source row {key}"), || {
                session.source.row_checksum(table, key)
            })
            .await?;
        let target = session
            .retry
            .run(format!("Checksumming target row {key}"), || {
                session.target.row_checksum(table, key)
            })
            .await?;
        if source == target {
            continue;
        }

        let row = match source {
            None => None,
            Some(_) => {
                session
                    .retry
                    .run(format!("Selecting source row {key}"), || {
                        session.source.select_row(table, key)
                    })
                    .await?
            }
        };
        match row {
            Some(row) => {
                session
                    .retry
                    .run(format!("Replacing target row {key}"), || {
                        session.target.replace_row(table, &row)
                    })
                    .await?
            }
            None => {
                session
                    .retry
                    .run(format!("Deleting target row {key}"), || {
                        session.target.delete_row(table, key)
                    })
                    .await?
            }
        }
        repaired += 1;
    }
    Ok(repaired)
}
