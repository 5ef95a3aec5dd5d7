use std::sync::Arc;

use anyhow::{anyhow, Result};
use rand::Rng;
use sync_core::{PrimaryRangeValue, Table};
use tokio::sync::mpsc;

use super::bookkeeping::CopyEvent;
use super::TableCursor;
use crate::endpoint::ScanStart;
use crate::session::Session;

/// A range to copy together with the metadata it was generated against.
#[derive(Debug, Clone)]
pub(crate) struct CopyWork {
    pub table: Arc<Table>,
    pub range: PrimaryRangeValue,
}

/// Emit ranges until every table is exhausted.
///
/// Ranges are closed and consecutive ranges of a table share their
/// boundary key: with keys `1, 2, 3` and a batch size of 2 the ranges are
/// `[1, 2]` and `[2, 3]`. Boundaries are looked up on the source, never past
/// the last key captured at startup, so the source's collation decides key
/// order. After the first range every lookup starts strictly after the
/// previous boundary and each range moves forward by at least one key. A
/// range is registered with the bookkeeping task before it is queued, so
/// its acknowledgment can never arrive first.
pub(crate) async fn generate(
    session: Session,
    mut cursors: Vec<TableCursor>,
    work: mpsc::Sender<CopyWork>,
    events: mpsc::Sender<CopyEvent>,
) -> Result<()> {
    let mut token: u64 = 0;

    while !cursors.is_empty() {
        let index = rand::rng().random_range(0..cursors.len());
        let cursor = &mut cursors[index];
        let id = cursor.table.id().clone();

        let start = if cursor.expanded {
            ScanStart::After
        } else {
            ScanStart::Including
        };
        let from = cursor.current.max.clone();
        let table = cursor.table.clone();
        let until = &cursor.max;
        let boundary = session
            .retry
            .run(format!("Finding next batch of {id} from {from}"), || {
                session.source.next_boundary(&table, &from, until, start)
            })
            .await?;

        let Some(next) = boundary else {
            tracing::debug!("Table {id}: all ranges generated");
            cursors.swap_remove(index);
            events
                .send(CopyEvent::Exhausted { table: id })
                .await
                .map_err(|_| anyhow!("Row copy bookkeeping stopped"))?;
            continue;
        };

        token += 1;
        let range = PrimaryRangeValue::new(
            token,
            &id.schema,
            &id.table,
            cursor.current.max.clone(),
            next,
        );
        cursor.current = range.clone();
        cursor.expanded = true;

        events
            .send(CopyEvent::Add {
                table: id.clone(),
                range: range.clone(),
            })
            .await
            .map_err(|_| anyhow!("Row copy bookkeeping stopped"))?;
        tracing::debug!("Generated range {range}");
        work.send(CopyWork {
            table: cursor.table.clone(),
            range,
        })
        .await
        .map_err(|_| anyhow!("All row copy workers stopped"))?;
    }

    tracing::debug!("Range generation finished after {token} ranges");
    Ok(())
}
