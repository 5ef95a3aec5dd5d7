use std::time::Duration;

use anyhow::Result;
use sync_core::LogFilePos;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::session::Session;

/// Re-read the persisted stop coordinate every `interval` and publish it.
///
/// The poller runs beside the parser and never blocks it. It ends with an
/// error once reading the store exhausts the retry budget, which closes
/// the returned channel.
pub(crate) fn spawn_stop_poller(
    session: Session,
    interval: Duration,
) -> (watch::Receiver<Option<LogFilePos>>, JoinHandle<Result<()>>) {
    let (tx, rx) = watch::channel(None);
    let handle = tokio::spawn(async move {
        loop {
            let positions = session
                .retry
                .run("Reading stop position", || {
                    session.store.load_positions(&session.task_id)
                })
                .await?;
            tx.send_if_modified(|current| {
                if *current == positions.stop {
                    return false;
                }
                if let Some(stop) = &positions.stop {
                    tracing::info!("Binlog stop position set to {stop}");
                }
                *current = positions.stop.clone();
                true
            });
            tokio::time::sleep(interval).await;
        }
    });
    (rx, handle)
}
