//! Plumbing shared by the engines' task pipelines.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

/// Receiving half of a bounded queue drained by several workers.
pub(crate) type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

pub(crate) fn work_queue<T>(capacity: usize) -> (mpsc::Sender<T>, SharedReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (tx, Arc::new(Mutex::new(rx)))
}

/// Next item for a worker; `None` once every sender is gone and the queue
/// is drained.
pub(crate) async fn next_item<T>(rx: &SharedReceiver<T>) -> Option<T> {
    rx.lock().await.recv().await
}

/// Wait for every task of a stage. The first failure is returned and the
/// remaining tasks are aborted.
pub(crate) async fn join_stage(mut tasks: JoinSet<Result<()>>, stage: &str) -> Result<()> {
    while let Some(joined) = tasks.join_next().await {
        joined.with_context(|| format!("{stage} task panicked"))??;
    }
    Ok(())
}
