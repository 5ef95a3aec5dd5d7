use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use sync_core::TableId;
use tokio::sync::Notify;

/// Per-table count of row operations queued but not yet applied.
///
/// Read on every rows event, written by every worker; the parser waits on
/// it before swapping in rebuilt table metadata.
#[derive(Debug, Default)]
pub struct InflightCounter {
    counts: Mutex<HashMap<TableId, usize>>,
    drained: Notify,
}

impl InflightCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, table: &TableId, n: usize) {
        if n == 0 {
            return;
        }
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        *counts.entry(table.clone()).or_default() += n;
    }

    pub fn done(&self, table: &TableId) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(count) = counts.get_mut(table) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            counts.remove(table);
            drop(counts);
            self.drained.notify_waiters();
        }
    }

    pub fn count(&self, table: &TableId) -> usize {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .copied()
            .unwrap_or(0)
    }

    /// Resolve once no operation of `table` is in flight.
    pub async fn wait_drained(&self, table: &TableId) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count(table) == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_drained_returns_immediately_when_idle() {
        let counter = InflightCounter::new();
        counter.wait_drained(&TableId::new("app", "t")).await;
    }

    #[tokio::test]
    async fn test_wait_drained_waits_for_last_done() {
        let counter = Arc::new(InflightCounter::new());
        let table = TableId::new("app", "t");
        counter.add(&table, 2);

        let waiter = {
            let counter = counter.clone();
            let table = table.clone();
            tokio::spawn(async move { counter.wait_drained(&table).await })
        };

        counter.done(&table);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        counter.done(&table);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counter.count(&table), 0);
    }

    #[test]
    fn test_tables_are_counted_separately() {
        let counter = InflightCounter::new();
        let a = TableId::new("app", "a");
        let b = TableId::new("app", "b");
        counter.add(&a, 3);
        counter.add(&b, 1);
        counter.done(&b);
        assert_eq!(counter.count(&a), 3);
        assert_eq!(counter.count(&b), 0);
    }
}
