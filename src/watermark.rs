//! Low/high watermark tracking over out-of-order acknowledgments.
//!
//! Units of work are registered in arrival order under a key that sorts in
//! that order, each with a count of acknowledgments still expected. The
//! first remaining key is the low watermark: everything before it has been
//! fully acknowledged. A tracker is owned by exactly one bookkeeping task.

use std::collections::BTreeMap;

/// What an acknowledgment did to its unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The key is not pending (never added or already completed).
    Unknown,
    /// The unit still expects this many acknowledgments.
    Pending(usize),
    /// The unit was fully acknowledged and removed.
    Completed,
}

#[derive(Debug, Clone)]
struct PendingUnit<V> {
    value: V,
    remaining: usize,
}

#[derive(Debug, Clone)]
pub struct WatermarkTracker<K, V> {
    pending: BTreeMap<K, PendingUnit<V>>,
    high: Option<(K, V)>,
}

impl<K: Ord + Clone, V: Clone> Default for WatermarkTracker<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone, V: Clone> WatermarkTracker<K, V> {
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            high: None,
        }
    }

    /// Register a unit expecting `count` acknowledgments. A unit with
    /// nothing to acknowledge completes immediately.
    pub fn add(&mut self, key: K, value: V, count: usize) {
        if count == 0 {
            self.complete(key, value);
            return;
        }
        self.pending.insert(
            key,
            PendingUnit {
                value,
                remaining: count,
            },
        );
    }

    pub fn ack(&mut self, key: &K) -> AckOutcome {
        let Some(unit) = self.pending.get_mut(key) else {
            return AckOutcome::Unknown;
        };
        unit.remaining = unit.remaining.saturating_sub(1);
        if unit.remaining > 0 {
            return AckOutcome::Pending(unit.remaining);
        }
        if let Some((key, unit)) = self.pending.remove_entry(key) {
            self.complete(key, unit.value);
        }
        AckOutcome::Completed
    }

    fn complete(&mut self, key: K, value: V) {
        let newer = match &self.high {
            Some((high, _)) => key > *high,
            None => true,
        };
        if newer {
            self.high = Some((key, value));
        }
    }

    /// Oldest still-pending unit, or the newest completed one when none
    /// remain.
    pub fn low(&self) -> Option<&V> {
        self.pending
            .values()
            .next()
            .map(|unit| &unit.value)
            .or_else(|| self.high())
    }

    /// Newest unit ever completed.
    pub fn high(&self) -> Option<&V> {
        self.high.as_ref().map(|(_, value)| value)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
