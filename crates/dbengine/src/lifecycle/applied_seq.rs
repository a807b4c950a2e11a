//! Applied sequence tracking for metadata log truncation.

use crate::page::MetricUuid;
use std::collections::BTreeMap;
use std::sync::RwLock;

#[derive(Debug, Default)]
struct AppliedSeqState {
    highest_recorded: Option<u64>,
    pending: BTreeMap<u64, MetricUuid>,
}

/// Tracks which deletion events still have pages on disk or in cache.
///
/// A `DeleteDimension` event stays pending until no page of its metric
/// remains anywhere. Chart events carry no pages and count as applied as soon
/// as they are recorded.
///
/// # Examples
/// ```rust,ignore
/// use alopex_dbengine::lifecycle::applied_seq::AppliedSeqTracker;
///
/// let tracker = AppliedSeqTracker::new();
/// tracker.notify_recorded(1, None);
/// tracker.notify_recorded(2, Some(uuid));
/// assert_eq!(tracker.safe_sequence(), Some(1));
/// ```
#[derive(Debug, Default)]
pub struct AppliedSeqTracker {
    inner: RwLock<AppliedSeqState>,
}

impl AppliedSeqTracker {
    /// Creates a new tracker with empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a durable metadata event. `uuid` is the deleted dimension, if
    /// any.
    pub fn notify_recorded(&self, seq: u64, uuid: Option<MetricUuid>) {
        let mut state = self.inner.write().unwrap_or_else(|err| err.into_inner());
        state.highest_recorded = Some(state.highest_recorded.map_or(seq, |h| h.max(seq)));
        if let Some(uuid) = uuid {
            state.pending.insert(seq, uuid);
        }
    }

    /// Marks every pending event of `uuid` applied.
    pub fn notify_applied(&self, uuid: &MetricUuid) {
        let mut state = self.inner.write().unwrap_or_else(|err| err.into_inner());
        state.pending.retain(|_, pending| pending != uuid);
    }

    /// Metrics with at least one pending event.
    pub fn pending_uuids(&self) -> Vec<MetricUuid> {
        let state = self.inner.read().unwrap_or_else(|err| err.into_inner());
        let mut uuids: Vec<MetricUuid> = state.pending.values().copied().collect();
        uuids.sort_unstable();
        uuids.dedup();
        uuids
    }

    /// Number of pending events.
    pub fn pending_len(&self) -> usize {
        let state = self.inner.read().unwrap_or_else(|err| err.into_inner());
        state.pending.len()
    }

    /// Highest sequence up to which every event has been applied.
    ///
    /// Formula: min(highest_recorded, min(pending) - 1).
    /// Returns None if nothing has been recorded.
    pub fn safe_sequence(&self) -> Option<u64> {
        let state = self.inner.read().unwrap_or_else(|err| err.into_inner());
        let highest = state.highest_recorded?;
        let safe = match state.pending.keys().next() {
            Some(&min_pending) => highest.min(min_pending.saturating_sub(1)),
            None => highest,
        };
        Some(safe)
    }
}
