//! Epoch anchors for RESET_EPOCH.
//!
//! An [`EpochTracker`] is a caller-owned side table that remembers how many
//! times it contributed to each counter. Resetting "to the epoch" then undoes
//! exactly those contributions, e.g. forgiving the failed attempts of a
//! request once the login succeeded. The engine only borrows trackers.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Per-cache-key record of INCREASE calls made on behalf of one caller.
#[derive(Debug, Default)]
pub struct EpochTracker {
    counts: Mutex<HashMap<String, i64>>,
}

impl EpochTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one INCREASE against `cache_key`.
    pub(crate) fn record(&self, cache_key: &str) -> i64 {
        let mut counts = self.counts.lock();
        let entry = counts.entry(cache_key.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Number of increments recorded for `cache_key`.
    pub fn calls(&self, cache_key: &str) -> i64 {
        self.counts.lock().get(cache_key).copied().unwrap_or(0)
    }

    /// Forget `amount` recorded increments for `cache_key`. Increments
    /// recorded meanwhile are kept.
    pub(crate) fn forget(&self, cache_key: &str, amount: i64) {
        let mut counts = self.counts.lock();
        if let Some(entry) = counts.get_mut(cache_key) {
            *entry -= amount;
            if *entry <= 0 {
                counts.remove(cache_key);
            }
        }
    }
}

/// Anchor used by RESET_EPOCH and [`Ratelimit::reset`](super::Ratelimit::reset).
#[derive(Debug, Clone, Copy)]
pub enum Epoch<'a> {
    /// Undo the increments recorded by this tracker.
    Tracker(&'a EpochTracker),
    /// Subtract a raw amount; negative values advance the counter.
    Delta(i64),
}

impl<'a> Epoch<'a> {
    /// Record an INCREASE if this epoch tracks calls.
    pub(crate) fn record(&self, cache_key: &str) {
        if let Epoch::Tracker(tracker) = self {
            tracker.record(cache_key);
        }
    }

    /// Amount to subtract from the stored counter.
    pub(crate) fn amount(&self, cache_key: &str) -> i64 {
        match self {
            Epoch::Tracker(tracker) => tracker.calls(cache_key),
            Epoch::Delta(amount) => *amount,
        }
    }

    /// Mark `amount` as undone once the counter was adjusted.
    pub(crate) fn settle(&self, cache_key: &str, amount: i64) {
        if let Epoch::Tracker(tracker) = self {
            tracker.forget(cache_key, amount);
        }
    }
}

impl<'a> From<&'a EpochTracker> for Epoch<'a> {
    fn from(tracker: &'a EpochTracker) -> Self {
        Epoch::Tracker(tracker)
    }
}
