//! In-process cache backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::{CacheBackend, WindowState};
use crate::clock::Clock;
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: WindowState,
    expires_at: u64,
}

/// Writes between two sweeps of expired slots.
pub const DEFAULT_PURGE_INTERVAL: u64 = 1024;

/// Sharded in-memory cache with clock-driven expiry.
///
/// Each operation holds the shard lock of its key, which makes
/// [`increment_or_create`](CacheBackend::increment_or_create) atomic.
/// Expired slots are dropped on access, and every `purge_interval` writes
/// a sweep drops those of keys nobody reads again.
#[derive(Debug)]
pub struct MemoryCache {
    slots: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
    writes: AtomicU64,
    purge_interval: u64,
}

impl MemoryCache {
    /// Create an empty cache reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_purge_interval(clock, DEFAULT_PURGE_INTERVAL)
    }

    /// Like [`new`](Self::new), sweeping every `interval` writes. Zero
    /// disables the sweep.
    pub fn with_purge_interval(clock: Arc<dyn Clock>, interval: u64) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
            writes: AtomicU64::new(0),
            purge_interval: interval,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.slots.iter().filter(|s| s.expires_at > now).count()
    }

    /// Whether no live entry remains.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry.
    pub fn purge_expired(&self) {
        let now = self.clock.now();
        self.slots.retain(|_, slot| slot.expires_at > now);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.slots.clear();
    }

    fn expiry(&self, ttl: Duration) -> u64 {
        self.clock.now().saturating_add(ttl.as_secs().max(1))
    }

    /// Count a write and sweep when due. Must not run under an entry guard.
    fn wrote(&self) {
        if self.purge_interval == 0 {
            return;
        }
        let n = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.purge_interval == 0 {
            let before = self.slots.len();
            self.purge_expired();
            trace!(dropped = before.saturating_sub(self.slots.len()), "Swept expired slots");
        }
    }
}

impl CacheBackend for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<WindowState>> {
        let now = self.clock.now();
        let slot = self.slots.get(key).map(|s| *s);
        match slot {
            Some(slot) if slot.expires_at > now => Ok(Some(slot.state)),
            Some(_) => {
                self.slots.remove_if(key, |_, s| s.expires_at <= now);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn add(&self, key: &str, state: WindowState, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        let stored = match self.slots.entry(key.to_string()) {
            Entry::Occupied(e) if e.get().expires_at > now => false,
            Entry::Occupied(mut e) => {
                e.insert(Slot { state, expires_at });
                true
            }
            Entry::Vacant(e) => {
                e.insert(Slot { state, expires_at });
                true
            }
        };
        if stored {
            self.wrote();
        }
        Ok(stored)
    }

    fn set(&self, key: &str, state: WindowState, ttl: Duration) -> Result<()> {
        let expires_at = self.expiry(ttl);
        self.slots.insert(key.to_string(), Slot { state, expires_at });
        self.wrote();
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.slots.remove(key);
        Ok(())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: WindowState,
        new: WindowState,
        ttl: Duration,
    ) -> Result<bool> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                let slot = e.get();
                if slot.expires_at <= now || slot.state != expected {
                    return Ok(false);
                }
                e.insert(Slot {
                    state: new,
                    expires_at,
                });
                Ok(true)
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    fn increment_or_create(
        &self,
        key: &str,
        delta: u64,
        window_start: u64,
        ttl: Duration,
    ) -> Result<Option<WindowState>> {
        let now = self.clock.now();
        let fresh = Slot {
            state: WindowState::new(delta, window_start),
            expires_at: self.expiry(ttl),
        };
        let state = match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                let slot = e.get_mut();
                if slot.expires_at > now && slot.state.window_start == window_start {
                    slot.state.count = slot.state.count.saturating_add(delta);
                    slot.state
                } else {
                    trace!(key = %key, window_start, "Replacing stale window");
                    *slot = fresh;
                    fresh.state
                }
            }
            Entry::Vacant(e) => {
                e.insert(fresh);
                fresh.state
            }
        };
        self.wrote();
        Ok(Some(state))
    }
}
