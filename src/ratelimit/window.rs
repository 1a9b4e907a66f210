//! Fixed-window counter protocol on top of a [`CacheBackend`].
//!
//! Windows are aligned to multiples of the period. Each cache entry stores
//! the start of the window it counts, so an entry that outlived its window
//! is recognized as stale and never leaks counts into the next one.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::cache::{CacheBackend, WindowState};
use crate::clock::Clock;
use crate::error::{RatelimitError, Result};

use super::{Action, Epoch, RateSpec};

/// Attempts of the compare-and-swap emulation before giving up.
pub const MAX_CAS_ATTEMPTS: u32 = 4;

/// Start of the window containing `now`.
pub fn window_start(now: u64, period: u64) -> u64 {
    (now / period) * period
}

/// Counter values around one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    /// Count in the current window before the operation
    pub before: u64,
    /// Count in the current window after the operation
    pub after: u64,
    /// Start of the current window
    pub window_start: u64,
    /// End of the current window
    pub end: u64,
}

/// A cache together with the clock that aligns its windows.
#[derive(Clone)]
pub struct WindowCache {
    cache: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
}

impl WindowCache {
    pub fn new(cache: Arc<dyn CacheBackend>, clock: Arc<dyn Clock>) -> Self {
        Self { cache, clock }
    }

    /// Run `action` against the counter under `key`.
    ///
    /// RESET_EPOCH without an epoch only reads, like PEEK.
    pub fn apply(
        &self,
        key: &str,
        rate: RateSpec,
        action: Action,
        epoch: Option<Epoch<'_>>,
    ) -> Result<WindowOutcome> {
        let period = rate.period();
        let start = window_start(self.clock.now(), period);
        let outcome = |before, after| WindowOutcome {
            before,
            after,
            window_start: start,
            end: start + period,
        };

        match action {
            Action::Peek => {
                let count = self.current(key, start)?;
                Ok(outcome(count, count))
            }
            Action::Increase => {
                let after = self.increase(key, start, period)?;
                if let Some(epoch) = epoch {
                    epoch.record(key);
                }
                Ok(outcome(after.saturating_sub(1), after))
            }
            Action::Reset => {
                let before = self.reset(key, period)?;
                Ok(outcome(before, 0))
            }
            Action::ResetEpoch => match epoch {
                Some(epoch) => {
                    let (before, after) = self.reset_epoch(key, period, epoch)?;
                    Ok(outcome(before, after))
                }
                None => {
                    trace!(key = %key, "RESET_EPOCH without epoch, peeking");
                    let count = self.current(key, start)?;
                    Ok(outcome(count, count))
                }
            },
        }
    }

    /// Delete the counter under `key`, returning its count in the current
    /// window.
    pub fn reset(&self, key: &str, period: u64) -> Result<u64> {
        let start = window_start(self.clock.now(), period);
        let before = self.current(key, start)?;
        self.cache.delete(key)?;
        debug!(key = %key, before, "Counter reset");
        Ok(before)
    }

    /// Undo what `epoch` contributed to the counter under `key`. Returns the
    /// counts before and after.
    ///
    /// A tracker forgets the undone increments only once the adjustment is
    /// stored.
    pub fn reset_epoch(&self, key: &str, period: u64, epoch: Epoch<'_>) -> Result<(u64, u64)> {
        let start = window_start(self.clock.now(), period);
        let before = self.current(key, start)?;
        let amount = epoch.amount(key);
        let after = self.adjust(key, period, amount)?;
        epoch.settle(key, amount);
        Ok((before, after))
    }

    /// Subtract `amount` from the counter under `key` (negative amounts add),
    /// bounded below by zero. A missing or stale counter is left alone; the
    /// next INCREASE or the expiry replaces it.
    ///
    /// Returns the count after the adjustment. The expiry is not extended.
    pub fn adjust(&self, key: &str, period: u64, amount: i64) -> Result<u64> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let start = window_start(now, period);
            let state = match self.cache.get(key)? {
                Some(state) if state.window_start == start => state,
                _ => return Ok(0),
            };

            let count = apply_delta(state.count, amount);
            if count == state.count {
                return Ok(count);
            }
            let ttl = remaining(now, start, period);
            if self
                .cache
                .compare_and_swap(key, state, WindowState::new(count, start), ttl)?
            {
                trace!(key = %key, amount, count, "Counter adjusted");
                return Ok(count);
            }
            debug!(key = %key, attempt, "Adjustment raced, retrying");
        }
        warn!(key = %key, attempts = MAX_CAS_ATTEMPTS, "Giving up adjusting counter");
        Err(RatelimitError::BackendRace {
            key: key.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    /// Count under `key` in the window starting at `start`.
    fn current(&self, key: &str, start: u64) -> Result<u64> {
        Ok(match self.cache.get(key)? {
            Some(state) if state.window_start == start => state.count,
            _ => 0,
        })
    }

    fn increase(&self, key: &str, start: u64, period: u64) -> Result<u64> {
        let ttl = Duration::from_secs(period);
        if let Some(state) = self.cache.increment_or_create(key, 1, start, ttl)? {
            trace!(key = %key, count = state.count, "Counter incremented");
            return Ok(state.count);
        }

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let swapped = match self.cache.get(key)? {
                None => self.cache.add(key, WindowState::new(1, start), ttl)?.then_some(1),
                Some(state) if state.window_start == start => {
                    let next = WindowState::new(state.count.saturating_add(1), start);
                    let ttl = remaining(self.clock.now(), start, period);
                    self.cache
                        .compare_and_swap(key, state, next, ttl)?
                        .then_some(next.count)
                }
                Some(stale) => {
                    debug!(key = %key, stale_start = stale.window_start, "Window rolled over");
                    self.cache
                        .compare_and_swap(key, stale, WindowState::new(1, start), ttl)?
                        .then_some(1)
                }
            };
            if let Some(count) = swapped {
                trace!(key = %key, count, attempt, "Counter incremented via compare-and-swap");
                return Ok(count);
            }
            debug!(key = %key, attempt, "Increment raced, retrying");
        }

        warn!(key = %key, attempts = MAX_CAS_ATTEMPTS, "Giving up incrementing counter");
        Err(RatelimitError::BackendRace {
            key: key.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }
}

fn apply_delta(count: u64, amount: i64) -> u64 {
    if amount >= 0 {
        count.saturating_sub(amount.unsigned_abs())
    } else {
        count.saturating_add(amount.unsigned_abs())
    }
}

fn remaining(now: u64, start: u64, period: u64) -> Duration {
    Duration::from_secs((start + period).saturating_sub(now).max(1))
}

impl fmt::Debug for WindowCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowCache")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}
