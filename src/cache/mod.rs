//! Cache backends used as the shared coordination substrate.
//!
//! The engine never keeps counters in process memory; every call goes
//! through a [`CacheBackend`], so several processes sharing one cache
//! cluster observe the same windows.

mod memory;
#[cfg(feature = "redis")]
mod redis;

use std::fmt::Debug;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use memory::MemoryCache;
#[cfg(feature = "redis")]
pub use self::redis::RedisCache;

/// Value stored per cache key: the counter and the start of its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowState {
    /// Events counted in the window
    pub count: u64,
    /// Unix seconds at which the window started
    pub window_start: u64,
}

impl WindowState {
    /// Create a new window state.
    pub fn new(count: u64, window_start: u64) -> Self {
        Self {
            count,
            window_start,
        }
    }
}

/// Key-value cache with TTL expiry.
///
/// Implementations must make each single operation atomic with respect to
/// concurrent callers on the same key.
pub trait CacheBackend: Send + Sync + Debug {
    /// Read the state stored under `key`.
    fn get(&self, key: &str) -> Result<Option<WindowState>>;

    /// Store `state` only if `key` is absent. Returns whether it was stored.
    fn add(&self, key: &str, state: WindowState, ttl: Duration) -> Result<bool>;

    /// Store `state` unconditionally.
    fn set(&self, key: &str, state: WindowState, ttl: Duration) -> Result<()>;

    /// Remove `key`.
    fn delete(&self, key: &str) -> Result<()>;

    /// Replace the state under `key` with `new` only if it currently equals
    /// `expected`.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: WindowState,
        new: WindowState,
        ttl: Duration,
    ) -> Result<bool>;

    /// Atomically add `delta` to the counter when the stored window starts at
    /// `window_start`, otherwise store `(delta, window_start)` with `ttl`.
    /// Incrementing does not extend the expiry.
    ///
    /// Returns `Ok(None)` when the backend has no such primitive; callers
    /// then emulate it with [`compare_and_swap`](Self::compare_and_swap).
    fn increment_or_create(
        &self,
        _key: &str,
        _delta: u64,
        _window_start: u64,
        _ttl: Duration,
    ) -> Result<Option<WindowState>> {
        Ok(None)
    }
}

/// Wrapper that hides the native increment of a backend, forcing the
/// compare-and-swap path.
#[derive(Debug, Clone)]
pub struct CasOnly<C>(pub C);

impl<C: CacheBackend> CacheBackend for CasOnly<C> {
    fn get(&self, key: &str) -> Result<Option<WindowState>> {
        self.0.get(key)
    }

    fn add(&self, key: &str, state: WindowState, ttl: Duration) -> Result<bool> {
        self.0.add(key, state, ttl)
    }

    fn set(&self, key: &str, state: WindowState, ttl: Duration) -> Result<()> {
        self.0.set(key, state, ttl)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.0.delete(key)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: WindowState,
        new: WindowState,
        ttl: Duration,
    ) -> Result<bool> {
        self.0.compare_and_swap(key, expected, new, ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    #[test]
    fn test_cas_only_hides_native_increment() {
        let cache = CasOnly(MemoryCache::new(Arc::new(ManualClock::new(0))));
        let res = cache
            .increment_or_create("k", 1, 0, Duration::from_secs(10))
            .unwrap();
        assert!(res.is_none());
        assert_eq!(cache.get("k").unwrap(), None);
    }
}
