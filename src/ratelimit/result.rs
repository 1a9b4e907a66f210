//! The outcome of one evaluation and the block/wait policy.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::Clock;
use crate::error::{RatelimitError, Result};

use super::window::WindowCache;
use super::{Epoch, EpochTracker};

/// Suspension primitive used while waiting for a window to end.
#[async_trait]
pub trait Waiter: Send + Sync + fmt::Debug {
    /// Suspend the calling task for `duration`.
    async fn wait(&self, duration: Duration);
}

/// Waits on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioWaiter;

#[async_trait]
impl Waiter for TokioWaiter {
    async fn wait(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// How [`Ratelimit::reset`] changes the counter.
#[derive(Debug, Clone, Copy)]
pub enum ResetAmount<'a> {
    /// Subtract a raw amount (negative adds), bounded below by zero.
    Delta(i64),
    /// Undo the increments recorded by a tracker.
    Epoch(&'a EpochTracker),
}

impl From<i64> for ResetAmount<'_> {
    fn from(delta: i64) -> Self {
        ResetAmount::Delta(delta)
    }
}

impl<'a> From<&'a EpochTracker> for ResetAmount<'a> {
    fn from(tracker: &'a EpochTracker) -> Self {
        ResetAmount::Epoch(tracker)
    }
}

impl<'a> From<ResetAmount<'a>> for Epoch<'a> {
    fn from(amount: ResetAmount<'a>) -> Self {
        match amount {
            ResetAmount::Delta(delta) => Epoch::Delta(delta),
            ResetAmount::Epoch(tracker) => Epoch::Tracker(tracker),
        }
    }
}

/// Cache handle kept by results that counted through the cache.
#[derive(Debug, Clone)]
pub(crate) struct ResetHandle {
    pub window: WindowCache,
    pub cache_key: String,
    pub period: u64,
}

/// Snapshot of one evaluation.
///
/// A result never changes after construction. Resetting through it changes
/// the cache, not the result; evaluate again to observe the new state.
#[derive(Clone)]
pub struct Ratelimit {
    group: String,
    count: u64,
    limit: Option<u64>,
    request_limit: u64,
    end: u64,
    handle: Option<ResetHandle>,
    clock: Arc<dyn Clock>,
}

impl Ratelimit {
    /// A call that was not limited at all.
    pub(crate) fn passthrough(group: String, clock: Arc<dyn Clock>) -> Self {
        Self {
            group,
            count: 0,
            limit: None,
            request_limit: 0,
            end: 0,
            handle: None,
            clock,
        }
    }

    /// The result carried by a `Disabled` signal.
    pub(crate) fn disabled(group: String, clock: Arc<dyn Clock>) -> Self {
        Self {
            group,
            count: 0,
            limit: Some(0),
            request_limit: 1,
            end: 0,
            handle: None,
            clock,
        }
    }

    /// A result computed without touching the cache.
    pub(crate) fn fixed(group: String, count: u64, limit: u64, end: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            group,
            count,
            limit: Some(limit),
            request_limit: count.saturating_sub(limit),
            end,
            handle: None,
            clock,
        }
    }

    /// A result backed by a cache counter.
    pub(crate) fn counted(
        group: String,
        count: u64,
        limit: u64,
        end: u64,
        handle: ResetHandle,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            group,
            count,
            limit: Some(limit),
            request_limit: count.saturating_sub(limit),
            end,
            handle: Some(handle),
            clock,
        }
    }

    /// Group the result belongs to.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Count observed by the evaluation.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Events allowed per window; `None` when the call was not limited.
    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Events over the limit; positive means over budget.
    pub fn request_limit(&self) -> u64 {
        self.request_limit
    }

    /// Unix seconds at which the window ends.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Cache key of the counter, if the result has one.
    pub fn cache_key(&self) -> Option<&str> {
        self.handle.as_ref().map(|h| h.cache_key.as_str())
    }

    pub fn can_reset(&self) -> bool {
        self.handle.is_some()
    }

    pub fn is_exceeded(&self) -> bool {
        self.request_limit > 0
    }

    /// Seconds until the window ends.
    pub fn remaining_secs(&self) -> u64 {
        self.end.saturating_sub(self.clock.now())
    }

    /// Whether the call is within budget. With `block`, an exceeded budget
    /// is an [`RatelimitError::Exceeded`] error instead.
    pub fn check(&self, block: bool) -> Result<bool> {
        if self.request_limit == 0 {
            return Ok(true);
        }
        if block {
            debug!(group = %self.group, count = self.count, "Ratelimit exceeded, blocking");
            return Err(RatelimitError::Exceeded(Box::new(self.clone())));
        }
        Ok(false)
    }

    /// Like [`check`](Self::check), but with `wait` an exceeded call first
    /// sleeps until the window ends. The answer still reflects this result.
    pub async fn acheck(&self, wait: bool, block: bool) -> Result<bool> {
        self.acheck_with(&TokioWaiter, wait, block).await
    }

    /// [`acheck`](Self::acheck) with an explicit suspension primitive.
    pub async fn acheck_with(&self, waiter: &dyn Waiter, wait: bool, block: bool) -> Result<bool> {
        if self.request_limit > 0 && wait {
            let remaining = self.remaining_secs();
            if remaining > 0 {
                debug!(group = %self.group, remaining, "Waiting for window end");
                waiter.wait(Duration::from_secs(remaining)).await;
            }
        }
        self.check(block)
    }

    /// Reset the counter behind this result and return its count before the
    /// reset. `None` deletes the counter; an amount adjusts it.
    pub fn reset(&self, amount: Option<ResetAmount<'_>>) -> Result<u64> {
        let handle = self.handle.as_ref().ok_or(RatelimitError::NoReset)?;
        match amount {
            None => handle.window.reset(&handle.cache_key, handle.period),
            Some(amount) => {
                let (before, _) =
                    handle
                        .window
                        .reset_epoch(&handle.cache_key, handle.period, amount.into())?;
                Ok(before)
            }
        }
    }

    /// Async counterpart of [`reset`](Self::reset).
    pub async fn areset(&self, amount: Option<ResetAmount<'_>>) -> Result<u64> {
        self.reset(amount)
    }

    /// Combine with a result of another limiter on the same call.
    ///
    /// A blocking result wins over a non-blocking one. Otherwise the result
    /// whose window ends sooner absorbs the other's overage; on a tie `self`
    /// absorbs.
    pub fn merged(&self, other: &Ratelimit) -> Ratelimit {
        match (self.is_exceeded(), other.is_exceeded()) {
            (true, false) => self.clone(),
            (false, true) => other.clone(),
            _ => {
                let (mut absorbing, absorbed) = if self.end > other.end {
                    (other.clone(), self)
                } else {
                    (self.clone(), other)
                };
                absorbing.request_limit += absorbed.request_limit;
                absorbing
            }
        }
    }

    /// Serializable view of the result.
    pub fn snapshot(&self) -> RatelimitSnapshot {
        RatelimitSnapshot {
            group: self.group.clone(),
            count: self.count,
            limit: self.limit,
            request_limit: self.request_limit,
            end: self.end,
            can_reset: self.can_reset(),
        }
    }
}

impl fmt::Debug for Ratelimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ratelimit")
            .field("group", &self.group)
            .field("count", &self.count)
            .field("limit", &self.limit)
            .field("request_limit", &self.request_limit)
            .field("end", &self.end)
            .field("can_reset", &self.can_reset())
            .finish()
    }
}

impl PartialEq for Ratelimit {
    fn eq(&self, other: &Self) -> bool {
        self.snapshot() == other.snapshot()
    }
}

/// Plain data view of a [`Ratelimit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatelimitSnapshot {
    pub group: String,
    pub count: u64,
    pub limit: Option<u64>,
    pub request_limit: u64,
    pub end: u64,
    pub can_reset: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::clock::ManualClock;
    use crate::ratelimit::{Action, RateSpec};
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct RecordingWaiter {
        waits: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Waiter for RecordingWaiter {
        async fn wait(&self, duration: Duration) {
            self.waits.lock().push(duration);
        }
    }

    fn counted(clock: Arc<ManualClock>, count: u64) -> (WindowCache, Ratelimit) {
        let cache = Arc::new(MemoryCache::new(clock.clone()));
        let window = WindowCache::new(cache, clock.clone());
        let rate = RateSpec::new(2, 60).unwrap();
        let mut out = None;
        for _ in 0..count {
            out = Some(window.apply("k", rate, Action::Increase, None).unwrap());
        }
        let out = out.unwrap();
        let handle = ResetHandle {
            window: window.clone(),
            cache_key: "k".to_string(),
            period: 60,
        };
        let result = Ratelimit::counted("g".into(), out.after, 2, out.end, handle, clock);
        (window, result)
    }

    fn fixed(request_limit: u64, end: u64) -> Ratelimit {
        Ratelimit::fixed(
            "g".into(),
            1 + request_limit,
            1,
            end,
            Arc::new(ManualClock::new(0)),
        )
    }

    #[test]
    fn test_check_within_budget() {
        let (_, result) = counted(Arc::new(ManualClock::new(0)), 2);
        assert_eq!(result.request_limit(), 0);
        assert!(result.check(true).unwrap());
    }

    #[test]
    fn test_check_over_budget() {
        let (_, result) = counted(Arc::new(ManualClock::new(0)), 3);
        assert_eq!(result.request_limit(), 1);
        assert!(!result.check(false).unwrap());
        match result.check(true) {
            Err(RatelimitError::Exceeded(r)) => assert_eq!(r.count(), 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reset_returns_prior_count() {
        let clock = Arc::new(ManualClock::new(0));
        let (window, result) = counted(clock, 3);
        assert!(result.can_reset());
        assert_eq!(result.reset(None).unwrap(), 3);
        let rate = RateSpec::new(2, 60).unwrap();
        assert_eq!(window.apply("k", rate, Action::Peek, None).unwrap().after, 0);
        // the result itself is unchanged
        assert_eq!(result.count(), 3);
    }

    #[test]
    fn test_reset_with_delta() {
        let clock = Arc::new(ManualClock::new(0));
        let (window, result) = counted(clock, 3);
        assert_eq!(result.reset(Some(ResetAmount::Delta(2))).unwrap(), 3);
        let rate = RateSpec::new(2, 60).unwrap();
        assert_eq!(window.apply("k", rate, Action::Peek, None).unwrap().after, 1);
    }

    #[test]
    fn test_bypass_result_cannot_reset() {
        let result = fixed(0, 10);
        assert!(!result.can_reset());
        assert!(matches!(result.reset(None), Err(RatelimitError::NoReset)));
    }

    #[test]
    fn test_merged_prefers_blocking() {
        let ok = fixed(0, 10);
        let blocked = fixed(2, 20);
        assert_eq!(ok.merged(&blocked), blocked);
        assert_eq!(blocked.merged(&ok), blocked);
    }

    #[test]
    fn test_merged_sooner_window_absorbs() {
        let a = fixed(2, 10);
        let b = fixed(3, 20);
        let merged = a.merged(&b);
        assert_eq!(merged.end(), 10);
        assert_eq!(merged.request_limit(), 5);
        let merged = b.merged(&a);
        assert_eq!(merged.end(), 10);
        assert_eq!(merged.request_limit(), 5);
    }

    #[test]
    fn test_snapshot_serializes() {
        let (_, result) = counted(Arc::new(ManualClock::new(0)), 1);
        let json = serde_json::to_value(result.snapshot()).unwrap();
        assert_eq!(json["group"], "g");
        assert_eq!(json["count"], 1);
        assert_eq!(json["limit"], 2);
        assert_eq!(json["can_reset"], true);
    }

    #[tokio::test]
    async fn test_acheck_waits_only_when_over_budget() {
        let clock = Arc::new(ManualClock::new(15));
        let waiter = RecordingWaiter::default();

        let (_, within) = counted(clock.clone(), 1);
        assert!(within.acheck_with(&waiter, true, true).await.unwrap());
        assert!(waiter.waits.lock().is_empty());

        let (_, over) = counted(clock.clone(), 3);
        assert!(!over.acheck_with(&waiter, true, false).await.unwrap());
        assert_eq!(*waiter.waits.lock(), vec![Duration::from_secs(45)]);
    }

    #[tokio::test]
    async fn test_acheck_blocks_after_waiting() {
        let clock = Arc::new(ManualClock::new(0));
        let waiter = RecordingWaiter::default();
        let (_, over) = counted(clock, 3);
        let err = over.acheck_with(&waiter, true, true).await.unwrap_err();
        assert!(matches!(err, RatelimitError::Exceeded(_)));
        assert_eq!(waiter.waits.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acheck_sleeps_until_window_end() {
        let clock = Arc::new(ManualClock::new(50));
        let (window, over) = counted(clock, 3);
        let started = tokio::time::Instant::now();
        assert!(!over.acheck(true, false).await.unwrap());
        assert!(started.elapsed() >= Duration::from_secs(10));

        // waiting did not count again
        let rate = RateSpec::new(2, 60).unwrap();
        assert_eq!(window.apply("k", rate, Action::Peek, None).unwrap().after, 3);
    }
}
