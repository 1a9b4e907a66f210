//! Pre-configured limiters guarding a unit of work.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::context::RequestContext;
use crate::error::{RatelimitError, Result};

use super::{
    Action, Engine, Group, HashAlgorithm, HashMode, KeySpec, MethodSet, Query, Rate, Ratelimit,
    TokioWaiter, Waiter,
};

/// Per-request storage for the result of the limiters that ran on it.
///
/// Several limiters on the same request share one slot; each stores its
/// result by merging with what is already there, or by replacing it.
#[derive(Debug, Default)]
pub struct RatelimitSlot {
    inner: Mutex<Option<Ratelimit>>,
}

impl RatelimitSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored result, if any.
    pub fn get(&self) -> Option<Ratelimit> {
        self.inner.lock().clone()
    }

    /// Store `result` and return what the slot now holds.
    pub fn store(&self, result: Ratelimit, replace: bool) -> Ratelimit {
        let mut inner = self.inner.lock();
        let stored = match inner.as_ref() {
            Some(existing) if !replace => existing.merged(&result),
            _ => result,
        };
        *inner = Some(stored.clone());
        stored
    }

    pub fn take(&self) -> Option<Ratelimit> {
        self.inner.lock().take()
    }
}

/// A limiter with a fixed configuration. Every check counts one event.
///
/// Blocks by default: an exceeded budget is reported as
/// [`RatelimitError::Exceeded`].
pub struct RateLimiter {
    engine: Arc<Engine>,
    group: Group,
    key: KeySpec,
    rate: Rate,
    methods: MethodSet,
    block: bool,
    wait: bool,
    replace: bool,
    empty_to: KeySpec,
    cache: Option<String>,
    prefix: Option<String>,
    hash_algorithm: Option<HashAlgorithm>,
    hash_mode: HashMode,
    waiter: Arc<dyn Waiter>,
}

impl RateLimiter {
    pub fn new(
        engine: Arc<Engine>,
        group: impl Into<Group>,
        key: KeySpec,
        rate: impl Into<Rate>,
    ) -> Self {
        Self {
            engine,
            group: group.into(),
            key,
            rate: rate.into(),
            methods: MethodSet::all(),
            block: true,
            wait: false,
            replace: false,
            empty_to: KeySpec::default(),
            cache: None,
            prefix: None,
            hash_algorithm: None,
            hash_mode: HashMode::default(),
            waiter: Arc::new(TokioWaiter),
        }
    }

    pub fn with_methods(mut self, methods: MethodSet) -> Self {
        self.methods = methods;
        self
    }

    pub fn with_block(mut self, block: bool) -> Self {
        self.block = block;
        self
    }

    /// Sleep until the window ends before answering an exceeded check.
    /// Only the async checks support this.
    pub fn with_wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    /// Replace the slot's result instead of merging with it.
    pub fn with_replace(mut self, replace: bool) -> Self {
        self.replace = replace;
        self
    }

    pub fn with_empty_to(mut self, empty_to: impl Into<KeySpec>) -> Self {
        self.empty_to = empty_to.into();
        self
    }

    pub fn with_cache(mut self, name: impl Into<String>) -> Self {
        self.cache = Some(name.into());
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_hash_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.hash_algorithm = Some(algorithm);
        self
    }

    pub fn with_hash_mode(mut self, mode: HashMode) -> Self {
        self.hash_mode = mode;
        self
    }

    pub fn with_waiter(mut self, waiter: Arc<dyn Waiter>) -> Self {
        self.waiter = waiter;
        self
    }

    pub fn blocks(&self) -> bool {
        self.block
    }

    pub fn waits(&self) -> bool {
        self.wait
    }

    fn query<'a>(&self, context: &'a dyn RequestContext) -> Query<'a> {
        let mut query = Query::new(self.group.clone(), self.key.clone(), self.rate.clone())
            .context(context)
            .methods(self.methods.clone())
            .action(Action::Increase)
            .empty_to(self.empty_to.clone())
            .hash_mode(self.hash_mode);
        if let Some(cache) = &self.cache {
            query = query.cache(cache.clone());
        }
        if let Some(prefix) = &self.prefix {
            query = query.prefix(prefix.clone());
        }
        if let Some(algorithm) = self.hash_algorithm {
            query = query.hash_algorithm(algorithm);
        }
        query
    }

    fn record(&self, outcome: Result<Ratelimit>, slot: Option<&RatelimitSlot>) -> Result<Ratelimit> {
        match outcome {
            Ok(result) => Ok(match slot {
                Some(slot) => slot.store(result, self.replace),
                None => result,
            }),
            Err(RatelimitError::Disabled(result)) => {
                debug!(group = %result.group(), "Limiter disabled by zero limit");
                if let Some(slot) = slot {
                    slot.store((*result).clone(), self.replace);
                }
                Err(RatelimitError::Disabled(result))
            }
            Err(e) => Err(e),
        }
    }

    /// Count this call and answer whether it may proceed.
    pub fn check(&self, context: &dyn RequestContext, slot: Option<&RatelimitSlot>) -> Result<bool> {
        if self.wait {
            return Err(RatelimitError::Config(
                "waiting requires the async check".to_string(),
            ));
        }
        let outcome = self.engine.get_ratelimit(&self.query(context));
        let current = self.record(outcome, slot)?;
        trace!(group = %current.group(), count = current.count(), "Limiter checked");
        current.check(self.block)
    }

    /// Async counterpart of [`check`](Self::check), honoring the wait policy.
    pub async fn acheck(
        &self,
        context: &dyn RequestContext,
        slot: Option<&RatelimitSlot>,
    ) -> Result<bool> {
        let outcome = self.engine.aget_ratelimit(&self.query(context)).await;
        let current = self.record(outcome, slot)?;
        trace!(group = %current.group(), count = current.count(), "Limiter checked");
        current
            .acheck_with(self.waiter.as_ref(), self.wait, self.block)
            .await
    }

    /// Run `f` after a check. With blocking enabled an exceeded budget skips
    /// `f` and returns the error.
    pub fn protect<T, F>(
        &self,
        context: &dyn RequestContext,
        slot: Option<&RatelimitSlot>,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> T,
    {
        self.check(context, slot)?;
        Ok(f())
    }

    /// Await `fut` after an async check.
    pub async fn aprotect<T, Fut>(
        &self,
        context: &dyn RequestContext,
        slot: Option<&RatelimitSlot>,
        fut: Fut,
    ) -> Result<T>
    where
        Fut: Future<Output = T>,
    {
        self.acheck(context, slot).await?;
        Ok(fut.await)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("group", &self.group)
            .field("key", &self.key)
            .field("rate", &self.rate)
            .field("methods", &self.methods)
            .field("block", &self.block)
            .field("wait", &self.wait)
            .field("replace", &self.replace)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::clock::ManualClock;
    use crate::context::SimpleRequest;
    use crate::ratelimit::RateSpec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine() -> Arc<Engine> {
        let clock = Arc::new(ManualClock::new(1_000_020));
        Arc::new(
            Engine::builder()
                .clock(clock.clone())
                .cache("default", Arc::new(MemoryCache::new(clock)))
                .build(),
        )
    }

    fn limiter(engine: &Arc<Engine>, group: &str, rate: &str) -> RateLimiter {
        let rate: RateSpec = rate.parse().unwrap();
        RateLimiter::new(engine.clone(), group, KeySpec::strategy("ip"), rate)
    }

    fn request() -> SimpleRequest {
        SimpleRequest::new("POST").with_remote_addr("192.0.2.7")
    }

    #[test]
    fn test_check_blocks_after_limit() {
        let engine = engine();
        let limiter = limiter(&engine, "login", "2/m");
        let req = request();
        assert!(limiter.check(&req, None).unwrap());
        assert!(limiter.check(&req, None).unwrap());
        assert!(matches!(
            limiter.check(&req, None),
            Err(RatelimitError::Exceeded(_))
        ));
    }

    #[test]
    fn test_non_blocking_check_answers_false() {
        let engine = engine();
        let limiter = limiter(&engine, "login", "1/m").with_block(false);
        let req = request();
        assert!(limiter.check(&req, None).unwrap());
        assert!(!limiter.check(&req, None).unwrap());
    }

    #[test]
    fn test_sync_wait_is_config_error() {
        let engine = engine();
        let limiter = limiter(&engine, "login", "1/m").with_wait(true);
        assert!(matches!(
            limiter.check(&request(), None),
            Err(RatelimitError::Config(_))
        ));
    }

    #[test]
    fn test_zero_rate_propagates_disabled_and_stores() {
        let engine = engine();
        let limiter = limiter(&engine, "off", "0/m");
        let slot = RatelimitSlot::new();
        assert!(matches!(
            limiter.check(&request(), Some(&slot)),
            Err(RatelimitError::Disabled(_))
        ));
        assert_eq!(slot.get().unwrap().limit(), Some(0));
    }

    #[test]
    fn test_stacked_limiters_merge_in_slot() {
        let engine = engine();
        let strict = limiter(&engine, "strict", "1/m").with_block(false);
        let lax = limiter(&engine, "lax", "10/m").with_block(false);
        let req = request();

        strict.check(&req, None).unwrap();
        let slot = RatelimitSlot::new();
        assert!(!strict.check(&req, Some(&slot)).unwrap());
        assert!(!lax.check(&req, Some(&slot)).unwrap());

        let stored = slot.get().unwrap();
        assert_eq!(stored.group(), "strict");
        assert!(stored.is_exceeded());
    }

    #[test]
    fn test_replace_overwrites_slot() {
        let engine = engine();
        let strict = limiter(&engine, "strict", "1/m").with_block(false);
        let lax = limiter(&engine, "lax", "10/m")
            .with_block(false)
            .with_replace(true);
        let req = request();
        let slot = RatelimitSlot::new();

        strict.check(&req, Some(&slot)).unwrap();
        strict.check(&req, Some(&slot)).unwrap();
        assert!(lax.check(&req, Some(&slot)).unwrap());
        assert_eq!(slot.get().unwrap().group(), "lax");
        assert!(slot.take().is_some());
        assert!(slot.get().is_none());
    }

    #[test]
    fn test_protect_skips_work_when_blocked() {
        let engine = engine();
        let limiter = limiter(&engine, "work", "1/m");
        let req = request();
        let runs = AtomicUsize::new(0);
        let work = || runs.fetch_add(1, Ordering::SeqCst);

        assert!(limiter.protect(&req, None, work).is_ok());
        assert!(limiter.protect(&req, None, work).is_err());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_uncounted_method_passes() {
        let engine = engine();
        let limiter = limiter(&engine, "reads", "1/m").with_methods(MethodSet::safe());
        let req = request();
        for _ in 0..3 {
            assert!(limiter.check(&req, None).unwrap());
        }
    }

    #[test]
    fn test_acheck_from_sync_context() {
        let engine = engine();
        let limiter = limiter(&engine, "async", "1/m");
        let req = request();
        assert!(tokio_test::block_on(limiter.acheck(&req, None)).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_aprotect_waits_then_reports() {
        let engine = engine();
        let limiter = limiter(&engine, "wait", "1/m").with_wait(true).with_block(false);
        let req = request();

        assert_eq!(limiter.aprotect(&req, None, async { 1 }).await.unwrap(), 1);

        let started = tokio::time::Instant::now();
        assert_eq!(limiter.aprotect(&req, None, async { 2 }).await.unwrap(), 2);
        assert!(started.elapsed() >= std::time::Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aprotect_blocks_after_wait() {
        let engine = engine();
        let limiter = limiter(&engine, "wait", "1/m").with_wait(true);
        let req = request();
        limiter.acheck(&req, None).await.unwrap();
        let result = limiter.aprotect(&req, None, async {}).await;
        assert!(matches!(result, Err(RatelimitError::Exceeded(_))));
    }
}
