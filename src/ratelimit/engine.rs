//! The decision engine.
//!
//! One call resolves the rate, derives and fingerprints the key, runs the
//! action against the window cache and packs everything into a
//! [`Ratelimit`]. Nothing is kept between calls; every evaluation reads the
//! shared cache again.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::cache::{CacheBackend, MemoryCache};
use crate::clock::{Clock, SystemClock};
use crate::config::RatelimitSettings;
use crate::context::RequestContext;
use crate::error::{RatelimitError, Result};

use super::fingerprint::Fingerprinter;
use super::key::{Group, KeyResolver, KeySpec, ResolvedKey};
use super::result::ResetHandle;
use super::window::{window_start, WindowCache};
use super::{
    Action, Epoch, HashAlgorithm, HashMode, MethodSet, Rate, Ratelimit, StrategyRegistry,
};

/// Parameters of one evaluation.
#[derive(Clone)]
pub struct Query<'a> {
    group: Group,
    key: KeySpec,
    rate: Rate,
    context: Option<&'a dyn RequestContext>,
    methods: MethodSet,
    action: Action,
    prefix: Option<String>,
    empty_to: KeySpec,
    cache: Option<String>,
    hash_algorithm: Option<HashAlgorithm>,
    hash_mode: HashMode,
    epoch: Option<Epoch<'a>>,
}

impl<'a> Query<'a> {
    /// A PEEK of `key` in `group` at `rate`, counting every method.
    pub fn new(group: impl Into<Group>, key: KeySpec, rate: impl Into<Rate>) -> Self {
        Self {
            group: group.into(),
            key,
            rate: rate.into(),
            context: None,
            methods: MethodSet::all(),
            action: Action::Peek,
            prefix: None,
            empty_to: KeySpec::default(),
            cache: None,
            hash_algorithm: None,
            hash_mode: HashMode::default(),
            epoch: None,
        }
    }

    /// The request being limited.
    pub fn context(mut self, context: &'a dyn RequestContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Count only these methods; requires a context unless all.
    pub fn methods(mut self, methods: MethodSet) -> Self {
        self.methods = methods;
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    /// Cache key prefix; the configured one by default.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Replacement for keys that resolve to nothing.
    pub fn empty_to(mut self, empty_to: impl Into<KeySpec>) -> Self {
        self.empty_to = empty_to.into();
        self
    }

    /// Name of the cache to count in.
    pub fn cache(mut self, name: impl Into<String>) -> Self {
        self.cache = Some(name.into());
        self
    }

    /// Digest for the key material; the configured one by default.
    pub fn hash_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.hash_algorithm = Some(algorithm);
        self
    }

    pub fn hash_mode(mut self, mode: HashMode) -> Self {
        self.hash_mode = mode;
        self
    }

    /// Epoch for INCREASE bookkeeping and RESET_EPOCH. Defaults to the
    /// context's tracker.
    pub fn epoch(mut self, epoch: impl Into<Epoch<'a>>) -> Self {
        self.epoch = Some(epoch.into());
        self
    }
}

/// Builder for [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    settings: Option<RatelimitSettings>,
    registry: Option<StrategyRegistry>,
    clock: Option<Arc<dyn Clock>>,
    caches: HashMap<String, Arc<dyn CacheBackend>>,
}

impl EngineBuilder {
    pub fn settings(mut self, settings: RatelimitSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn registry(mut self, registry: StrategyRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Register a named cache.
    pub fn cache(mut self, name: impl Into<String>, cache: Arc<dyn CacheBackend>) -> Self {
        self.caches.insert(name.into(), cache);
        self
    }

    /// Build the engine. Without a cache under the default name, an
    /// in-memory cache is installed there.
    pub fn build(self) -> Engine {
        let settings = self.settings.unwrap_or_default();
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let mut caches = self.caches;
        if !caches.contains_key(&settings.default_cache) {
            info!(cache = %settings.default_cache, "Installing in-memory default cache");
            caches.insert(
                settings.default_cache.clone(),
                Arc::new(MemoryCache::new(clock.clone())),
            );
        }

        Engine {
            settings,
            registry: self.registry.unwrap_or_default(),
            clock,
            caches,
        }
    }
}

/// Evaluates rate limits against named caches.
pub struct Engine {
    settings: RatelimitSettings,
    registry: StrategyRegistry,
    clock: Arc<dyn Clock>,
    caches: HashMap<String, Arc<dyn CacheBackend>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn settings(&self) -> &RatelimitSettings {
        &self.settings
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Look up a named cache.
    pub fn cache(&self, name: &str) -> Result<Arc<dyn CacheBackend>> {
        self.caches
            .get(name)
            .cloned()
            .ok_or_else(|| RatelimitError::Config(format!("unknown cache: {}", name)))
    }

    /// Evaluate `query`.
    ///
    /// Requests whose method is not counted and evaluations while the engine
    /// is switched off pass through without touching the cache.
    pub fn get_ratelimit(&self, query: &Query<'_>) -> Result<Ratelimit> {
        let context = query.context;
        let group = query.group.resolve(context, query.action);

        query.methods.validate()?;
        match context {
            Some(ctx) if !query.methods.contains(ctx.method()) => {
                trace!(group = %group, method = ctx.method(), "Method not counted");
                return Ok(Ratelimit::passthrough(group, self.clock.clone()));
            }
            None if !query.methods.is_all() => {
                return Err(RatelimitError::Config(
                    "a method set other than all requires a request context".to_string(),
                ));
            }
            _ => {}
        }
        if !self.settings.enabled {
            trace!(group = %group, "Rate limiting switched off");
            return Ok(Ratelimit::passthrough(group, self.clock.clone()));
        }

        let epoch = query
            .epoch
            .or_else(|| context.and_then(|ctx| ctx.epoch()).map(Epoch::Tracker));
        self.decide(query, group, epoch)
    }

    /// Async counterpart of [`get_ratelimit`](Self::get_ratelimit). Cache
    /// operations run inline; only the wait policy suspends.
    pub async fn aget_ratelimit(&self, query: &Query<'_>) -> Result<Ratelimit> {
        self.get_ratelimit(query)
    }

    /// Core of an evaluation, after method filtering.
    ///
    /// A zero limit is reported as [`RatelimitError::Disabled`] before the
    /// key is resolved or the cache is touched.
    pub fn decide(
        &self,
        query: &Query<'_>,
        group: String,
        epoch: Option<Epoch<'_>>,
    ) -> Result<Ratelimit> {
        let rate = query.rate.resolve(query.context, &group, query.action)?;
        if rate.is_disabled() {
            debug!(group = %group, "Ratelimit disabled by zero limit");
            return Err(RatelimitError::Disabled(Box::new(Ratelimit::disabled(
                group,
                self.clock.clone(),
            ))));
        }

        let resolved = KeyResolver {
            registry: &self.registry,
            settings: &self.settings,
            context: query.context,
            group: &group,
            action: query.action,
        }
        .resolve(&query.key, &query.empty_to)?;

        let end = window_start(self.clock.now(), rate.period()) + rate.period();
        let key = match resolved {
            ResolvedKey::Bytes(key) => key,
            ResolvedKey::Skip => {
                return Ok(Ratelimit::fixed(group, 0, rate.limit(), end, self.clock.clone()))
            }
            ResolvedKey::FixedCount(n) => {
                trace!(group = %group, count = n, "Fixed count, cache bypassed");
                return Ok(Ratelimit::fixed(group, n, rate.limit(), end, self.clock.clone()));
            }
            ResolvedKey::Disabled => {
                trace!(group = %group, "Key disabled, passing through");
                return Ok(Ratelimit::passthrough(group, self.clock.clone()));
            }
        };

        let fingerprinter = Fingerprinter {
            prefix: query.prefix.as_deref().unwrap_or(&self.settings.key_prefix),
            group_hash: self.settings.group_hash,
            key_hash: query.hash_algorithm.unwrap_or(self.settings.key_hash),
            mode: query.hash_mode,
        };
        let cache_key = fingerprinter.cache_key(&group, rate.period(), &query.methods, &key);

        let cache_name = query.cache.as_deref().unwrap_or(&self.settings.default_cache);
        let window = WindowCache::new(self.cache(cache_name)?, self.clock.clone());
        let outcome = window.apply(&cache_key, rate, query.action, epoch)?;

        let count = match query.action {
            Action::Peek | Action::Increase => outcome.after,
            Action::Reset | Action::ResetEpoch => outcome.before,
        };
        trace!(
            group = %group,
            key = %cache_key,
            action = %query.action,
            count,
            limit = rate.limit(),
            "Evaluated ratelimit"
        );

        let handle = ResetHandle {
            window,
            cache_key,
            period: rate.period(),
        };
        Ok(Ratelimit::counted(
            group,
            count,
            rate.limit(),
            outcome.end,
            handle,
            self.clock.clone(),
        ))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut caches: Vec<&String> = self.caches.keys().collect();
        caches.sort();
        f.debug_struct("Engine")
            .field("settings", &self.settings)
            .field("registry", &self.registry)
            .field("caches", &caches)
            .finish()
    }
}
