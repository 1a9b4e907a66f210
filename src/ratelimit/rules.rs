//! Named limiter rules loaded from configuration.
//!
//! A rules file declares limiters by name so applications can look them up
//! instead of wiring each one in code:
//!
//! ```yaml
//! limits:
//!   - name: login
//!     key: { strategy: "ip:56" }
//!     rate: 5/m
//!     methods: { only: [POST] }
//!   - name: search
//!     group: api
//!     key: { composite: { name: get, args: ["user", "get:q"] } }
//!     rate: 100/h
//!     block: false
//! ```
//!
//! Enum values (`key`, `empty_to`, `methods`) are written as single-key maps
//! or, for unit variants, as plain words (`key: skip`).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{RatelimitError, Result};

use super::{Engine, HashAlgorithm, HashMode, KeySpec, MethodSet, RateLimiter, RateSpec};

/// Key as written in a rules file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyConfig {
    /// `name` or `name:arg` of a registered strategy.
    Strategy(String),
    /// A strategy called with several arguments.
    Composite { name: String, args: Vec<String> },
    /// Literal key.
    Bytes(String),
    FixedCount(u64),
    Skip,
    Disabled,
}

impl From<&KeyConfig> for KeySpec {
    fn from(config: &KeyConfig) -> Self {
        match config {
            KeyConfig::Strategy(spec) => KeySpec::strategy(spec),
            KeyConfig::Composite { name, args } => KeySpec::composite(name.clone(), args.clone()),
            KeyConfig::Bytes(key) => KeySpec::bytes(key.as_bytes()),
            KeyConfig::FixedCount(n) => KeySpec::FixedCount(*n),
            KeyConfig::Skip => KeySpec::Skip,
            KeyConfig::Disabled => KeySpec::Disabled,
        }
    }
}

fn default_block() -> bool {
    true
}

/// One named limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitRule {
    /// Lookup name of the limiter
    pub name: String,
    /// Group of the budget; the rule name when absent
    #[serde(default)]
    pub group: Option<String>,
    pub key: KeyConfig,
    pub rate: RateSpec,
    #[serde(default)]
    pub methods: MethodSet,
    #[serde(default = "default_block")]
    pub block: bool,
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub replace: bool,
    /// Substitute for keys resolving to nothing
    #[serde(default)]
    pub empty_to: Option<KeyConfig>,
    /// Named cache; the default cache when absent
    #[serde(default)]
    pub cache: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub hash_algorithm: Option<HashAlgorithm>,
    #[serde(default)]
    pub hash_mode: HashMode,
}

impl LimitRule {
    /// The group this rule counts in.
    pub fn group(&self) -> &str {
        self.group.as_deref().unwrap_or(&self.name)
    }

    /// Build the limiter described by this rule.
    pub fn build(&self, engine: Arc<Engine>) -> Result<RateLimiter> {
        self.methods.validate()?;

        let mut limiter = RateLimiter::new(engine, self.group(), KeySpec::from(&self.key), self.rate)
            .with_methods(self.methods.clone())
            .with_block(self.block)
            .with_wait(self.wait)
            .with_replace(self.replace)
            .with_hash_mode(self.hash_mode);
        if let Some(empty_to) = &self.empty_to {
            limiter = limiter.with_empty_to(KeySpec::from(empty_to));
        }
        if let Some(cache) = &self.cache {
            limiter = limiter.with_cache(cache.clone());
        }
        if let Some(prefix) = &self.prefix {
            limiter = limiter.with_prefix(prefix.clone());
        }
        if let Some(algorithm) = self.hash_algorithm {
            limiter = limiter.with_hash_algorithm(algorithm);
        }
        Ok(limiter)
    }
}

/// A set of named limiter rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterRules {
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub limits: Vec<LimitRule>,
}

impl LimiterRules {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RatelimitError::Config(format!("Failed to parse limiter rules: {}", e)))
    }

    pub fn get(&self, name: &str) -> Option<&LimitRule> {
        self.limits.iter().find(|rule| rule.name == name)
    }

    /// Build every limiter, keyed by rule name. Duplicate names are rejected.
    pub fn build(&self, engine: Arc<Engine>) -> Result<HashMap<String, RateLimiter>> {
        let mut limiters = HashMap::with_capacity(self.limits.len());
        for rule in &self.limits {
            if limiters.contains_key(&rule.name) {
                return Err(RatelimitError::Config(format!(
                    "duplicate limiter rule: {}",
                    rule.name
                )));
            }
            debug!(name = %rule.name, group = %rule.group(), rate = %rule.rate, "Building limiter");
            limiters.insert(rule.name.clone(), rule.build(engine.clone())?);
        }
        info!(count = limiters.len(), "Limiter rules loaded");
        Ok(limiters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::clock::ManualClock;
    use crate::context::SimpleRequest;

    fn engine() -> Arc<Engine> {
        let clock = Arc::new(ManualClock::new(1_000_020));
        Arc::new(
            Engine::builder()
                .clock(clock.clone())
                .cache("default", Arc::new(MemoryCache::new(clock)))
                .build(),
        )
    }

    #[test]
    fn test_parse_rules() {
        let yaml = r#"
limits:
  - name: login
    key: { strategy: "ip:56" }
    rate: 5/m
    methods: { only: [POST] }
  - name: search
    group: api
    key:
      composite:
        name: get
        args: ["user", "get:q"]
    rate: 100/h
    block: false
    hash_algorithm: sha512
    hash_mode: key_only
  - name: internal
    key: skip
    rate: 1/s
"#;
        let rules = LimiterRules::from_yaml(yaml).unwrap();
        assert_eq!(rules.limits.len(), 3);

        let login = rules.get("login").unwrap();
        assert_eq!(login.group(), "login");
        assert_eq!(login.key, KeyConfig::Strategy("ip:56".to_string()));
        assert_eq!(login.rate.limit(), 5);
        assert_eq!(login.rate.period(), 60);
        assert!(login.block);
        assert_eq!(login.methods, MethodSet::only(["POST"]));

        let search = rules.get("search").unwrap();
        assert_eq!(search.group(), "api");
        assert!(!search.block);
        assert_eq!(search.hash_algorithm, Some(HashAlgorithm::Sha512));
        assert_eq!(search.hash_mode, HashMode::KeyOnly);

        let internal = rules.get("internal").unwrap();
        assert_eq!(internal.key, KeyConfig::Skip);
        assert!(internal.methods.is_all());
    }

    #[test]
    fn test_malformed_rate_is_rejected() {
        let yaml = r#"
limits:
  - name: broken
    key: { strategy: ip }
    rate: 5/w
"#;
        assert!(matches!(
            LimiterRules::from_yaml(yaml),
            Err(RatelimitError::Config(_))
        ));
    }

    #[test]
    fn test_build_limiters() {
        let yaml = r#"
limits:
  - name: login
    key: { strategy: ip }
    rate: 1/m
    methods: { only: [POST] }
"#;
        let limiters = LimiterRules::from_yaml(yaml)
            .unwrap()
            .build(engine())
            .unwrap();
        let login = &limiters["login"];
        let post = SimpleRequest::new("POST").with_remote_addr("192.0.2.9");
        let get = SimpleRequest::new("GET").with_remote_addr("192.0.2.9");

        assert!(login.check(&post, None).unwrap());
        assert!(login.check(&get, None).unwrap());
        assert!(matches!(
            login.check(&post, None),
            Err(RatelimitError::Exceeded(_))
        ));
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let yaml = r#"
limits:
  - name: a
    key: skip
    rate: 1/m
  - name: a
    key: disabled
    rate: 2/m
"#;
        let rules = LimiterRules::from_yaml(yaml).unwrap();
        assert!(matches!(
            rules.build(engine()),
            Err(RatelimitError::Config(_))
        ));
    }

    #[test]
    fn test_lowercase_methods_are_rejected() {
        let yaml = r#"
limits:
  - name: a
    key: skip
    rate: 1/m
    methods: { only: [post] }
"#;
        let rules = LimiterRules::from_yaml(yaml).unwrap();
        assert!(rules.build(engine()).is_err());
    }

    #[test]
    fn test_empty_to_and_inverted_methods() {
        let yaml = r#"
limits:
  - name: writes
    key: { strategy: user }
    rate: 10/m
    methods: { all_except: [GET, HEAD] }
    empty_to: { bytes: anonymous }
  - name: pinned
    key: { fixed_count: 3 }
    rate: 1/m
    empty_to: skip
"#;
        let rules = LimiterRules::from_yaml(yaml).unwrap();
        let writes = rules.get("writes").unwrap();
        assert!(!writes.methods.contains("GET"));
        assert!(writes.methods.contains("POST"));
        assert_eq!(writes.empty_to, Some(KeyConfig::Bytes("anonymous".to_string())));

        let pinned = rules.get("pinned").unwrap();
        assert_eq!(pinned.key, KeyConfig::FixedCount(3));
        assert_eq!(pinned.empty_to, Some(KeyConfig::Skip));
    }

    #[test]
    fn test_rules_serialize_as_maps() {
        let yaml = r#"
limits:
  - name: login
    key: { strategy: "ip:56" }
    rate: 5/m
    methods: { only: [POST] }
"#;
        let rules = LimiterRules::from_yaml(yaml).unwrap();
        let written = serde_yaml::to_string(&rules).unwrap();
        assert!(!written.contains('!'), "{}", written);
        let reread = LimiterRules::from_yaml(&written).unwrap();
        assert_eq!(reread.limits[0].key, rules.limits[0].key);
        assert_eq!(reread.limits[0].methods, rules.limits[0].methods);
    }

    #[test]
    fn test_key_config_conversion() {
        assert!(matches!(
            KeySpec::from(&KeyConfig::FixedCount(3)),
            KeySpec::FixedCount(3)
        ));
        match KeySpec::from(&KeyConfig::Strategy("user_or_ip:24".to_string())) {
            KeySpec::Named { name, arg } => {
                assert_eq!(name, "user_or_ip");
                assert_eq!(arg.as_deref(), Some("24"));
            }
            other => panic!("unexpected {:?}", other),
        }
        match KeySpec::from(&KeyConfig::Bytes("tenant-1".to_string())) {
            KeySpec::Bytes(bytes) => assert_eq!(bytes, b"tenant-1"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
