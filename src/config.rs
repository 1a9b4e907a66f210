//! Configuration management for the rate limiting engine.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use ipnet::IpNet;
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, info};

use crate::error::{RatelimitError, Result};
use crate::ratelimit::HashAlgorithm;

/// Engine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatelimitSettings {
    /// Process-wide switch; when off every evaluation passes through
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Prefix of every cache key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Cache used when a query names none
    #[serde(default = "default_cache")]
    pub default_cache: String,

    /// Digest applied to group names
    #[serde(default = "default_group_hash")]
    pub group_hash: HashAlgorithm,

    /// Digest applied to key material
    #[serde(default = "default_key_hash")]
    pub key_hash: HashAlgorithm,

    /// Peers whose forwarding headers are honored
    #[serde(default)]
    pub trusted_proxies: TrustedProxies,

    /// Address substituted for the `testclient` peer of test harnesses
    #[serde(default = "default_testclient_fallback")]
    pub testclient_fallback: String,

    /// Optional YAML file with named limiter rules
    #[serde(default)]
    pub rules_path: Option<String>,

    #[serde(skip)]
    proxy_cache: ProxyCache,
}

impl Default for RatelimitSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            key_prefix: default_key_prefix(),
            default_cache: default_cache(),
            group_hash: default_group_hash(),
            key_hash: default_key_hash(),
            trusted_proxies: TrustedProxies::default(),
            testclient_fallback: default_testclient_fallback(),
            rules_path: None,
            proxy_cache: ProxyCache::default(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_key_prefix() -> String {
    "frl:".to_string()
}

fn default_cache() -> String {
    "default".to_string()
}

fn default_group_hash() -> HashAlgorithm {
    HashAlgorithm::Sha224
}

fn default_key_hash() -> HashAlgorithm {
    HashAlgorithm::Sha256
}

fn default_testclient_fallback() -> String {
    "::1".to_string()
}

impl RatelimitSettings {
    /// Load settings from a file, with `RATELIMIT_*` environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading ratelimit settings");

        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("RATELIMIT").try_parsing(true))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Load settings from environment variables only.
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("RATELIMIT").try_parsing(true))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Load settings from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RatelimitError::Config(format!("Failed to parse settings: {}", e)))
    }

    /// The parsed trusted proxy matcher, memoized until
    /// [`invalidate_proxy_cache`](Self::invalidate_proxy_cache).
    pub fn trusted_proxies(&self) -> Arc<ProxyMatcher> {
        if let Some(matcher) = self.proxy_cache.0.read().as_ref() {
            return matcher.clone();
        }
        let mut slot = self.proxy_cache.0.write();
        slot.get_or_insert_with(|| {
            debug!(proxies = ?self.trusted_proxies, "Parsing trusted proxies");
            Arc::new(ProxyMatcher::new(&self.trusted_proxies))
        })
        .clone()
    }

    /// Drop the memoized proxy matcher.
    pub fn invalidate_proxy_cache(&self) {
        *self.proxy_cache.0.write() = None;
    }

    /// Replace the trusted proxies and drop the memoized matcher.
    pub fn set_trusted_proxies(&mut self, proxies: TrustedProxies) {
        self.trusted_proxies = proxies;
        self.invalidate_proxy_cache();
    }
}

/// Memo slot; a clone starts empty.
#[derive(Debug, Default)]
struct ProxyCache(RwLock<Option<Arc<ProxyMatcher>>>);

impl Clone for ProxyCache {
    fn clone(&self) -> Self {
        ProxyCache::default()
    }
}

/// Which peers may set forwarding headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustedProxies {
    /// Trust every peer.
    All,
    /// Trust the listed peers: literal names (`unix`), addresses or CIDR
    /// ranges.
    Only(Vec<String>),
}

impl TrustedProxies {
    /// Trust only the given entries.
    pub fn only<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TrustedProxies::Only(entries.into_iter().map(Into::into).collect())
    }
}

impl Default for TrustedProxies {
    fn default() -> Self {
        TrustedProxies::only(["unix"])
    }
}

impl Serialize for TrustedProxies {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            TrustedProxies::All => serializer.serialize_str("all"),
            TrustedProxies::Only(entries) => entries.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for TrustedProxies {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Word(String),
            List(Vec<String>),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Word(word) if word == "all" => TrustedProxies::All,
            Raw::Word(word) => TrustedProxies::only(
                word.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            ),
            Raw::List(list) => TrustedProxies::Only(list),
        })
    }
}

/// Parsed form of [`TrustedProxies`].
#[derive(Debug, Default)]
pub struct ProxyMatcher {
    all: bool,
    names: HashSet<String>,
    networks: Vec<IpNet>,
}

impl ProxyMatcher {
    /// Parse the configured entries. Entries that are neither addresses nor
    /// CIDR ranges match literally.
    pub fn new(proxies: &TrustedProxies) -> Self {
        let entries = match proxies {
            TrustedProxies::All => {
                return Self {
                    all: true,
                    ..Default::default()
                }
            }
            TrustedProxies::Only(entries) => entries,
        };

        let mut matcher = Self::default();
        for entry in entries {
            if let Ok(net) = entry.parse::<IpNet>() {
                matcher.networks.push(net);
            } else if let Ok(ip) = entry.parse::<IpAddr>() {
                matcher.networks.push(IpNet::from(ip));
            } else {
                matcher.names.insert(entry.clone());
            }
        }
        matcher
    }

    /// Whether the peer `addr` is trusted.
    pub fn contains(&self, addr: &str) -> bool {
        if self.all || self.names.contains(addr) {
            return true;
        }
        match addr.parse::<IpAddr>() {
            Ok(ip) => self.networks.iter().any(|net| net.contains(&ip)),
            Err(_) => false,
        }
    }
}
