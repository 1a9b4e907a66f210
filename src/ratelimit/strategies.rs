//! Key derivation strategies.
//!
//! A strategy turns the request context into key material. Strategies are
//! registered by name in a [`StrategyRegistry`], which is filled once at
//! start-up and shared read-only afterwards.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use ipnet::Ipv6Net;
use tracing::debug;

use crate::config::RatelimitSettings;
use crate::context::{client_ip, RequestContext};
use crate::error::{RatelimitError, Result};

use super::{Action, KeySpec};

/// Everything a strategy may look at.
#[derive(Clone, Copy)]
pub struct StrategyInput<'a> {
    pub context: Option<&'a dyn RequestContext>,
    pub group: &'a str,
    pub action: Action,
    pub args: &'a [String],
    pub settings: &'a RatelimitSettings,
}

impl<'a> StrategyInput<'a> {
    /// The request context, or a configuration error naming `strategy`.
    pub fn require_context(&self, strategy: &str) -> Result<&'a dyn RequestContext> {
        self.context.ok_or_else(|| {
            RatelimitError::Config(format!("strategy {} requires a request context", strategy))
        })
    }

    /// Netmask given as the strategy argument, `/128` when absent.
    pub fn netmask(&self) -> Result<Netmask> {
        if self.args.is_empty() {
            return Ok(Netmask::default());
        }
        self.args.join("/").parse()
    }

    /// Identifier of the authenticated principal.
    pub fn user_id(&self) -> Option<&'a str> {
        self.context
            .and_then(|ctx| ctx.principal())
            .map(|p| p.id.as_str())
            .filter(|id| !id.is_empty())
    }

    /// Whether the principal is staff or superuser.
    pub fn is_privileged(&self) -> bool {
        self.context
            .and_then(|ctx| ctx.principal())
            .map(|p| p.privileged)
            .unwrap_or(false)
    }

    /// Exploded client network for `netmask`.
    pub fn ip_key(&self, strategy: &str, netmask: Netmask) -> Result<String> {
        let ctx = self.require_context(strategy)?;
        let ip = client_ip(ctx, self.settings)?;
        Ok(exploded(&netmask.network(ip)?))
    }
}

/// A named key derivation.
pub trait KeyStrategy: Send + Sync {
    /// Derive the key for one call.
    fn derive(&self, input: &StrategyInput<'_>) -> Result<KeySpec>;
}

impl<F> KeyStrategy for F
where
    F: Fn(&StrategyInput<'_>) -> Result<KeySpec> + Send + Sync,
{
    fn derive(&self, input: &StrategyInput<'_>) -> Result<KeySpec> {
        self(input)
    }
}

/// Name to strategy mapping.
#[derive(Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn KeyStrategy>>,
}

impl StrategyRegistry {
    /// A registry without any strategy.
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// A registry holding the built-in strategies.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("ip", ip);
        registry.register("user", user);
        registry.register("user_or_ip", user_or_ip);
        registry.register("user_and_ip", user_and_ip);
        registry.register("ip_exempt_user", ip_exempt_user);
        registry.register("ip_exempt_privileged", ip_exempt_privileged);
        registry.register("static", static_key);
        registry.register("get", composite_get);
        registry
    }

    /// Register or replace a strategy.
    pub fn register<S>(&mut self, name: impl Into<String>, strategy: S) -> &mut Self
    where
        S: KeyStrategy + 'static,
    {
        let name = name.into();
        debug!(strategy = %name, "Registering key strategy");
        self.strategies.insert(name, Arc::new(strategy));
        self
    }

    /// Look up a strategy.
    pub fn get(&self, name: &str) -> Result<Arc<dyn KeyStrategy>> {
        self.strategies
            .get(name)
            .cloned()
            .ok_or_else(|| RatelimitError::Config(format!("unknown key strategy: {}", name)))
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.strategies.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.strategies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("strategies", &self.names())
            .finish()
    }
}

/// Prefix length applied to client addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Netmask {
    /// Prefix of the (IPv4-mapped) IPv6 address.
    Uniform(u8),
    /// Separate prefixes for IPv4 and IPv6 clients.
    Split { v4: u8, v6: u8 },
}

impl Default for Netmask {
    fn default() -> Self {
        Netmask::Uniform(128)
    }
}

impl FromStr for Netmask {
    type Err = RatelimitError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || RatelimitError::Config(format!("invalid netmask: {:?}", s));
        let parts = s
            .split('/')
            .map(|p| p.trim().parse::<u8>().map_err(|_| invalid()))
            .collect::<Result<Vec<u8>>>()?;

        match parts.as_slice() {
            [n] if *n <= 128 => Ok(Netmask::Uniform(*n)),
            [v4, v6] if *v4 <= 32 && *v6 <= 128 => Ok(Netmask::Split { v4: *v4, v6: *v6 }),
            _ => Err(invalid()),
        }
    }
}

impl Netmask {
    /// The network containing `ip`. IPv4 addresses are mapped into IPv6
    /// first.
    pub fn network(&self, ip: IpAddr) -> Result<Ipv6Net> {
        let (addr, prefix) = match ip {
            IpAddr::V4(v4) => {
                let prefix = match *self {
                    Netmask::Uniform(n) => n,
                    Netmask::Split { v4: n, .. } => 96 + n,
                };
                (v4.to_ipv6_mapped(), prefix)
            }
            IpAddr::V6(v6) => {
                let prefix = match *self {
                    Netmask::Uniform(n) | Netmask::Split { v6: n, .. } => n,
                };
                (v6, prefix)
            }
        };
        let net = Ipv6Net::new(addr, prefix)
            .map_err(|e| RatelimitError::Config(format!("invalid prefix {}: {}", prefix, e)))?;
        Ok(net.trunc())
    }
}

/// Fully expanded `xxxx:...:xxxx/prefix` form of `net`.
pub fn exploded(net: &Ipv6Net) -> String {
    let segments: Vec<String> = net
        .network()
        .segments()
        .iter()
        .map(|s| format!("{:04x}", s))
        .collect();
    format!("{}/{}", segments.join(":"), net.prefix_len())
}

fn ip(input: &StrategyInput<'_>) -> Result<KeySpec> {
    let key = input.ip_key("ip", input.netmask()?)?;
    Ok(KeySpec::from(key))
}

fn user(input: &StrategyInput<'_>) -> Result<KeySpec> {
    Ok(KeySpec::bytes(input.user_id().unwrap_or_default()))
}

fn user_or_ip(input: &StrategyInput<'_>) -> Result<KeySpec> {
    if let Some(id) = input.user_id() {
        return Ok(KeySpec::bytes(id));
    }
    let key = input.ip_key("user_or_ip", input.netmask()?)?;
    Ok(KeySpec::from(key))
}

fn user_and_ip(input: &StrategyInput<'_>) -> Result<KeySpec> {
    let mut key = input.ip_key("user_and_ip", input.netmask()?)?;
    if let Some(id) = input.user_id() {
        key.push_str(id);
    }
    Ok(KeySpec::from(key))
}

/// Counts anonymous callers by address; authenticated callers are exempt
/// when counting and are the ones resetting.
fn ip_exempt_user(input: &StrategyInput<'_>) -> Result<KeySpec> {
    if input.user_id().is_some() != input.action.is_reset() {
        return Ok(KeySpec::FixedCount(0));
    }
    let key = input.ip_key("ip_exempt_user", input.netmask()?)?;
    Ok(KeySpec::from(key))
}

fn ip_exempt_privileged(input: &StrategyInput<'_>) -> Result<KeySpec> {
    if input.is_privileged() != input.action.is_reset() {
        return Ok(KeySpec::FixedCount(0));
    }
    let key = input.ip_key("ip_exempt_privileged", input.netmask()?)?;
    Ok(KeySpec::from(key))
}

fn static_key(input: &StrategyInput<'_>) -> Result<KeySpec> {
    let value = input.args.first().map(String::as_str).unwrap_or("static");
    Ok(KeySpec::bytes(value))
}

fn composite_get(input: &StrategyInput<'_>) -> Result<KeySpec> {
    let parts = CompositeKey::parse(input.args)?;
    Ok(KeySpec::Bytes(parts.generate(input)?))
}

/// Parsed argument list of the `get` strategy.
#[derive(Debug, Default, PartialEq, Eq)]
struct CompositeKey {
    ip: Option<Netmask>,
    user: bool,
    /// `None` stands for the session identifier itself
    sessions: BTreeSet<Option<String>>,
    headers: BTreeSet<String>,
    query: BTreeSet<String>,
    form: BTreeSet<String>,
}

impl CompositeKey {
    fn parse(args: &[String]) -> Result<Self> {
        let parts: Vec<&str> = match args {
            [] => {
                return Err(RatelimitError::Config(
                    "strategy get requires at least one part".to_string(),
                ))
            }
            [single] => single.split(',').map(str::trim).collect(),
            many => many.iter().map(String::as_str).collect(),
        };

        let mut key = CompositeKey::default();
        for part in parts.into_iter().filter(|p| !p.is_empty()) {
            let (name, value) = match part.split_once(':') {
                Some((name, value)) => (name, Some(value)),
                None => (part, None),
            };
            match (name.to_ascii_uppercase().as_str(), value) {
                ("IP", None) => key.ip = Some(Netmask::default()),
                ("IP", Some(mask)) => key.ip = Some(mask.parse()?),
                ("USER", None) => key.user = true,
                ("SESSION", value) => {
                    key.sessions.insert(value.map(str::to_string));
                }
                ("HEADER", Some(v)) if !v.is_empty() => {
                    key.headers.insert(v.to_string());
                }
                ("GET", Some(v)) if !v.is_empty() => {
                    key.query.insert(v.to_string());
                }
                ("POST", Some(v)) if !v.is_empty() => {
                    key.form.insert(v.to_string());
                }
                ("HEADER" | "GET" | "POST", _) => {}
                _ => {
                    return Err(RatelimitError::Config(format!(
                        "invalid part for strategy get: {:?}",
                        part
                    )))
                }
            }
        }

        if key.headers.remove("REMOTE_ADDR") && key.ip.is_none() {
            key.ip = Some(Netmask::default());
        }
        Ok(key)
    }

    fn generate(&self, input: &StrategyInput<'_>) -> Result<Vec<u8>> {
        let ctx = input.require_context("get")?;
        let mut out = String::new();

        if let Some(netmask) = self.ip {
            out.push_str(&input.ip_key("get", netmask)?);
        }
        if self.user {
            if let Some(id) = input.user_id() {
                out.push_str(id);
            }
        }
        for session in &self.sessions {
            let value = match session {
                None => ctx.session_key(),
                Some(name) => ctx.session_value(name),
            };
            out.push_str(value.unwrap_or_default());
        }
        for header in &self.headers {
            out.push_str(ctx.meta(header).unwrap_or_default());
        }

        let args: BTreeSet<&String> = self.query.iter().chain(self.form.iter()).collect();
        for arg in args {
            if self.form.contains(arg) {
                out.push_str(ctx.form_param(arg).unwrap_or_default());
            }
            if self.query.contains(arg) {
                out.push_str(ctx.query_param(arg).unwrap_or_default());
            }
        }
        Ok(out.into_bytes())
    }
}
