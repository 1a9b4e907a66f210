//! Key and group specifications and their resolution.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::config::RatelimitSettings;
use crate::context::RequestContext;
use crate::error::{RatelimitError, Result};

use super::strategies::{StrategyInput, StrategyRegistry};
use super::Action;

/// Nesting limit for dynamic keys and strategies returning keys.
const MAX_RESOLVE_DEPTH: usize = 8;

/// Signature of a key computed per call.
pub type KeyFn =
    dyn Fn(Option<&dyn RequestContext>, &str, Action) -> Result<KeySpec> + Send + Sync;

/// Signature of a group computed per call.
pub type GroupFn = dyn Fn(Option<&dyn RequestContext>, Action) -> String + Send + Sync;

/// What identifies the limited entity.
#[derive(Clone)]
pub enum KeySpec {
    /// Do not derive a key or touch the cache; the call is accepted.
    Skip,
    /// Do not touch the cache; the call passes through without a limit.
    Disabled,
    /// Do not touch the cache; report `n` events for this call.
    FixedCount(u64),
    /// Literal key bytes.
    Bytes(Vec<u8>),
    /// A registered strategy with an optional argument.
    Named { name: String, arg: Option<String> },
    /// A registered strategy with several arguments.
    Composite { name: String, args: Vec<String> },
    /// A function whose return value is resolved again.
    Dynamic(Arc<KeyFn>),
}

impl KeySpec {
    /// Literal key bytes.
    pub fn bytes(key: impl Into<Vec<u8>>) -> Self {
        KeySpec::Bytes(key.into())
    }

    /// A strategy reference of the form `name` or `name:arg`.
    pub fn strategy(spec: &str) -> Self {
        match spec.split_once(':') {
            Some((name, arg)) => KeySpec::Named {
                name: name.to_string(),
                arg: Some(arg.to_string()),
            },
            None => KeySpec::Named {
                name: spec.to_string(),
                arg: None,
            },
        }
    }

    /// A strategy called with several arguments.
    pub fn composite<I, S>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KeySpec::Composite {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// A key computed from the context, the group and the action.
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(Option<&dyn RequestContext>, &str, Action) -> Result<KeySpec> + Send + Sync + 'static,
    {
        KeySpec::Dynamic(Arc::new(f))
    }

    /// Whether this spec is an empty literal key.
    fn is_empty_bytes(&self) -> bool {
        matches!(self, KeySpec::Bytes(b) if b.is_empty())
    }
}

impl Default for KeySpec {
    /// The empty key; as `empty_to` it keeps empty keys as they are.
    fn default() -> Self {
        KeySpec::Bytes(Vec::new())
    }
}

impl From<bool> for KeySpec {
    /// `true` skips counting, `false` disables the limit.
    fn from(value: bool) -> Self {
        if value {
            KeySpec::Skip
        } else {
            KeySpec::Disabled
        }
    }
}

impl From<u64> for KeySpec {
    fn from(n: u64) -> Self {
        KeySpec::FixedCount(n)
    }
}

impl From<Vec<u8>> for KeySpec {
    fn from(key: Vec<u8>) -> Self {
        KeySpec::Bytes(key)
    }
}

impl From<&[u8]> for KeySpec {
    fn from(key: &[u8]) -> Self {
        KeySpec::Bytes(key.to_vec())
    }
}

impl From<String> for KeySpec {
    /// A computed string is key material, never a strategy name.
    fn from(key: String) -> Self {
        KeySpec::Bytes(key.into_bytes())
    }
}

impl fmt::Debug for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySpec::Skip => f.write_str("Skip"),
            KeySpec::Disabled => f.write_str("Disabled"),
            KeySpec::FixedCount(n) => f.debug_tuple("FixedCount").field(n).finish(),
            KeySpec::Bytes(b) => f
                .debug_tuple("Bytes")
                .field(&String::from_utf8_lossy(b))
                .finish(),
            KeySpec::Named { name, arg } => f
                .debug_struct("Named")
                .field("name", name)
                .field("arg", arg)
                .finish(),
            KeySpec::Composite { name, args } => f
                .debug_struct("Composite")
                .field("name", name)
                .field("args", args)
                .finish(),
            KeySpec::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Namespace of a rate budget.
#[derive(Clone)]
pub enum Group {
    /// A fixed name.
    Name(String),
    /// A name computed from the context and the action.
    Dynamic(Arc<GroupFn>),
}

impl Group {
    /// A group computed per call.
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(Option<&dyn RequestContext>, Action) -> String + Send + Sync + 'static,
    {
        Group::Dynamic(Arc::new(f))
    }

    pub(crate) fn resolve(&self, context: Option<&dyn RequestContext>, action: Action) -> String {
        match self {
            Group::Name(name) => name.clone(),
            Group::Dynamic(f) => f(context, action),
        }
    }
}

impl From<&str> for Group {
    fn from(name: &str) -> Self {
        Group::Name(name.to_string())
    }
}

impl From<String> for Group {
    fn from(name: String) -> Self {
        Group::Name(name)
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Group::Name(name) => f.debug_tuple("Name").field(name).finish(),
            Group::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Outcome of key resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedKey {
    /// Key material to fingerprint.
    Bytes(Vec<u8>),
    /// Accepted without counting.
    Skip,
    /// Passed through without a limit.
    Disabled,
    /// Fixed event count, no cache access.
    FixedCount(u64),
}

impl ResolvedKey {
    /// Whether the cache is bypassed.
    pub fn is_bypass(&self) -> bool {
        !matches!(self, ResolvedKey::Bytes(_))
    }
}

/// Resolves [`KeySpec`]s against a strategy registry.
pub struct KeyResolver<'a> {
    pub registry: &'a StrategyRegistry,
    pub settings: &'a RatelimitSettings,
    pub context: Option<&'a dyn RequestContext>,
    pub group: &'a str,
    pub action: Action,
}

impl KeyResolver<'_> {
    /// Resolve `spec`, substituting `empty_to` when it yields an empty key.
    pub fn resolve(&self, spec: &KeySpec, empty_to: &KeySpec) -> Result<ResolvedKey> {
        let resolved = self.resolve_at(spec, 0)?;
        match resolved {
            ResolvedKey::Bytes(ref b) if b.is_empty() && !empty_to.is_empty_bytes() => {
                trace!(group = %self.group, fallback = ?empty_to, "Empty key, using fallback");
                self.resolve_at(empty_to, 0)
            }
            other => Ok(other),
        }
    }

    fn resolve_at(&self, spec: &KeySpec, depth: usize) -> Result<ResolvedKey> {
        if depth >= MAX_RESOLVE_DEPTH {
            return Err(RatelimitError::Config(format!(
                "key resolution nested deeper than {} levels",
                MAX_RESOLVE_DEPTH
            )));
        }

        let next = match spec {
            KeySpec::Skip => return Ok(ResolvedKey::Skip),
            KeySpec::Disabled => return Ok(ResolvedKey::Disabled),
            KeySpec::FixedCount(n) => return Ok(ResolvedKey::FixedCount(*n)),
            KeySpec::Bytes(b) => return Ok(ResolvedKey::Bytes(b.clone())),
            KeySpec::Named { name, arg } => {
                let args: Vec<String> = arg.iter().cloned().collect();
                self.call_strategy(name, &args)?
            }
            KeySpec::Composite { name, args } => self.call_strategy(name, args)?,
            KeySpec::Dynamic(f) => f(self.context, self.group, self.action)?,
        };
        self.resolve_at(&next, depth + 1)
    }

    fn call_strategy(&self, name: &str, args: &[String]) -> Result<KeySpec> {
        let strategy = self.registry.get(name)?;
        trace!(strategy = %name, args = ?args, "Deriving key");
        strategy.derive(&StrategyInput {
            context: self.context,
            group: self.group,
            action: self.action,
            args,
            settings: self.settings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Principal, SimpleRequest};

    fn resolve_with(
        spec: &KeySpec,
        empty_to: &KeySpec,
        context: Option<&dyn RequestContext>,
    ) -> Result<ResolvedKey> {
        let registry = StrategyRegistry::default();
        let settings = RatelimitSettings::default();
        KeyResolver {
            registry: &registry,
            settings: &settings,
            context,
            group: "group",
            action: Action::Increase,
        }
        .resolve(spec, empty_to)
    }

    #[test]
    fn test_strategy_spec_splits_argument() {
        match KeySpec::strategy("ip:32/64") {
            KeySpec::Named { name, arg } => {
                assert_eq!(name, "ip");
                assert_eq!(arg.as_deref(), Some("32/64"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            KeySpec::strategy("user"),
            KeySpec::Named { arg: None, .. }
        ));
    }

    #[test]
    fn test_bypass_variants() {
        let none = KeySpec::default();
        assert_eq!(resolve_with(&KeySpec::Skip, &none, None).unwrap(), ResolvedKey::Skip);
        assert_eq!(
            resolve_with(&KeySpec::Disabled, &none, None).unwrap(),
            ResolvedKey::Disabled
        );
        assert_eq!(
            resolve_with(&KeySpec::FixedCount(5), &none, None).unwrap(),
            ResolvedKey::FixedCount(5)
        );
    }

    #[test]
    fn test_static_bytes_verbatim() {
        let key = resolve_with(&KeySpec::bytes("abc"), &KeySpec::default(), None).unwrap();
        assert_eq!(key, ResolvedKey::Bytes(b"abc".to_vec()));
    }

    #[test]
    fn test_empty_to_substitution() {
        let request = SimpleRequest::new("GET");
        let key = resolve_with(&KeySpec::strategy("user"), &KeySpec::from(true), Some(&request))
            .unwrap();
        assert_eq!(key, ResolvedKey::Skip);

        let key =
            resolve_with(&KeySpec::strategy("user"), &KeySpec::FixedCount(1), Some(&request))
                .unwrap();
        assert_eq!(key, ResolvedKey::FixedCount(1));

        let key = resolve_with(&KeySpec::strategy("user"), &KeySpec::default(), Some(&request))
            .unwrap();
        assert_eq!(key, ResolvedKey::Bytes(Vec::new()));
    }

    #[test]
    fn test_empty_to_not_used_for_non_empty_key() {
        let request = SimpleRequest::new("GET").with_principal(Principal::user("42"));
        let key = resolve_with(&KeySpec::strategy("user"), &KeySpec::Disabled, Some(&request))
            .unwrap();
        assert_eq!(key, ResolvedKey::Bytes(b"42".to_vec()));
    }

    #[test]
    fn test_dynamic_key_is_reinterpreted() {
        let spec = KeySpec::dynamic(|_, group, action| {
            assert_eq!(action, Action::Increase);
            Ok(KeySpec::from(format!("dyn-{}", group)))
        });
        let key = resolve_with(&spec, &KeySpec::default(), None).unwrap();
        assert_eq!(key, ResolvedKey::Bytes(b"dyn-group".to_vec()));

        let spec = KeySpec::dynamic(|_, _, _| Ok(KeySpec::from(3u64)));
        assert_eq!(
            resolve_with(&spec, &KeySpec::default(), None).unwrap(),
            ResolvedKey::FixedCount(3)
        );

        let spec = KeySpec::dynamic(|_, _, _| Ok(KeySpec::strategy("static:abc")));
        assert_eq!(
            resolve_with(&spec, &KeySpec::default(), None).unwrap(),
            ResolvedKey::Bytes(b"abc".to_vec())
        );
    }

    #[test]
    fn test_unbounded_recursion_is_config_error() {
        fn looping() -> KeySpec {
            KeySpec::dynamic(|_, _, _| Ok(looping()))
        }
        let err = resolve_with(&looping(), &KeySpec::default(), None).unwrap_err();
        assert!(matches!(err, RatelimitError::Config(_)));
    }

    #[test]
    fn test_unknown_strategy_is_config_error() {
        let err = resolve_with(&KeySpec::strategy("nope"), &KeySpec::default(), None).unwrap_err();
        assert!(matches!(err, RatelimitError::Config(_)));
    }

    #[test]
    fn test_dynamic_group() {
        let group = Group::dynamic(|ctx, _| match ctx {
            Some(ctx) => format!("g-{}", ctx.method()),
            None => "g".to_string(),
        });
        let request = SimpleRequest::new("POST");
        assert_eq!(group.resolve(Some(&request), Action::Peek), "g-POST");
        assert_eq!(group.resolve(None, Action::Peek), "g");
        assert_eq!(Group::from("x").resolve(None, Action::Peek), "x");
    }
}
