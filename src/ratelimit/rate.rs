//! Rate expressions: `<count>/<multiplier><unit>`.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::context::RequestContext;
use crate::error::{RatelimitError, Result};

use super::Action;

static RATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)/(\d*)([smhd])$").expect("rate pattern is a valid regex")
});

/// Time unit suffix of a rate expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    /// `s`
    Second,
    /// `m`
    Minute,
    /// `h`
    Hour,
    /// `d`
    Day,
}

impl TimeUnit {
    /// Length of one unit in seconds.
    pub fn seconds(&self) -> u64 {
        match self {
            TimeUnit::Second => 1,
            TimeUnit::Minute => 60,
            TimeUnit::Hour => 3600,
            TimeUnit::Day => 86400,
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "s" => Some(TimeUnit::Second),
            "m" => Some(TimeUnit::Minute),
            "h" => Some(TimeUnit::Hour),
            "d" => Some(TimeUnit::Day),
            _ => None,
        }
    }
}

/// An immutable `(limit, period)` pair.
///
/// A limit of zero is valid here; the engine turns it into a
/// [`RatelimitError::Disabled`] signal when it evaluates the rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RateSpec {
    limit: u64,
    period: u64,
}

impl RateSpec {
    /// Create a rate from a limit and a period in seconds.
    pub fn new(limit: u64, period: u64) -> Result<Self> {
        if period == 0 {
            return Err(RatelimitError::MalformedRate(format!(
                "period must be positive: ({}, {})",
                limit, period
            )));
        }
        Ok(Self { limit, period })
    }

    /// Events allowed per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Window length in seconds.
    pub fn period(&self) -> u64 {
        self.period
    }

    /// Whether this rate switches the limited feature off.
    pub fn is_disabled(&self) -> bool {
        self.limit == 0
    }
}

impl FromStr for RateSpec {
    type Err = RatelimitError;

    fn from_str(expr: &str) -> Result<Self> {
        let malformed = || RatelimitError::MalformedRate(format!("invalid rate format: {:?}", expr));
        let caps = RATE_RE.captures(expr).ok_or_else(malformed)?;

        let limit: u64 = caps[1].parse().map_err(|_| malformed())?;
        let multiplier: u64 = match &caps[2] {
            "" => 1,
            digits => digits.parse().map_err(|_| malformed())?,
        };
        let unit = TimeUnit::from_suffix(&caps[3]).ok_or_else(malformed)?;
        let period = multiplier.checked_mul(unit.seconds()).ok_or_else(malformed)?;

        RateSpec::new(limit, period)
    }
}

impl TryFrom<(u64, u64)> for RateSpec {
    type Error = RatelimitError;

    fn try_from((limit, period): (u64, u64)) -> Result<Self> {
        RateSpec::new(limit, period)
    }
}

impl fmt::Display for RateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}s", self.limit, self.period)
    }
}

impl Serialize for RateSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RateSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let expr = String::deserialize(deserializer)?;
        expr.parse().map_err(serde::de::Error::custom)
    }
}

/// Parse a rate expression such as `"5/m"` or `"2/3m"`.
pub fn parse_rate(expr: &str) -> Result<RateSpec> {
    expr.parse()
}

/// Signature of a rate computed per call.
pub type RateFn =
    dyn Fn(Option<&dyn RequestContext>, &str, Action) -> Result<RateSpec> + Send + Sync;

/// Where the rate for an evaluation comes from.
#[derive(Clone)]
pub enum Rate {
    /// A fixed rate.
    Spec(RateSpec),
    /// A rate computed from the context, the group and the action.
    Dynamic(Arc<RateFn>),
}

impl Rate {
    /// Parse a fixed rate expression.
    pub fn parse(expr: &str) -> Result<Self> {
        Ok(Rate::Spec(expr.parse()?))
    }

    /// Wrap a function computing the rate per call.
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(Option<&dyn RequestContext>, &str, Action) -> Result<RateSpec> + Send + Sync + 'static,
    {
        Rate::Dynamic(Arc::new(f))
    }

    pub(crate) fn resolve(
        &self,
        context: Option<&dyn RequestContext>,
        group: &str,
        action: Action,
    ) -> Result<RateSpec> {
        match self {
            Rate::Spec(spec) => Ok(*spec),
            Rate::Dynamic(f) => f(context, group, action),
        }
    }
}

impl From<RateSpec> for Rate {
    fn from(spec: RateSpec) -> Self {
        Rate::Spec(spec)
    }
}

impl fmt::Debug for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rate::Spec(spec) => f.debug_tuple("Spec").field(spec).finish(),
            Rate::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}
