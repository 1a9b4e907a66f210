//! Rate limiting logic and state management.

mod engine;
mod epoch;
mod fingerprint;
mod key;
mod limiter;
mod methods;
mod rate;
mod result;
mod rules;
mod strategies;
mod window;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RatelimitError;

pub use engine::{Engine, EngineBuilder, Query};
pub use epoch::{Epoch, EpochTracker};
pub use fingerprint::{Fingerprinter, HashAlgorithm, HashMode};
pub use key::{Group, GroupFn, KeyFn, KeyResolver, KeySpec, ResolvedKey};
pub use limiter::{RateLimiter, RatelimitSlot};
pub use methods::MethodSet;
pub use rate::{parse_rate, Rate, RateFn, RateSpec, TimeUnit};
pub use result::{Ratelimit, RatelimitSnapshot, ResetAmount, TokioWaiter, Waiter};
pub use rules::{KeyConfig, LimitRule, LimiterRules};
pub use strategies::{exploded, KeyStrategy, Netmask, StrategyInput, StrategyRegistry};
pub use window::{window_start, WindowCache, WindowOutcome, MAX_CAS_ATTEMPTS};

/// What an evaluation does to the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Read only.
    #[default]
    Peek,
    /// Count one event.
    Increase,
    /// Delete the counter.
    Reset,
    /// Undo the events counted on behalf of an epoch.
    ResetEpoch,
}

impl Action {
    /// Whether this action resets.
    pub fn is_reset(&self) -> bool {
        matches!(self, Action::Reset | Action::ResetEpoch)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Peek => "peek",
            Action::Increase => "increase",
            Action::Reset => "reset",
            Action::ResetEpoch => "reset_epoch",
        })
    }
}

impl FromStr for Action {
    type Err = RatelimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "peek" => Ok(Action::Peek),
            "increase" => Ok(Action::Increase),
            "reset" => Ok(Action::Reset),
            "reset_epoch" => Ok(Action::ResetEpoch),
            other => Err(RatelimitError::Config(format!("unknown action: {}", other))),
        }
    }
}
