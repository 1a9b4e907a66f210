//! Error types for the rate limiting engine.

use thiserror::Error;

use crate::ratelimit::Ratelimit;

/// Main error type for rate limiting operations.
#[derive(Error, Debug)]
pub enum RatelimitError {
    /// The rate expression did not parse or carried a non-positive period
    #[error("Malformed rate: {0}")]
    MalformedRate(String),

    /// Unknown strategy, invalid option combination or unreadable settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// The compare-and-swap emulation ran out of attempts
    #[error("Cache backend raced on key {key} after {attempts} attempts")]
    BackendRace { key: String, attempts: u32 },

    /// Transport or protocol failure reported by a cache backend
    #[error("Cache backend error: {0}")]
    Backend(String),

    /// The rate limit is zero; the protected logic must not run
    #[error("Ratelimit disabled for group {}", .0.group())]
    Disabled(Box<Ratelimit>),

    /// The budget is used up and blocking was requested
    #[error("Ratelimit exceeded for group {}", .0.group())]
    Exceeded(Box<Ratelimit>),

    /// The result was produced by a bypass and carries no cache handle
    #[error("Ratelimit cannot be reset")]
    NoReset,

    /// The client address could not be determined
    #[error("Invalid client address: {0}")]
    InvalidAddress(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RatelimitError {
    /// The result attached to a `Disabled` or `Exceeded` signal.
    pub fn ratelimit(&self) -> Option<&Ratelimit> {
        match self {
            RatelimitError::Disabled(r) | RatelimitError::Exceeded(r) => Some(r),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for RatelimitError {
    fn from(err: config::ConfigError) -> Self {
        RatelimitError::Config(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for RatelimitError {
    fn from(err: redis::RedisError) -> Self {
        RatelimitError::Backend(err.to_string())
    }
}

/// Result type alias for rate limiting operations.
pub type Result<T> = std::result::Result<T, RatelimitError>;
