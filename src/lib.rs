//! Fastratelimit - Fixed-Window Rate Limiting Engine
//!
//! This crate decides whether a call may proceed by counting events per
//! derived key in fixed, clock-aligned windows. Counters live in a shared
//! cache (in-memory, or Redis with the `redis` feature), so every process
//! talking to the same cache enforces the same budgets.

pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod ratelimit;

pub use config::RatelimitSettings;
pub use error::{RatelimitError, Result};
pub use ratelimit::{
    parse_rate, Action, Engine, Query, RateLimiter, RateSpec, Ratelimit, RatelimitSlot,
};
