//! Redis-backed cache.
//!
//! States are stored as `"<count>:<window_start>"` strings so plain `GET`
//! stays readable; the window-aware increment and the compare-and-swap run as
//! Lua scripts to keep them atomic on the server.

use std::time::Duration;

use parking_lot::Mutex;
use redis::{Connection, Script};
use tracing::{debug, info};

use super::{CacheBackend, WindowState};
use crate::error::{RatelimitError, Result};

/// KEYS[1] = cache key
/// ARGV[1] = delta
/// ARGV[2] = current window start
/// ARGV[3] = ttl seconds
///
/// Returns: [count, window_start]
const INCREMENT_SCRIPT: &str = r#"
local key = KEYS[1]
local delta = tonumber(ARGV[1])
local start = tonumber(ARGV[2])

local current = redis.call('GET', key)
if current then
    local count, stored = string.match(current, '^(%d+):(%d+)$')
    if stored and tonumber(stored) == start then
        count = tonumber(count) + delta
        redis.call('SET', key, count .. ':' .. start, 'KEEPTTL')
        return {count, start}
    end
end

redis.call('SET', key, delta .. ':' .. start, 'EX', ARGV[3])
return {delta, start}
"#;

/// KEYS[1] = cache key
/// ARGV[1] = expected encoded state
/// ARGV[2] = new encoded state
/// ARGV[3] = ttl seconds
///
/// Returns: 1 when swapped, 0 otherwise
const COMPARE_AND_SWAP_SCRIPT: &str = r#"
local key = KEYS[1]
if redis.call('GET', key) == ARGV[1] then
    redis.call('SET', key, ARGV[2], 'EX', ARGV[3])
    return 1
end
return 0
"#;

/// Cache backend talking to a single Redis server.
pub struct RedisCache {
    connection: Mutex<Connection>,
    increment: Script,
    compare_and_swap: Script,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache").finish_non_exhaustive()
    }
}

impl RedisCache {
    /// Connect to the server at `redis_url`.
    pub fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let connection = client.get_connection()?;
        info!(url = %redis_url, "Connected to Redis cache");

        Ok(Self {
            connection: Mutex::new(connection),
            increment: Script::new(INCREMENT_SCRIPT),
            compare_and_swap: Script::new(COMPARE_AND_SWAP_SCRIPT),
        })
    }

    /// Test the connection.
    pub fn ping(&self) -> Result<()> {
        let mut con = self.connection.lock();
        redis::cmd("PING").query::<String>(&mut *con)?;
        Ok(())
    }
}

fn encode(state: WindowState) -> String {
    format!("{}:{}", state.count, state.window_start)
}

fn decode(key: &str, raw: &str) -> Result<WindowState> {
    let parsed = raw
        .split_once(':')
        .and_then(|(count, start)| Some(WindowState::new(count.parse().ok()?, start.parse().ok()?)));
    parsed.ok_or_else(|| {
        RatelimitError::Backend(format!("unreadable window state under {}: {:?}", key, raw))
    })
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

impl CacheBackend for RedisCache {
    fn get(&self, key: &str) -> Result<Option<WindowState>> {
        let mut con = self.connection.lock();
        let raw: Option<String> = redis::cmd("GET").arg(key).query(&mut *con)?;
        raw.map(|raw| decode(key, &raw)).transpose()
    }

    fn add(&self, key: &str, state: WindowState, ttl: Duration) -> Result<bool> {
        let mut con = self.connection.lock();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(encode(state))
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query(&mut *con)?;
        Ok(reply.is_some())
    }

    fn set(&self, key: &str, state: WindowState, ttl: Duration) -> Result<()> {
        let mut con = self.connection.lock();
        redis::cmd("SET")
            .arg(key)
            .arg(encode(state))
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query::<()>(&mut *con)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut con = self.connection.lock();
        redis::cmd("DEL").arg(key).query::<()>(&mut *con)?;
        Ok(())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: WindowState,
        new: WindowState,
        ttl: Duration,
    ) -> Result<bool> {
        let mut con = self.connection.lock();
        let swapped: i64 = self
            .compare_and_swap
            .key(key)
            .arg(encode(expected))
            .arg(encode(new))
            .arg(ttl_secs(ttl))
            .invoke(&mut *con)?;
        Ok(swapped == 1)
    }

    fn increment_or_create(
        &self,
        key: &str,
        delta: u64,
        window_start: u64,
        ttl: Duration,
    ) -> Result<Option<WindowState>> {
        let mut con = self.connection.lock();
        let reply: Vec<u64> = self
            .increment
            .key(key)
            .arg(delta)
            .arg(window_start)
            .arg(ttl_secs(ttl))
            .invoke(&mut *con)?;

        match reply.as_slice() {
            [count, start] => {
                debug!(key = %key, count, window_start = start, "Redis window incremented");
                Ok(Some(WindowState::new(*count, *start)))
            }
            other => Err(RatelimitError::Backend(format!(
                "unexpected increment reply for {}: {:?}",
                key, other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests require a running Redis instance.
    // Run with: cargo test --features redis -- --ignored

    fn unique_key(name: &str) -> String {
        format!(
            "fastratelimit:test:{}:{}",
            name,
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        )
    }

    #[test]
    fn test_state_encoding() {
        let state = WindowState::new(7, 1_700_000_000);
        assert_eq!(decode("k", &encode(state)).unwrap(), state);
        assert!(decode("k", "garbage").is_err());
    }

    #[test]
    #[ignore]
    fn test_redis_increment_or_create() {
        let cache = RedisCache::connect("redis://127.0.0.1:6379").expect("Failed to connect to Redis");
        let key = unique_key("incr");
        let ttl = Duration::from_secs(10);

        let first = cache.increment_or_create(&key, 1, 100, ttl).unwrap().unwrap();
        assert_eq!(first, WindowState::new(1, 100));
        let second = cache.increment_or_create(&key, 1, 100, ttl).unwrap().unwrap();
        assert_eq!(second.count, 2);
        let rolled = cache.increment_or_create(&key, 1, 110, ttl).unwrap().unwrap();
        assert_eq!(rolled, WindowState::new(1, 110));

        cache.delete(&key).unwrap();
        assert!(cache.get(&key).unwrap().is_none());
    }

    #[test]
    #[ignore]
    fn test_redis_add_and_compare_and_swap() {
        let cache = RedisCache::connect("redis://127.0.0.1:6379").expect("Failed to connect to Redis");
        assert!(cache.ping().is_ok());
        let key = unique_key("cas");
        let ttl = Duration::from_secs(10);
        let state = WindowState::new(1, 100);

        assert!(cache.add(&key, state, ttl).unwrap());
        assert!(!cache.add(&key, state, ttl).unwrap());
        assert!(cache
            .compare_and_swap(&key, state, WindowState::new(2, 100), ttl)
            .unwrap());
        assert!(!cache
            .compare_and_swap(&key, state, WindowState::new(3, 100), ttl)
            .unwrap());

        cache.delete(&key).unwrap();
    }
}
