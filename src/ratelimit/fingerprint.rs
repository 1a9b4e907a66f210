//! Cache key derivation.
//!
//! Group and key material are hashed independently and joined with the
//! prefix, so equal keys in different groups (and different keys in one
//! group) never share a counter.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

use crate::error::{RatelimitError, Result};

use super::MethodSet;

/// Digest used for group names and key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// Hash the concatenation of `parts`.
    pub fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha224 => digest_with::<Sha224>(parts),
            HashAlgorithm::Sha256 => digest_with::<Sha256>(parts),
            HashAlgorithm::Sha384 => digest_with::<Sha384>(parts),
            HashAlgorithm::Sha512 => digest_with::<Sha512>(parts),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha224 => "sha224",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }
}

fn digest_with<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = D::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = RatelimitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha224" => Ok(HashAlgorithm::Sha224),
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha384" => Ok(HashAlgorithm::Sha384),
            "sha512" => Ok(HashAlgorithm::Sha512),
            other => Err(RatelimitError::Config(format!(
                "unsupported hash algorithm: {}",
                other
            ))),
        }
    }
}

/// How the cache key is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashMode {
    /// `prefix + H(group) + ":" + H(period, methods, key)`
    #[default]
    Separate,
    /// `prefix + ":" + H(period, methods, key)`; the caller has folded the
    /// group into the key material.
    KeyOnly,
    /// `prefix + H(group) + ":=" + key`; the key is not hashed.
    Verbatim,
}

/// Builds cache keys for one prefix and pair of digests.
#[derive(Debug, Clone, Copy)]
pub struct Fingerprinter<'a> {
    pub prefix: &'a str,
    pub group_hash: HashAlgorithm,
    pub key_hash: HashAlgorithm,
    pub mode: HashMode,
}

impl Fingerprinter<'_> {
    /// Cache key of `key` in `group` for a window of `period` seconds
    /// counting `methods`.
    pub fn cache_key(&self, group: &str, period: u64, methods: &MethodSet, key: &[u8]) -> String {
        match self.mode {
            HashMode::Separate => format!(
                "{}{}:{}",
                self.prefix,
                self.group_part(group),
                self.key_part(period, methods, key)
            ),
            HashMode::KeyOnly => format!("{}:{}", self.prefix, self.key_part(period, methods, key)),
            HashMode::Verbatim => format!(
                "{}{}:={}",
                self.prefix,
                self.group_part(group),
                URL_SAFE_NO_PAD.encode(key)
            ),
        }
    }

    fn group_part(&self, group: &str) -> String {
        URL_SAFE_NO_PAD.encode(self.group_hash.digest(&[group.as_bytes()]))
    }

    fn key_part(&self, period: u64, methods: &MethodSet, key: &[u8]) -> String {
        let period = period.to_string();
        let methods = methods.fingerprint_bytes();
        URL_SAFE_NO_PAD.encode(self.key_hash.digest(&[period.as_bytes(), methods.as_slice(), key]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprinter(mode: HashMode) -> Fingerprinter<'static> {
        Fingerprinter {
            prefix: "frl:",
            group_hash: HashAlgorithm::Sha224,
            key_hash: HashAlgorithm::Sha256,
            mode,
        }
    }

    #[test]
    fn test_cache_key_is_deterministic() {
        let fp = fingerprinter(HashMode::Separate);
        let all = MethodSet::all();
        let a = fp.cache_key("login", 60, &all, b"10.0.0.1");
        assert_eq!(a, fp.cache_key("login", 60, &all, b"10.0.0.1"));
        assert!(a.starts_with("frl:"));
    }

    #[test]
    fn test_group_and_key_do_not_collide() {
        let fp = fingerprinter(HashMode::Separate);
        let all = MethodSet::all();
        let base = fp.cache_key("a", 60, &all, b"k");
        assert_ne!(base, fp.cache_key("b", 60, &all, b"k"));
        assert_ne!(base, fp.cache_key("a", 60, &all, b"j"));
        // moving bytes between group and key must not collide
        assert_ne!(
            fp.cache_key("ab", 60, &all, b"c"),
            fp.cache_key("a", 60, &all, b"bc")
        );
    }

    #[test]
    fn test_period_and_methods_change_key() {
        let fp = fingerprinter(HashMode::Separate);
        let all = MethodSet::all();
        let base = fp.cache_key("g", 60, &all, b"k");
        assert_ne!(base, fp.cache_key("g", 61, &all, b"k"));
        assert_ne!(base, fp.cache_key("g", 60, &MethodSet::safe(), b"k"));
    }

    #[test]
    fn test_methods_and_key_do_not_collide() {
        let fp = fingerprinter(HashMode::Separate);
        assert_ne!(
            fp.cache_key("g", 60, &MethodSet::only(["GET"]), b"POSTk"),
            fp.cache_key("g", 60, &MethodSet::only(["GET", "POST"]), b"k")
        );
    }

    #[test]
    fn test_key_only_mode_ignores_group() {
        let fp = fingerprinter(HashMode::KeyOnly);
        let all = MethodSet::all();
        let key = fp.cache_key("a", 60, &all, b"k");
        assert_eq!(key, fp.cache_key("b", 60, &all, b"k"));
        assert!(key.starts_with("frl::"));
    }

    #[test]
    fn test_verbatim_mode_keeps_raw_key() {
        let fp = fingerprinter(HashMode::Verbatim);
        let key = fp.cache_key("a", 60, &MethodSet::all(), b"raw");
        assert!(key.ends_with(&format!(":={}", URL_SAFE_NO_PAD.encode(b"raw"))));
    }

    #[test]
    fn test_hashed_keys_fit_memcache_limit() {
        let fp = Fingerprinter {
            prefix: "frl:",
            group_hash: HashAlgorithm::Sha512,
            key_hash: HashAlgorithm::Sha512,
            mode: HashMode::Separate,
        };
        let long = vec![b'x'; 4096];
        let key = fp.cache_key(&"g".repeat(1000), 86400, &MethodSet::unsafe_methods(), &long);
        assert!(key.len() < 250, "{}", key.len());
        assert!(key.is_ascii());
    }

    #[test]
    fn test_hash_algorithm_from_str() {
        assert_eq!("SHA384".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha384);
        assert!("md5".parse::<HashAlgorithm>().is_err());
        assert_eq!(HashAlgorithm::Sha224.to_string(), "sha224");
    }
}
