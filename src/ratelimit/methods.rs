//! HTTP method sets used to decide whether a call is counted at all.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{RatelimitError, Result};

const SAFE_METHODS: [&str; 3] = ["GET", "HEAD", "OPTIONS"];

/// A set of HTTP methods, possibly inverted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodSet {
    /// Only the listed methods.
    Only(BTreeSet<String>),
    /// Every method except the listed ones.
    AllExcept(BTreeSet<String>),
}

impl MethodSet {
    /// Every method.
    pub fn all() -> Self {
        MethodSet::AllExcept(BTreeSet::new())
    }

    /// `GET`, `HEAD` and `OPTIONS`.
    pub fn safe() -> Self {
        MethodSet::Only(SAFE_METHODS.iter().map(|m| m.to_string()).collect())
    }

    /// Everything but the safe methods.
    pub fn unsafe_methods() -> Self {
        MethodSet::AllExcept(SAFE_METHODS.iter().map(|m| m.to_string()).collect())
    }

    /// Only the given methods.
    pub fn only<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MethodSet::Only(methods.into_iter().map(Into::into).collect())
    }

    /// Whether `method` is counted.
    pub fn contains(&self, method: &str) -> bool {
        match self {
            MethodSet::Only(set) => set.contains(method),
            MethodSet::AllExcept(set) => !set.contains(method),
        }
    }

    /// Whether every method is counted.
    pub fn is_all(&self) -> bool {
        matches!(self, MethodSet::AllExcept(set) if set.is_empty())
    }

    /// Reject lowercase method names.
    pub fn validate(&self) -> Result<()> {
        let set = match self {
            MethodSet::Only(set) | MethodSet::AllExcept(set) => set,
        };
        match set.iter().find(|m| m.chars().any(|c| c.is_ascii_lowercase())) {
            Some(m) => Err(RatelimitError::Config(format!(
                "method names must be uppercase: {}",
                m
            ))),
            None => Ok(()),
        }
    }

    /// Bytes mixed into the key fingerprint: a marker, the number of
    /// methods, then each method length-prefixed, so whatever follows can
    /// not be read as another method.
    pub(crate) fn fingerprint_bytes(&self) -> Vec<u8> {
        let (marker, set) = match self {
            MethodSet::Only(set) => (b'n', set),
            MethodSet::AllExcept(set) => (b'i', set),
        };
        let mut out = vec![marker];
        out.extend_from_slice(&(set.len() as u32).to_be_bytes());
        // BTreeSet iterates sorted
        for method in set {
            out.extend_from_slice(&(method.len() as u32).to_be_bytes());
            out.extend_from_slice(method.as_bytes());
        }
        out
    }
}

impl Default for MethodSet {
    fn default() -> Self {
        MethodSet::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_contains_everything() {
        let all = MethodSet::all();
        assert!(all.contains("GET"));
        assert!(all.contains("PATCH"));
        assert!(all.is_all());
    }

    #[test]
    fn test_safe_and_unsafe_are_complements() {
        for method in ["GET", "HEAD", "OPTIONS", "POST", "PUT", "DELETE"] {
            assert_ne!(
                MethodSet::safe().contains(method),
                MethodSet::unsafe_methods().contains(method),
                "{}",
                method
            );
        }
    }

    #[test]
    fn test_validate_rejects_lowercase() {
        assert!(MethodSet::only(["post"]).validate().is_err());
        assert!(MethodSet::only(["POST"]).validate().is_ok());
    }

    #[test]
    fn test_fingerprint_distinguishes_inversion() {
        let only = MethodSet::only(["GET"]);
        let except = MethodSet::AllExcept(["GET".to_string()].into_iter().collect());
        assert_ne!(only.fingerprint_bytes(), except.fingerprint_bytes());
    }

    #[test]
    fn test_fingerprint_is_length_prefixed() {
        let bytes = MethodSet::only(["GET", "POST"]).fingerprint_bytes();
        assert_eq!(
            bytes,
            [b"n".as_slice(), &2u32.to_be_bytes(), &3u32.to_be_bytes(), b"GET", &4u32.to_be_bytes(), b"POST"]
                .concat()
        );
        assert_ne!(
            MethodSet::only(["GETPOST"]).fingerprint_bytes(),
            MethodSet::only(["GET", "POST"]).fingerprint_bytes()
        );
    }
}
