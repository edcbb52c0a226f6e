//! Scope key generation and handling.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RateCacheError, Result};

/// How a scope key was derived, which also selects its configured limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    /// Keyed by a credential such as an email address
    ByCredential,
    /// Keyed by a network origin such as a client IP address
    ByOrigin,
}

impl Classification {
    /// Stable tag used in shared tier keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::ByCredential => "by-credential",
            Classification::ByOrigin => "by-origin",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = RateCacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "by-credential" | "credential" | "email" => Ok(Classification::ByCredential),
            "by-origin" | "origin" | "ip" => Ok(Classification::ByOrigin),
            other => Err(RateCacheError::InvalidInput(format!(
                "unknown classification '{}'",
                other
            ))),
        }
    }
}

/// A key that uniquely identifies one rate limit counter.
///
/// The caller-supplied identity is kept as given; callers are expected to
/// hash anything secret before it reaches the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    /// The classification of this scope
    pub classification: Classification,
    /// Caller-supplied identity (email, address, ...)
    pub key: String,
}

impl ScopeKey {
    /// Create a new scope key, rejecting empty identities.
    pub fn new(key: &str, classification: Classification) -> Result<Self> {
        if key.trim().is_empty() {
            return Err(RateCacheError::InvalidInput(
                "scope key must not be empty".to_string(),
            ));
        }

        Ok(Self {
            classification,
            key: key.to_string(),
        })
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.classification, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_key_creation() {
        let key = ScopeKey::new("alice@example.com", Classification::ByCredential).unwrap();
        assert_eq!(key.key, "alice@example.com");
        assert_eq!(key.classification, Classification::ByCredential);
        assert_eq!(key.to_string(), "by-credential:alice@example.com");
    }

    #[test]
    fn test_empty_scope_key_rejected() {
        assert!(matches!(
            ScopeKey::new("", Classification::ByOrigin),
            Err(RateCacheError::InvalidInput(_))
        ));
        assert!(ScopeKey::new("   ", Classification::ByOrigin).is_err());
    }

    #[test]
    fn test_same_identity_different_classification() {
        let a = ScopeKey::new("shared", Classification::ByCredential).unwrap();
        let b = ScopeKey::new("shared", Classification::ByOrigin).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_classification_parsing() {
        assert_eq!("email".parse::<Classification>().unwrap(), Classification::ByCredential);
        assert_eq!("IP".parse::<Classification>().unwrap(), Classification::ByOrigin);
        assert_eq!(
            "by-origin".parse::<Classification>().unwrap(),
            Classification::ByOrigin
        );
        assert!(matches!(
            "phone".parse::<Classification>(),
            Err(RateCacheError::InvalidInput(_))
        ));
    }
}
