//! Shared tier abstraction.
//!
//! The shared tier is an external TTL-keyed key-value store that gives
//! several processes a consistent view of the same counters. The store only
//! relies on the six primitives of [`SharedTier`].

mod memory;
#[cfg(feature = "redis")]
mod redis;

use async_trait::async_trait;

use crate::error::Result;
use crate::ratelimit::{Classification, ScopeKey};

pub use memory::MemorySharedTier;
#[cfg(feature = "redis")]
pub use self::redis::RedisSharedTier;

/// A TTL-keyed key-value store shared between processes.
#[async_trait]
pub trait SharedTier: Send + Sync {
    /// Get the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, expiring after `ttl_secs`.
    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;

    /// Atomically increment the integer under `key` and (re)apply `ttl_secs`.
    ///
    /// A missing key is created at 1.
    async fn increment_and_get_ttl(&self, key: &str, ttl_secs: u64) -> Result<u64>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Get several keys in one round trip, results in the same order.
    async fn batch_get(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    /// Liveness check.
    async fn ping(&self) -> bool;
}

/// Which half of a window a shared tier key holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// The atomically incremented attempt count
    Count,
    /// The JSON-encoded window timestamps
    Window,
}

impl KeyKind {
    fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Count => "count",
            KeyKind::Window => "window",
        }
    }
}

/// Shared tier key layout for one scope.
///
/// Format: `{prefix}|{classification}|{key}|{kind}`. The identity sits
/// between the first and last delimiters so it may itself contain `|`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedKeys {
    /// Key holding the attempt count
    pub count: String,
    /// Key holding the window timestamps
    pub window: String,
}

impl SharedKeys {
    /// Build both keys for a scope.
    pub fn new(prefix: &str, scope: &ScopeKey) -> Self {
        Self {
            count: encode_key(prefix, scope, KeyKind::Count),
            window: encode_key(prefix, scope, KeyKind::Window),
        }
    }
}

/// Encode one shared tier key.
pub fn encode_key(prefix: &str, scope: &ScopeKey, kind: KeyKind) -> String {
    format!(
        "{}|{}|{}|{}",
        prefix,
        scope.classification.as_str(),
        scope.key,
        kind.as_str()
    )
}

/// Parse a shared tier key back into its scope and kind.
pub fn decode_key(prefix: &str, raw: &str) -> Option<(ScopeKey, KeyKind)> {
    let rest = raw.strip_prefix(prefix)?.strip_prefix('|')?;

    let last_sep = rest.rfind('|')?;
    let kind = match &rest[last_sep + 1..] {
        "count" => KeyKind::Count,
        "window" => KeyKind::Window,
        _ => return None,
    };

    let before_kind = &rest[..last_sep];
    let first_sep = before_kind.find('|')?;
    let classification: Classification = before_kind[..first_sep].parse().ok()?;
    let scope = ScopeKey::new(&before_kind[first_sep + 1..], classification).ok()?;

    Some((scope, kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_keys() {
        let scope = ScopeKey::new("203.0.113.5", Classification::ByOrigin).unwrap();
        let keys = SharedKeys::new("ratelimit", &scope);
        assert_eq!(keys.count, "ratelimit|by-origin|203.0.113.5|count");
        assert_eq!(keys.window, "ratelimit|by-origin|203.0.113.5|window");
    }

    #[test]
    fn test_decode_key() {
        let scope = ScopeKey::new("a|b@example.com", Classification::ByCredential).unwrap();
        let raw = encode_key("app", &scope, KeyKind::Window);

        let (parsed, kind) = decode_key("app", &raw).unwrap();
        assert_eq!(parsed, scope);
        assert_eq!(kind, KeyKind::Window);
    }

    #[test]
    fn test_decode_key_invalid() {
        assert!(decode_key("app", "invalid").is_none());
        assert!(decode_key("app", "other|by-origin|x|count").is_none());
        assert!(decode_key("app", "app|by-origin|x|total").is_none());
        assert!(decode_key("app", "app|by-phone|x|count").is_none());
        assert!(decode_key("app", "app|by-origin||count").is_none());
    }
}
