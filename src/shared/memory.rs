//! In-process shared tier.
//!
//! Implements the shared tier contract on a `DashMap` with per-key expiry.
//! Several stores holding the same `Arc<MemorySharedTier>` behave like
//! separate processes talking to one cache server. It can be switched into
//! a failing mode to simulate an outage.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::SharedTier;
use crate::error::{RateCacheError, Result};

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

impl MemoryEntry {
    fn new(value: String, ttl_secs: u64, now: Instant) -> Self {
        Self {
            value,
            expires_at: now + Duration::from_secs(ttl_secs),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// A `DashMap`-backed TTL key-value store.
#[derive(Debug, Default)]
pub struct MemorySharedTier {
    entries: DashMap<String, MemoryEntry>,
    failing: AtomicBool,
    calls: AtomicU64,
}

impl MemorySharedTier {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of calls received, including failed ones.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    /// Whether no live keys are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn enter(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(RateCacheError::SharedTierUnavailable(
                "memory shared tier is in failing mode".to_string(),
            ));
        }
        Ok(())
    }

    fn live_value(&self, key: &str, now: Instant) -> Option<String> {
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove_if(key, |_, e| e.is_expired(now));
        }
        None
    }
}

#[async_trait]
impl SharedTier for MemorySharedTier {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.enter()?;
        Ok(self.live_value(key, Instant::now()))
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        self.enter()?;
        self.entries.insert(
            key.to_string(),
            MemoryEntry::new(value.to_string(), ttl_secs, Instant::now()),
        );
        Ok(())
    }

    async fn increment_and_get_ttl(&self, key: &str, ttl_secs: u64) -> Result<u64> {
        self.enter()?;
        let now = Instant::now();

        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry::new("0".to_string(), ttl_secs, now));

        let current = if entry.is_expired(now) {
            0
        } else {
            entry
                .value
                .parse::<u64>()
                .map_err(|e| RateCacheError::CorruptEntry {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?
        };

        let next = current.saturating_add(1);
        *entry = MemoryEntry::new(next.to_string(), ttl_secs, now);

        trace!(key = %key, value = next, "Incremented shared counter");
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.enter()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn batch_get(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        self.enter()?;
        let now = Instant::now();
        Ok(keys.iter().map(|key| self.live_value(key, now)).collect())
    }

    async fn ping(&self) -> bool {
        self.enter().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_get_set_delete() {
        let tier = MemorySharedTier::new();

        assert_eq!(tier.get("k").await.unwrap(), None);
        tier.set("k", "v", 60).await.unwrap();
        assert_eq!(tier.get("k").await.unwrap(), Some("v".to_string()));

        tier.delete("k").await.unwrap();
        assert_eq!(tier.get("k").await.unwrap(), None);

        // Deleting a missing key is fine
        tier.delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_len_ignores_expired() {
        let tier = MemorySharedTier::new();
        tier.set("live", "1", 60).await.unwrap();
        tier.set("dead", "1", 0).await.unwrap();
        assert_eq!(tier.len(), 1);
        assert!(!tier.is_empty());
    }

    #[tokio::test]
    async fn test_increment_saturates() {
        let tier = MemorySharedTier::new();
        tier.set("c", &u64::MAX.to_string(), 60).await.unwrap();
        assert_eq!(tier.increment_and_get_ttl("c", 60).await.unwrap(), u64::MAX);
    }

    #[tokio::test]
    async fn test_increment_creates_at_one() {
        let tier = MemorySharedTier::new();

        assert_eq!(tier.increment_and_get_ttl("c", 60).await.unwrap(), 1);
        assert_eq!(tier.increment_and_get_ttl("c", 60).await.unwrap(), 2);
        assert_eq!(tier.get("c").await.unwrap(), Some("2".to_string()));
    }

    #[tokio::test]
    async fn test_increment_non_integer_fails() {
        let tier = MemorySharedTier::new();
        tier.set("c", "abc", 60).await.unwrap();
        assert!(tier.increment_and_get_ttl("c", 60).await.is_err());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let tier = MemorySharedTier::new();
        tier.set("k", "v", 0).await.unwrap();
        assert_eq!(tier.get("k").await.unwrap(), None);
        assert_eq!(tier.increment_and_get_ttl("k", 60).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_batch_get_preserves_order() {
        let tier = MemorySharedTier::new();
        tier.set("a", "1", 60).await.unwrap();
        tier.set("c", "3", 60).await.unwrap();

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let values = tier.batch_get(&keys).await.unwrap();
        assert_eq!(values, vec![Some("1".to_string()), None, Some("3".to_string())]);
    }

    #[tokio::test]
    async fn test_failing_mode() {
        let tier = MemorySharedTier::new();
        assert!(tier.ping().await);

        tier.set_failing(true);
        assert!(!tier.ping().await);
        assert!(tier.get("k").await.is_err());
        assert!(tier.increment_and_get_ttl("k", 60).await.is_err());

        tier.set_failing(false);
        assert!(tier.ping().await);
        assert_eq!(tier.call_count(), 5);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_distinct() {
        let tier = Arc::new(MemorySharedTier::new());

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let tier = tier.clone();
                tokio::spawn(async move { tier.increment_and_get_ttl("c", 60).await.unwrap() })
            })
            .collect();

        let mut values: Vec<u64> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        values.sort_unstable();

        assert_eq!(values, (1..=50).collect::<Vec<u64>>());
    }
}
