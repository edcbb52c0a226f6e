//! Two-tier rate counter store.
//!
//! Counters live in an in-process `DashMap` (the local tier) and, when
//! enabled, are mirrored into a [`SharedTier`] so several processes agree on
//! the same counts. Shared tier failures never reach the caller: every
//! operation degrades to whatever the local tier has observed.

use std::future::Future;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::scope::{Classification, ScopeKey};
use super::sweep;
use super::window::{decode_count, now_ms, RateWindow, WindowMeta};
use crate::config::StoreConfig;
use crate::error::{RateCacheError, Result};
use crate::shared::{SharedKeys, SharedTier};

/// Answer to "has this scope exceeded its limit?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimitStatus {
    /// Whether the recorded attempts are beyond the limit
    pub exceeded: bool,
    /// Attempts recorded in the current window (0 if none)
    pub count: u64,
    /// Configured limit for the classification
    pub limit: u64,
    /// Time until the current window expires (0 if none)
    pub time_remaining_ms: u64,
}

/// Result of recording one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecordOutcome {
    /// Attempts in the window after this one
    pub count: u64,
    /// Whether this attempt opened a new window
    pub is_new_window: bool,
}

/// Aggregate health of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Statistics {
    /// Entries currently held in the local tier
    pub local_entry_count: usize,
    /// Result of a liveness check (false when the shared tier is disabled)
    pub shared_tier_reachable: bool,
    /// Same as `local_entry_count`
    pub total_entries: usize,
    /// Local entries whose window has not expired
    pub active_window_count: usize,
}

/// The two-tier rate counter store.
///
/// Construct with [`RateCounterStore::new`] inside a tokio runtime; the
/// returned `Arc` owns a background sweep task until [`shutdown`] is called
/// or the last reference is dropped.
///
/// [`shutdown`]: RateCounterStore::shutdown
pub struct RateCounterStore {
    /// Store configuration
    pub(super) config: StoreConfig,
    /// Identifies this store in logs
    pub(super) instance_id: Uuid,
    /// The local tier
    pub(super) local: DashMap<ScopeKey, RateWindow>,
    /// The shared tier, present only when enabled
    shared: Option<Arc<dyn SharedTier>>,
    /// Background sweep task
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RateCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateCounterStore")
            .field("instance_id", &self.instance_id)
            .field("config", &self.config)
            .field("local_entries", &self.local.len())
            .field("shared_tier", &self.shared.is_some())
            .finish()
    }
}

impl RateCounterStore {
    /// Create a store and start its background sweep.
    ///
    /// `shared` is used only when `config.use_shared_tier` is set, in which
    /// case it is required.
    pub fn new(config: StoreConfig, shared: Option<Arc<dyn SharedTier>>) -> Result<Arc<Self>> {
        config.validate()?;

        let shared = if config.use_shared_tier {
            match shared {
                Some(tier) => Some(tier),
                None => {
                    return Err(RateCacheError::Config(
                        "use_shared_tier is set but no shared tier was provided".to_string(),
                    ))
                }
            }
        } else {
            None
        };

        if tokio::runtime::Handle::try_current().is_err() {
            return Err(RateCacheError::Config(
                "RateCounterStore must be created inside a tokio runtime".to_string(),
            ));
        }

        let store = Arc::new(Self {
            config,
            instance_id: Uuid::new_v4(),
            local: DashMap::new(),
            shared,
            sweeper: Mutex::new(None),
        });

        let handle = sweep::spawn_sweeper(Arc::downgrade(&store), store.config.sweep_interval());
        *store.sweeper.lock() = Some(handle);

        info!(
            instance_id = %store.instance_id,
            window_ms = store.config.window_duration_ms,
            limit_by_credential = store.config.limit_by_credential,
            limit_by_origin = store.config.limit_by_origin,
            shared_tier = store.shared.is_some(),
            "Rate counter store started"
        );

        Ok(store)
    }

    /// The store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The configured limit for a classification.
    pub fn limit_for(&self, classification: Classification) -> u64 {
        match classification {
            Classification::ByCredential => self.config.limit_by_credential,
            Classification::ByOrigin => self.config.limit_by_origin,
        }
    }

    /// Check whether a scope has exceeded its limit. Never mutates counts.
    pub async fn check_limit(&self, key: &str, classification: Classification) -> Result<LimitStatus> {
        let scope = ScopeKey::new(key, classification)?;
        let limit = self.limit_for(classification);
        let window_ms = self.config.window_duration_ms;
        let now = now_ms();

        let window = self
            .read_window(&scope, now)
            .await
            .filter(|w| !w.is_expired(now, window_ms));

        let status = match window {
            Some(window) => LimitStatus {
                exceeded: window.count > limit,
                count: window.count,
                limit,
                time_remaining_ms: window.time_remaining_ms(now, window_ms),
            },
            None => LimitStatus {
                exceeded: false,
                count: 0,
                limit,
                time_remaining_ms: 0,
            },
        };

        trace!(
            scope = %scope.key,
            classification = %classification,
            count = status.count,
            limit = limit,
            exceeded = status.exceeded,
            "Checked rate limit"
        );

        Ok(status)
    }

    /// Record one attempt for a scope and return the updated count.
    pub async fn record_attempt(
        &self,
        key: &str,
        classification: Classification,
    ) -> Result<RecordOutcome> {
        let scope = ScopeKey::new(key, classification)?;
        let now = now_ms();

        if let Some(shared) = &self.shared {
            match self.record_shared(shared.as_ref(), &scope, now).await {
                Ok((window, is_new_window)) => {
                    self.store_local(&scope, window, now);

                    debug!(
                        scope = %scope.key,
                        classification = %classification,
                        count = window.count,
                        is_new_window = is_new_window,
                        "Recorded attempt in shared tier"
                    );

                    return Ok(RecordOutcome {
                        count: window.count,
                        is_new_window,
                    });
                }
                Err(e) => {
                    error!(
                        scope = %scope.key,
                        classification = %classification,
                        error = %e,
                        "Shared tier record failed, falling back to local tier"
                    );
                }
            }
        }

        let outcome = self.record_local(&scope, now);
        debug!(
            scope = %scope.key,
            classification = %classification,
            count = outcome.count,
            is_new_window = outcome.is_new_window,
            "Recorded attempt in local tier"
        );
        Ok(outcome)
    }

    /// Delete a scope's window from both tiers.
    ///
    /// Returns `false` only if a shared tier delete failed.
    pub async fn reset_limit(&self, key: &str, classification: Classification) -> Result<bool> {
        let scope = ScopeKey::new(key, classification)?;
        self.local.remove(&scope);

        let mut completed = true;
        if let Some(shared) = &self.shared {
            let keys = SharedKeys::new(&self.config.key_prefix, &scope);
            for shared_key in [&keys.count, &keys.window] {
                if let Err(e) = self.shared_call(shared.delete(shared_key)).await {
                    error!(
                        scope = %scope.key,
                        classification = %classification,
                        error = %e,
                        "Failed to delete shared tier entry during reset"
                    );
                    completed = false;
                }
            }
        }

        info!(
            instance_id = %self.instance_id,
            scope = %scope.key,
            classification = %classification,
            completed = completed,
            "Rate limit reset"
        );

        Ok(completed)
    }

    /// Report local tier size, active windows, and shared tier liveness.
    pub async fn get_statistics(&self) -> Statistics {
        let now = now_ms();
        let window_ms = self.config.window_duration_ms;

        let local_entry_count = self.local.len();
        let active_window_count = self
            .local
            .iter()
            .filter(|entry| !entry.value().is_expired(now, window_ms))
            .count();

        let shared_tier_reachable = match &self.shared {
            Some(shared) => tokio::time::timeout(self.config.shared_tier_timeout(), shared.ping())
                .await
                .unwrap_or(false),
            None => false,
        };

        Statistics {
            local_entry_count,
            shared_tier_reachable,
            total_entries: local_entry_count,
            active_window_count,
        }
    }

    /// Warm the local tier from the shared tier in one batched read.
    ///
    /// Returns how many windows were loaded. Failures are logged and
    /// swallowed; invalid scopes are skipped.
    pub async fn preload<S: AsRef<str>>(&self, scopes: &[(S, Classification)]) -> usize {
        let Some(shared) = &self.shared else {
            return 0;
        };

        let scopes: Vec<ScopeKey> = scopes
            .iter()
            .filter_map(|(key, classification)| match ScopeKey::new(key.as_ref(), *classification) {
                Ok(scope) => Some(scope),
                Err(e) => {
                    warn!(error = %e, "Skipping invalid scope during preload");
                    None
                }
            })
            .collect();

        if scopes.is_empty() {
            return 0;
        }

        let keys: Vec<SharedKeys> = scopes
            .iter()
            .map(|scope| SharedKeys::new(&self.config.key_prefix, scope))
            .collect();
        let flat: Vec<String> = keys
            .iter()
            .flat_map(|k| [k.count.clone(), k.window.clone()])
            .collect();

        let values = match self.shared_call(shared.batch_get(&flat)).await {
            Ok(values) if values.len() == flat.len() => values,
            Ok(values) => {
                warn!(
                    expected = flat.len(),
                    received = values.len(),
                    "Shared tier returned a mismatched batch, skipping preload"
                );
                return 0;
            }
            Err(e) => {
                error!(error = %e, scopes = scopes.len(), "Preload from shared tier failed");
                return 0;
            }
        };

        let now = now_ms();
        let mut loaded = 0;
        for ((scope, shared_keys), pair) in scopes.iter().zip(&keys).zip(values.chunks(2)) {
            let Some(window) = decode_shared(shared_keys, pair[0].as_deref(), pair[1].as_deref()) else {
                continue;
            };
            if window.is_expired(now, self.config.window_duration_ms) {
                continue;
            }
            self.store_local(scope, window, now);
            loaded += 1;
        }

        info!(
            instance_id = %self.instance_id,
            requested = scopes.len(),
            loaded = loaded,
            "Preloaded local tier"
        );

        loaded
    }

    /// Stop the background sweep and release the local tier.
    ///
    /// Nothing is flushed to the shared tier; its entries expire on their own.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
            self.local.clear();
            info!(instance_id = %self.instance_id, "Rate counter store shut down");
        }
    }

    /// Detach the sweep task so tests can observe how it ends.
    #[cfg(test)]
    fn take_sweeper(&self) -> Option<JoinHandle<()>> {
        self.sweeper.lock().take()
    }

    /// Read the current window, local tier first, falling back to the shared tier.
    async fn read_window(&self, scope: &ScopeKey, now: i64) -> Option<RateWindow> {
        let window_ms = self.config.window_duration_ms;
        let local = self.local.get(scope).map(|entry| *entry.value());

        if let Some(window) = local {
            if !window.is_expired(now, window_ms) {
                return Some(window);
            }
        }

        let Some(shared) = &self.shared else {
            return local;
        };
        let keys = SharedKeys::new(&self.config.key_prefix, scope);
        let batch = [keys.count.clone(), keys.window.clone()];

        match self.shared_call(shared.batch_get(&batch)).await {
            Ok(values) if values.len() == 2 => {
                match decode_shared(&keys, values[0].as_deref(), values[1].as_deref()) {
                    Some(window) if !window.is_expired(now, window_ms) => {
                        self.store_local(scope, window, now);
                        Some(window)
                    }
                    _ => local,
                }
            }
            Ok(_) => local,
            Err(e) => {
                error!(
                    scope = %scope.key,
                    classification = %scope.classification,
                    error = %e,
                    "Shared tier read failed, using local tier"
                );
                local
            }
        }
    }

    /// Increment the counter in the shared tier.
    ///
    /// The count key is incremented atomically; the window key carries the
    /// timestamps and is rewritten with the same TTL so both expire together.
    /// An expired or corrupt window is restarted at most once per call by
    /// deleting the count key and incrementing again, so the atomic
    /// increment alone decides which caller opens the new window.
    async fn record_shared(
        &self,
        shared: &dyn SharedTier,
        scope: &ScopeKey,
        now: i64,
    ) -> Result<(RateWindow, bool)> {
        let keys = SharedKeys::new(&self.config.key_prefix, scope);
        let ttl = self.config.shared_ttl_secs();
        let window_ms = self.config.window_duration_ms;

        let mut pending = match self
            .shared_call(shared.increment_and_get_ttl(&keys.count, ttl))
            .await
        {
            Ok(count) => Some(count),
            Err(e @ RateCacheError::CorruptEntry { .. }) => {
                warn!(
                    scope = %scope.key,
                    classification = %scope.classification,
                    error = %e,
                    "Corrupt shared count, starting a new window"
                );
                None
            }
            Err(e) => return Err(e),
        };
        let mut restarted = false;

        loop {
            let count = match pending.take() {
                Some(count) => count,
                None => {
                    restarted = true;
                    self.shared_call(shared.delete(&keys.count)).await?;
                    self.shared_call(shared.increment_and_get_ttl(&keys.count, ttl))
                        .await?
                }
            };

            if count == 1 {
                let window = RateWindow::start(now);
                self.shared_call(shared.set(&keys.window, &window.meta().encode(), ttl))
                    .await?;
                return Ok((window, true));
            }

            let raw = self.shared_call(shared.get(&keys.window)).await?;
            let decoded = raw.map(|raw| WindowMeta::decode(&keys.window, &raw));

            let current = match decoded {
                Some(Ok(meta)) => {
                    let window = RateWindow::from_parts(count, meta);
                    if window.is_expired(now, window_ms) {
                        None
                    } else {
                        Some(window)
                    }
                }
                Some(Err(e)) => {
                    warn!(
                        scope = %scope.key,
                        classification = %scope.classification,
                        error = %e,
                        "Corrupt shared window"
                    );
                    None
                }
                // Another caller incremented first and has not written the
                // timestamps yet; keep its count.
                None => Some(RateWindow::from_parts(count, WindowMeta::starting_at(now))),
            };

            let mut window = match current {
                Some(window) => window,
                None if !restarted => continue,
                // Someone else restarted concurrently and still holds the old timestamps
                None => RateWindow::from_parts(count, WindowMeta::starting_at(now)),
            };

            window.last_attempt = now;
            self.shared_call(shared.set(&keys.window, &window.meta().encode(), ttl))
                .await?;

            return Ok((window, false));
        }
    }

    /// Read-modify-write on the local tier under the entry's shard lock.
    fn record_local(&self, scope: &ScopeKey, now: i64) -> RecordOutcome {
        if !self.local.contains_key(scope) {
            self.ensure_capacity(now);
        }

        let window_ms = self.config.window_duration_ms;
        match self.local.entry(scope.clone()) {
            Entry::Occupied(mut entry) => {
                let is_new_window = entry.get_mut().record(now, window_ms);
                RecordOutcome {
                    count: entry.get().count,
                    is_new_window,
                }
            }
            Entry::Vacant(entry) => {
                let window = entry.insert(RateWindow::start(now));
                RecordOutcome {
                    count: window.count,
                    is_new_window: true,
                }
            }
        }
    }

    /// Mirror a window into the local tier.
    ///
    /// Never moves an entry backwards: an older window, or a lower count for
    /// the same window, is dropped.
    fn store_local(&self, scope: &ScopeKey, window: RateWindow, now: i64) {
        if !self.local.contains_key(scope) {
            self.ensure_capacity(now);
        }

        match self.local.entry(scope.clone()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                let newer = window.window_start > current.window_start
                    || (window.window_start == current.window_start
                        && window.count > current.count);
                if newer {
                    entry.insert(window);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(window);
            }
        }
    }

    /// Make room for one more entry once the local tier is at its bound.
    ///
    /// Expired windows go first, then the least recently attempted ones,
    /// down to 90% of the bound so the scan is amortized over many inserts.
    fn ensure_capacity(&self, now: i64) {
        let max = self.config.max_local_entries;
        if self.local.len() < max {
            return;
        }

        let window_ms = self.config.window_duration_ms;
        self.local.retain(|_, window| !window.is_expired(now, window_ms));

        let target = max - max / 10 - 1;
        let len = self.local.len();
        if len <= target {
            return;
        }

        let mut by_age: Vec<(i64, ScopeKey)> = self
            .local
            .iter()
            .map(|entry| (entry.value().last_attempt, entry.key().clone()))
            .collect();
        by_age.sort_unstable_by_key(|(last_attempt, _)| *last_attempt);

        let excess = len - target;
        for (_, scope) in by_age.into_iter().take(excess) {
            self.local.remove(&scope);
        }

        warn!(
            instance_id = %self.instance_id,
            evicted = excess,
            max_local_entries = max,
            "Local tier full, evicted least recently attempted windows"
        );
    }

    /// Bound a shared tier call by the configured timeout.
    async fn shared_call<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.config.shared_tier_timeout(), call).await {
            Ok(result) => result,
            Err(_) => Err(RateCacheError::SharedTierTimeout(
                self.config.shared_tier_timeout_ms,
            )),
        }
    }
}

/// Combine a shared tier count and window value into a window.
///
/// Missing halves read as absent; corrupt values are logged and read as absent.
fn decode_shared(keys: &SharedKeys, count: Option<&str>, window: Option<&str>) -> Option<RateWindow> {
    let (Some(count), Some(window)) = (count, window) else {
        return None;
    };

    let decoded = decode_count(&keys.count, count)
        .and_then(|count| WindowMeta::decode(&keys.window, window).map(|meta| (count, meta)));

    match decoded {
        Ok((count, meta)) => Some(RateWindow::from_parts(count, meta)),
        Err(e) => {
            warn!(error = %e, "Ignoring corrupt shared tier entry");
            None
        }
    }
}

impl Drop for RateCounterStore {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}
