//! Background eviction of stale local tier entries.
//!
//! The sweep only touches the local tier. Shared tier entries expire
//! through their own TTL.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use super::store::RateCounterStore;
use super::window::now_ms;

/// Spawn the periodic sweep for a store.
///
/// The task holds only a weak reference and exits once the store is dropped.
pub(super) fn spawn_sweeper(store: Weak<RateCounterStore>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;

            let Some(store) = store.upgrade() else {
                debug!("Rate counter store dropped, stopping sweep");
                break;
            };

            let evicted = store.sweep_expired();
            if evicted > 0 {
                debug!(
                    instance_id = %store.instance_id,
                    evicted = evicted,
                    remaining = store.local.len(),
                    "Swept stale local entries"
                );
            } else {
                trace!(instance_id = %store.instance_id, "Sweep found nothing to evict");
            }
        }
    })
}

impl RateCounterStore {
    /// Evict local entries older than twice the window. Returns how many were removed.
    ///
    /// Entries between one and two windows old stay visible for diagnostics
    /// but already read as absent.
    pub fn sweep_expired(&self) -> usize {
        let now = now_ms();
        let window_ms = self.config.window_duration_ms;

        let mut evicted = 0;
        self.local.retain(|_, window| {
            let keep = !window.is_stale(now, window_ms);
            if !keep {
                evicted += 1;
            }
            keep
        });

        evicted
    }
}
