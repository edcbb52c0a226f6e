//! Rate window state and rollover rules.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{RateCacheError, Result};

/// Multiplier on the window length after which the sweep evicts an entry.
pub const SWEEP_GRACE_MULTIPLIER: u64 = 2;

/// Current wall-clock time in epoch milliseconds.
///
/// Window starts are compared across processes, so this is not monotonic.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// The state of one scope's attempts within the current limiting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    /// Attempts recorded since `window_start`
    pub count: u64,
    /// When the current window began (epoch ms)
    pub window_start: i64,
    /// First attempt of this window (epoch ms)
    pub first_attempt: i64,
    /// Most recent attempt (epoch ms)
    pub last_attempt: i64,
}

impl RateWindow {
    /// Open a new window holding a single attempt.
    pub fn start(now: i64) -> Self {
        Self {
            count: 1,
            window_start: now,
            first_attempt: now,
            last_attempt: now,
        }
    }

    /// Rebuild a window from a shared tier counter and its timestamps.
    pub fn from_parts(count: u64, meta: WindowMeta) -> Self {
        Self {
            count,
            window_start: meta.window_start,
            first_attempt: meta.first_attempt,
            last_attempt: meta.last_attempt,
        }
    }

    /// The timestamps half of this window, as stored in the shared tier.
    pub fn meta(&self) -> WindowMeta {
        WindowMeta {
            window_start: self.window_start,
            first_attempt: self.first_attempt,
            last_attempt: self.last_attempt,
        }
    }

    /// Milliseconds since the window began. A clock that moved backwards reads as zero.
    pub fn age_ms(&self, now: i64) -> u64 {
        u64::try_from(now.saturating_sub(self.window_start)).unwrap_or(0)
    }

    /// Whether the window has logically expired and must read as absent.
    pub fn is_expired(&self, now: i64, window_ms: u64) -> bool {
        self.age_ms(now) > window_ms
    }

    /// Whether the sweep should evict this entry.
    pub fn is_stale(&self, now: i64, window_ms: u64) -> bool {
        self.age_ms(now) > window_ms.saturating_mul(SWEEP_GRACE_MULTIPLIER)
    }

    /// Time left before the window expires, floored at zero.
    pub fn time_remaining_ms(&self, now: i64, window_ms: u64) -> u64 {
        window_ms.saturating_sub(self.age_ms(now))
    }

    /// Record one attempt, rolling over to a new window if this one expired.
    ///
    /// Returns `true` if a new window was started.
    pub fn record(&mut self, now: i64, window_ms: u64) -> bool {
        if self.is_expired(now, window_ms) {
            *self = Self::start(now);
            return true;
        }

        self.count = self.count.saturating_add(1);
        self.last_attempt = now;
        false
    }
}

/// Window timestamps as persisted alongside the shared tier counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowMeta {
    pub window_start: i64,
    pub first_attempt: i64,
    pub last_attempt: i64,
}

impl WindowMeta {
    /// Timestamps of a window that begins at `now`.
    pub fn starting_at(now: i64) -> Self {
        Self {
            window_start: now,
            first_attempt: now,
            last_attempt: now,
        }
    }

    /// Serialize to the shared tier representation.
    pub fn encode(&self) -> String {
        // Plain integers only, serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse the shared tier representation stored under `key`.
    pub fn decode(key: &str, raw: &str) -> Result<Self> {
        let meta: WindowMeta =
            serde_json::from_str(raw).map_err(|e| RateCacheError::CorruptEntry {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        if meta.first_attempt < meta.window_start || meta.last_attempt < meta.window_start {
            return Err(RateCacheError::CorruptEntry {
                key: key.to_string(),
                reason: "attempt timestamps precede window start".to_string(),
            });
        }

        Ok(meta)
    }
}

/// Parse a shared tier counter value stored under `key`.
pub fn decode_count(key: &str, raw: &str) -> Result<u64> {
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(RateCacheError::CorruptEntry {
            key: key.to_string(),
            reason: "count must be at least 1".to_string(),
        }),
        Ok(count) => Ok(count),
        Err(e) => Err(RateCacheError::CorruptEntry {
            key: key.to_string(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: u64 = 60_000;

    #[test]
    fn test_start_window() {
        let window = RateWindow::start(1_000);
        assert_eq!(window.count, 1);
        assert_eq!(window.window_start, 1_000);
        assert_eq!(window.first_attempt, window.window_start);
        assert_eq!(window.last_attempt, 1_000);
    }

    #[test]
    fn test_record_within_window() {
        let mut window = RateWindow::start(1_000);

        for expected in 2..=5 {
            assert!(!window.record(1_000 + expected as i64, WINDOW));
            assert_eq!(window.count, expected);
        }

        assert_eq!(window.window_start, 1_000);
        assert_eq!(window.last_attempt, 1_005);
    }

    #[test]
    fn test_record_at_window_boundary_stays_in_window() {
        let mut window = RateWindow::start(0);
        assert!(!window.record(WINDOW as i64, WINDOW));
        assert_eq!(window.count, 2);
    }

    #[test]
    fn test_record_after_window_rolls_over() {
        let mut window = RateWindow::start(0);
        window.record(10, WINDOW);

        assert!(window.record(WINDOW as i64 + 1, WINDOW));
        assert_eq!(window.count, 1);
        assert_eq!(window.window_start, WINDOW as i64 + 1);
        assert_eq!(window.first_attempt, WINDOW as i64 + 1);
    }

    #[test]
    fn test_time_remaining() {
        let window = RateWindow::start(0);
        assert_eq!(window.time_remaining_ms(0, WINDOW), WINDOW);
        assert_eq!(window.time_remaining_ms(15_000, WINDOW), 45_000);
        assert_eq!(window.time_remaining_ms(120_000, WINDOW), 0);
    }

    #[test]
    fn test_backwards_clock_reads_as_fresh() {
        let window = RateWindow::start(10_000);
        assert_eq!(window.age_ms(5_000), 0);
        assert!(!window.is_expired(5_000, WINDOW));
    }

    #[test]
    fn test_stale_after_grace() {
        let window = RateWindow::start(0);
        assert!(window.is_expired(WINDOW as i64 + 1, WINDOW));
        assert!(!window.is_stale(WINDOW as i64 + 1, WINDOW));
        assert!(window.is_stale(2 * WINDOW as i64 + 1, WINDOW));
    }

    #[test]
    fn test_meta_decode() {
        let window = RateWindow::start(42);
        let raw = window.meta().encode();
        let meta = WindowMeta::decode("k", &raw).unwrap();
        assert_eq!(RateWindow::from_parts(1, meta), window);
    }

    #[test]
    fn test_meta_decode_corrupt() {
        assert!(matches!(
            WindowMeta::decode("k", "not json"),
            Err(RateCacheError::CorruptEntry { .. })
        ));
        let backwards = r#"{"window_start":100,"first_attempt":50,"last_attempt":100}"#;
        assert!(WindowMeta::decode("k", backwards).is_err());
    }

    #[test]
    fn test_decode_count() {
        assert_eq!(decode_count("k", "7").unwrap(), 7);
        assert_eq!(decode_count("k", " 3\n").unwrap(), 3);
        assert!(decode_count("k", "0").is_err());
        assert!(decode_count("k", "-1").is_err());
        assert!(decode_count("k", "abc").is_err());
    }
}
