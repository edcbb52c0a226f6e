//! Ratecache - two-tier rate limit counter store
//!
//! This crate keeps per-scope attempt counters in an in-process tier and
//! mirrors them into a shared TTL key-value store (such as Redis) so that
//! several processes enforce the same limits. When the shared tier is
//! unreachable, enforcement degrades to the local tier instead of failing
//! open or closed.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod shared;
pub mod telemetry;

pub use config::{RateCacheConfig, StoreConfig};
pub use error::{RateCacheError, Result};
pub use ratelimit::{Classification, LimitStatus, RateCounterStore, RecordOutcome, Statistics};
pub use shared::SharedTier;
