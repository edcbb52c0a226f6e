//! Rate limiting logic and state management.

mod scope;
mod store;
mod sweep;
mod window;

pub use scope::{Classification, ScopeKey};
pub use store::{LimitStatus, RateCounterStore, RecordOutcome, Statistics};
pub use window::{now_ms, RateWindow, WindowMeta, SWEEP_GRACE_MULTIPLIER};
