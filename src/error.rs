//! Error types for the rate limit cache.

use thiserror::Error;

/// Main error type for rate limit cache operations.
#[derive(Error, Debug)]
pub enum RateCacheError {
    /// Caller supplied an empty scope key or an unknown classification
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The shared tier could not be reached or rejected the command
    #[error("Shared tier unavailable: {0}")]
    SharedTierUnavailable(String),

    /// A shared tier call did not complete within the configured budget
    #[error("Shared tier timed out after {0}ms")]
    SharedTierTimeout(u64),

    /// A stored value could not be parsed into a rate window
    #[error("Corrupt entry for {key}: {reason}")]
    CorruptEntry { key: String, reason: String },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for RateCacheError {
    fn from(err: redis::RedisError) -> Self {
        RateCacheError::SharedTierUnavailable(err.to_string())
    }
}

/// Result type alias for rate limit cache operations.
pub type Result<T> = std::result::Result<T, RateCacheError>;
