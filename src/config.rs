//! Configuration management for the rate limit cache.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RateCacheError, Result};

/// Prefix for environment variable overrides, e.g. `RATECACHE__STORE__LIMIT_BY_ORIGIN=20`.
pub const ENV_PREFIX: &str = "RATECACHE";

/// Main configuration for the rate limit cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateCacheConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Shared tier connection configuration
    #[serde(default)]
    pub shared_tier: SharedTierConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Counter store configuration.
///
/// Immutable for the lifetime of a store once it has been constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Max attempts per window for by-credential scopes (e.g. per email)
    #[serde(default = "default_limit_by_credential")]
    pub limit_by_credential: u64,

    /// Max attempts per window for by-origin scopes (e.g. per network address)
    #[serde(default = "default_limit_by_origin")]
    pub limit_by_origin: u64,

    /// Length of the limiting window in milliseconds
    #[serde(default = "default_window_duration_ms")]
    pub window_duration_ms: u64,

    /// Mirror counters into the shared tier
    #[serde(default)]
    pub use_shared_tier: bool,

    /// How often the background sweep runs, in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Upper bound on any single shared tier call, in milliseconds
    #[serde(default = "default_shared_tier_timeout_ms")]
    pub shared_tier_timeout_ms: u64,

    /// Namespace prepended to every shared tier key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Maximum number of windows held in the local tier
    #[serde(default = "default_max_local_entries")]
    pub max_local_entries: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            limit_by_credential: default_limit_by_credential(),
            limit_by_origin: default_limit_by_origin(),
            window_duration_ms: default_window_duration_ms(),
            use_shared_tier: false,
            sweep_interval_ms: default_sweep_interval_ms(),
            shared_tier_timeout_ms: default_shared_tier_timeout_ms(),
            key_prefix: default_key_prefix(),
            max_local_entries: default_max_local_entries(),
        }
    }
}

fn default_limit_by_credential() -> u64 {
    5
}

fn default_limit_by_origin() -> u64 {
    10
}

fn default_window_duration_ms() -> u64 {
    15 * 60 * 1000
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_shared_tier_timeout_ms() -> u64 {
    250
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

fn default_max_local_entries() -> usize {
    100_000
}

impl StoreConfig {
    /// The limiting window as a `Duration`.
    pub fn window_duration(&self) -> Duration {
        Duration::from_millis(self.window_duration_ms)
    }

    /// The sweep period as a `Duration`.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// The per-call shared tier budget as a `Duration`.
    pub fn shared_tier_timeout(&self) -> Duration {
        Duration::from_millis(self.shared_tier_timeout_ms)
    }

    /// TTL applied to shared tier keys: the window rounded up to whole seconds.
    pub fn shared_ttl_secs(&self) -> u64 {
        self.window_duration_ms.div_ceil(1000).max(1)
    }

    /// Reject configurations the store cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.limit_by_credential == 0 || self.limit_by_origin == 0 {
            return Err(RateCacheError::Config(
                "limits must be at least 1".to_string(),
            ));
        }
        if self.window_duration_ms == 0 {
            return Err(RateCacheError::Config(
                "window_duration_ms must be at least 1".to_string(),
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(RateCacheError::Config(
                "sweep_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.shared_tier_timeout_ms == 0 {
            return Err(RateCacheError::Config(
                "shared_tier_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.max_local_entries == 0 {
            return Err(RateCacheError::Config(
                "max_local_entries must be at least 1".to_string(),
            ));
        }
        if self.key_prefix.is_empty() {
            return Err(RateCacheError::Config(
                "key_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Shared tier connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SharedTierConfig {
    /// Redis connection URL, e.g. `redis://127.0.0.1:6379/0`
    #[serde(default)]
    pub url: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RateCacheConfig {
    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RateCacheConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RateCacheError::Config(format!("Failed to parse config: {}", e)))?;
        config.store.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from an optional file layered with
    /// `RATECACHE__`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: RateCacheConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| RateCacheError::Config(e.to_string()))?;
        config.store.validate()?;
        Ok(config)
    }
}
