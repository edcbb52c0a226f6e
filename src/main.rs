use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use ratecache::config::RateCacheConfig;
use ratecache::ratelimit::{Classification, RateCounterStore};
use ratecache::shared::SharedTier;
use ratecache::telemetry;

/// Inspect and administer rate limit counters.
#[derive(Debug, Parser)]
#[command(name = "ratecache", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Redis URL for the shared tier (overrides the configuration file)
    #[arg(long, global = true)]
    redis_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Report whether a scope has exceeded its limit
    Check {
        /// credential|email or origin|ip
        classification: Classification,
        key: String,
    },
    /// Record attempts for a scope
    Record {
        classification: Classification,
        key: String,
        /// Number of attempts to record
        #[arg(long, default_value_t = 1)]
        times: u32,
    },
    /// Clear a scope's window in every tier
    Reset {
        classification: Classification,
        key: String,
    },
    /// Print store statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = RateCacheConfig::load(cli.config.as_deref())?;
    telemetry::init_tracing(&config.logging)?;

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    if let Some(url) = cli.redis_url {
        config.shared_tier.url = Some(url);
    }

    let shared = connect_shared_tier(&config).await;
    config.store.use_shared_tier = shared.is_some();

    let store = RateCounterStore::new(config.store.clone(), shared)?;

    match cli.command {
        Command::Check {
            classification,
            key,
        } => print_json(&store.check_limit(&key, classification).await?)?,
        Command::Record {
            classification,
            key,
            times,
        } => {
            let mut outcomes = Vec::with_capacity(times as usize);
            for _ in 0..times {
                outcomes.push(store.record_attempt(&key, classification).await?);
            }
            print_json(&outcomes)?
        }
        Command::Reset {
            classification,
            key,
        } => print_json(&store.reset_limit(&key, classification).await?)?,
        Command::Stats => print_json(&store.get_statistics().await)?,
    }

    store.shutdown();
    Ok(())
}

/// Connect to the configured shared tier, falling back to single-process mode.
#[cfg(feature = "redis")]
async fn connect_shared_tier(config: &RateCacheConfig) -> Option<Arc<dyn SharedTier>> {
    let url = config.shared_tier.url.as_deref()?;

    match ratecache::shared::RedisSharedTier::connect(url).await {
        Ok(tier) => {
            let tier: Arc<dyn SharedTier> = Arc::new(tier);
            Some(tier)
        }
        Err(e) => {
            warn!(error = %e, "Shared tier unavailable, running in single-process mode");
            None
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn connect_shared_tier(config: &RateCacheConfig) -> Option<Arc<dyn SharedTier>> {
    if config.shared_tier.url.is_some() {
        warn!("Built without the redis feature, running in single-process mode");
    }
    None
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
