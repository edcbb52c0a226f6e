//! Redis-backed shared tier.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tracing::{debug, info};

use super::SharedTier;
use crate::error::{RateCacheError, Result};

/// Shared tier on a Redis server, over one multiplexed tokio connection.
#[derive(Clone)]
pub struct RedisSharedTier {
    conn: MultiplexedConnection,
}

impl std::fmt::Debug for RedisSharedTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSharedTier").finish_non_exhaustive()
    }
}

impl RedisSharedTier {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        info!(url = %sanitize_url(url), "Connecting to Redis shared tier");

        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;

        info!("Redis shared tier connected");
        Ok(Self { conn })
    }
}

#[async_trait]
impl SharedTier for RedisSharedTier {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl_secs.max(1)).await?;
        Ok(())
    }

    async fn increment_and_get_ttl(&self, key: &str, ttl_secs: u64) -> Result<u64> {
        let mut conn = self.conn.clone();

        // MULTI/EXEC so the counter never exists without a TTL
        let reply: redis::RedisResult<(u64,)> = redis::pipe()
            .atomic()
            .incr(key, 1u64)
            .expire(key, ttl_secs.max(1) as i64)
            .ignore()
            .query_async(&mut conn)
            .await;
        let (value,) = reply.map_err(|e| increment_error(key, e))?;

        debug!(key = %key, value = value, "Incremented Redis counter");
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn batch_get(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        let reply: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        reply.is_ok()
    }
}

/// A value that INCR cannot parse is a corrupt entry, not an outage.
fn increment_error(key: &str, err: redis::RedisError) -> RateCacheError {
    match err.kind() {
        redis::ErrorKind::ResponseError | redis::ErrorKind::TypeError => {
            RateCacheError::CorruptEntry {
                key: key.to_string(),
                reason: err.to_string(),
            }
        }
        _ => RateCacheError::SharedTierUnavailable(err.to_string()),
    }
}

/// Hide any password in a Redis URL before logging it.
fn sanitize_url(url: &str) -> String {
    match url.split_once('@') {
        Some((credentials, host)) => match credentials.rsplit_once(':') {
            Some((scheme_user, _password)) => format!("{}:***@{}", scheme_user, host),
            None => format!("{}@{}", credentials, host),
        },
        None => url.to_string(),
    }
}
