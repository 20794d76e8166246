//! Redis connection pool management, plus the Redis-backed durable mirror
//! for the response cache's durable tier (§4.4: "memory... plus a durable
//! table"). Rate-limit state stays in-process (§1 non-goal: single process
//! with local durable storage) — Redis here backs the response cache only.

#[cfg(feature = "cache")]
use deadpool_redis::{Config as DeadpoolConfig, Pool, Runtime};
use std::time::Duration;

use crate::{config::RedisConfig, error::Result};

#[cfg(feature = "cache")]
use crate::response_cache::{CacheEntry, DurableCache};

#[cfg(feature = "cache")]
const KEY_PREFIX: &str = "mcpgw:cache:";

/// Create a Redis connection pool with retry logic
///
/// This is an internal function used by AppStateBuilder.
/// It will retry connection attempts based on the configuration.
#[cfg(feature = "cache")]
pub(crate) async fn create_pool(config: &RedisConfig) -> Result<Pool> {
    create_pool_with_retries(config, config.max_retries).await
}

/// Create a Redis connection pool with configurable retries
///
/// Uses exponential backoff strategy for retries
#[cfg(feature = "cache")]
async fn create_pool_with_retries(config: &RedisConfig, max_retries: u32) -> Result<Pool> {
    let mut attempt = 0;
    let base_delay = Duration::from_secs(config.retry_delay_secs);

    loop {
        match try_create_pool(config).await {
            Ok(pool) => {
                if attempt > 0 {
                    tracing::info!(
                        "Redis connection established after {} attempt(s)",
                        attempt + 1
                    );
                } else {
                    tracing::info!(
                        "Redis connection pool created: max_connections={}",
                        config.max_connections
                    );
                }
                return Ok(pool);
            }
            Err(e) => {
                attempt += 1;

                if attempt > max_retries {
                    tracing::error!(
                        "Failed to connect to Redis after {} attempts: {}",
                        max_retries + 1,
                        e
                    );
                    return Err(e);
                }

                // Calculate exponential backoff
                let delay_multiplier = 2_u32.pow(attempt.saturating_sub(1));
                let delay = base_delay * delay_multiplier;

                tracing::warn!(
                    "Redis connection attempt {} failed: {}. Retrying in {:?}...",
                    attempt,
                    e,
                    delay
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Attempt to create a Redis pool (single try)
#[cfg(feature = "cache")]
async fn try_create_pool(config: &RedisConfig) -> Result<Pool> {
    let cfg = DeadpoolConfig::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| crate::error::Error::Internal(format!("Failed to build Redis pool: {}", e)))?
        .max_size(config.max_connections)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| crate::error::Error::Internal(format!("Failed to create Redis pool: {}", e)))?;

    // Test the connection
    let conn = pool
        .get()
        .await
        .map_err(|e| crate::error::Error::Internal(format!("Failed to get Redis connection: {}", e)))?;
    drop(conn);

    Ok(pool)
}

/// [`DurableCache`] backed by a shared Redis instance, so the response
/// cache's durable tier survives process restarts and can be shared across
/// gateway instances pointed at the same Redis (still single-writer per
/// key within one process — §5 concurrency model is unaffected).
#[cfg(feature = "cache")]
pub struct RedisDurableCache {
    pool: Pool,
}

#[cfg(feature = "cache")]
impl RedisDurableCache {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    fn namespaced(key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }
}

#[cfg(feature = "cache")]
#[async_trait::async_trait]
impl DurableCache for RedisDurableCache {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        use deadpool_redis::redis::AsyncCommands;
        let mut conn = self.pool.get().await.ok()?;
        let raw: Option<String> = conn.get(Self::namespaced(key)).await.ok()?;
        raw.and_then(|s| serde_json::from_str(&s).ok())
    }

    async fn set(&self, key: &str, entry: CacheEntry) {
        use deadpool_redis::redis::AsyncCommands;
        let Ok(mut conn) = self.pool.get().await else {
            tracing::warn!("redis durable cache: no connection available for set");
            return;
        };
        let Ok(serialized) = serde_json::to_string(&entry) else { return };
        // TTL is derived from the entry's own expiry so Redis reclaims
        // space for entries the in-memory tier never re-touches.
        let ttl_secs = (entry.expires_at - chrono::Utc::now()).num_seconds().max(1) as u64;
        if let Err(e) = conn.set_ex::<_, _, ()>(Self::namespaced(key), serialized, ttl_secs).await {
            tracing::warn!("redis durable cache set failed: {e}");
        }
    }

    async fn invalidate_prefix(&self, prefix: &str) {
        use deadpool_redis::redis::AsyncCommands;
        let Ok(mut conn) = self.pool.get().await else { return };
        let pattern = format!("{}{}*", KEY_PREFIX, prefix);
        if let Ok(keys) = scan_matching(&mut conn, &pattern).await {
            if !keys.is_empty() {
                let _: Result<(), _> = conn.del(keys).await;
            }
        }
    }

    async fn invalidate_contains(&self, needle: &str) {
        use deadpool_redis::redis::AsyncCommands;
        let Ok(mut conn) = self.pool.get().await else { return };
        let pattern = format!("{KEY_PREFIX}*{needle}*");
        if let Ok(keys) = scan_matching(&mut conn, &pattern).await {
            if !keys.is_empty() {
                let _: Result<(), _> = conn.del(keys).await;
            }
        }
    }

    async fn invalidate_all(&self) {
        use deadpool_redis::redis::AsyncCommands;
        let Ok(mut conn) = self.pool.get().await else { return };
        let pattern = format!("{KEY_PREFIX}*");
        if let Ok(keys) = scan_matching(&mut conn, &pattern).await {
            if !keys.is_empty() {
                let _: Result<(), _> = conn.del(keys).await;
            }
        }
    }
}

/// `SCAN`-based key collection (never `KEYS *`, which blocks the server)
/// scoped to our namespace so the durable cache never touches keys other
/// gateway subsystems might share the same Redis instance with.
#[cfg(feature = "cache")]
async fn scan_matching(
    conn: &mut deadpool_redis::Connection,
    pattern: &str,
) -> std::result::Result<Vec<String>, deadpool_redis::redis::RedisError> {
    use deadpool_redis::redis::AsyncIter;
    use futures::StreamExt;
    let iter: AsyncIter<'_, String> = conn.scan_match(pattern).await?;
    Ok(iter.collect().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config() {
        let config = RedisConfig {
            url: "redis://localhost:6379".to_string(),
            max_connections: 20,
            connection_timeout_secs: 10,
            max_retries: 5,
            retry_delay_secs: 2,
            optional: false,
            lazy_init: true,
        };

        assert_eq!(config.max_connections, 20);
        assert_eq!(config.max_retries, 5);
        assert!(config.lazy_init);
    }
}
