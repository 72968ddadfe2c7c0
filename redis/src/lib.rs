//! # Idempotency Redis
//!
//! Production [`KeyValueStore`] backed by `Redis`.
//!
//! # Command mapping
//!
//! | Store operation   | Redis command        |
//! |-------------------|----------------------|
//! | `get`             | `GET`                |
//! | `set`             | `SET key value EX s` |
//! | `set_if_absent`   | `SET key value NX EX s` |
//! | `delete`          | `DEL`                |
//! | `list_append`     | `RPUSH`              |
//! | `list_range`      | `LRANGE`             |
//! | `expire`          | `EXPIRE`             |
//!
//! `SET NX EX` is a single atomic command, which is what makes the claim race
//! safe across processes.
//!
//! # Performance
//!
//! - **Connection pooling**: Uses `ConnectionManager`, which reconnects on failure
//! - **Single round-trip** per store operation
//!
//! # Example
//!
//! ```no_run
//! use idempotency_core::IdempotencyConfig;
//! use idempotency_redis::{RedisConfig, RedisStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisStore::connect(&RedisConfig::from_env()).await?;
//! let config = IdempotencyConfig::from_env();
//! # let _ = (store, config);
//! # Ok(())
//! # }
//! ```

use idempotency_core::store::ttl_seconds;
use idempotency_core::{KeyValueStore, StoreError, StoreResult};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use std::env;
use std::time::Duration;

/// Connection settings for [`RedisStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    /// Redis connection URL.
    ///
    /// Default: `redis://127.0.0.1:6379`
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

impl RedisConfig {
    /// Create a configuration for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Load configuration from `REDIS_URL`, falling back to the default.
    #[must_use]
    pub fn from_env() -> Self {
        env::var("REDIS_URL")
            .ok()
            .filter(|url| !url.is_empty())
            .map_or_else(Self::default, Self::new)
    }
}

/// Map a `Redis` error onto the store taxonomy.
///
/// Connection-level failures are [`StoreError::Unavailable`]; everything the
/// server itself rejected is [`StoreError::Backend`].
fn store_error(operation: &str, e: &RedisError) -> StoreError {
    let message = format!("{operation}: {e}");
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        StoreError::Unavailable(message)
    } else {
        StoreError::Backend(message)
    }
}

fn ttl_i64(ttl: Duration) -> i64 {
    i64::try_from(ttl_seconds(ttl)).unwrap_or(i64::MAX)
}

/// `Redis`-backed key-value store.
///
/// # Thread Safety
///
/// This type is `Clone` and can be safely shared across tasks.
/// Each clone shares the same `ConnectionManager`.
#[derive(Clone)]
pub struct RedisStore {
    conn_manager: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to `Redis`.
    ///
    /// # Connection URL Format
    ///
    /// - TCP: `redis://[:password@]host[:port][/database]`
    /// - TLS: `rediss://[:password@]host[:port][/database]`
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the URL is malformed or the
    /// server cannot be reached.
    pub async fn connect(config: &RedisConfig) -> StoreResult<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| StoreError::Unavailable(format!("Failed to create Redis client: {e}")))?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            StoreError::Unavailable(format!("Failed to create Redis connection manager: {e}"))
        })?;

        tracing::info!("RedisStore initialized successfully");

        Ok(Self { conn_manager })
    }
}

impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut conn = self.conn_manager.clone();
        conn.get(key).await.map_err(|e| store_error("GET", &e))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn_manager.clone();
        conn.set_ex(key, value, ttl_seconds(ttl))
            .await
            .map_err(|e| store_error("SET", &e))
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn_manager.clone();

        // Nil reply means the key already existed.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("SET NX", &e))?;

        let won = reply.is_some();
        tracing::trace!(key = key, won = won, "SET NX");
        Ok(won)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn_manager.clone();
        let deleted: i64 = conn.del(key).await.map_err(|e| store_error("DEL", &e))?;
        if deleted == 0 {
            tracing::trace!(key = key, "DEL: key not found");
        }
        Ok(())
    }

    async fn list_append(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        let mut conn = self.conn_manager.clone();
        let _len: i64 = conn
            .rpush(key, value)
            .await
            .map_err(|e| store_error("RPUSH", &e))?;
        Ok(())
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<Vec<u8>>> {
        let mut conn = self.conn_manager.clone();
        conn.lrange(key, start, stop)
            .await
            .map_err(|e| store_error("LRANGE", &e))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn_manager.clone();
        let _applied: bool = conn
            .expire(key, ttl_i64(ttl))
            .await
            .map_err(|e| store_error("EXPIRE", &e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default_points_at_localhost() {
        assert_eq!(RedisConfig::default().url, "redis://127.0.0.1:6379");
    }

    #[test]
    fn ttl_conversion_never_rounds_to_zero() {
        assert_eq!(ttl_i64(Duration::from_millis(10)), 1);
        assert_eq!(ttl_i64(Duration::from_secs(3_600)), 3_600);
    }

    #[test]
    fn server_errors_are_backend_errors() {
        let e = RedisError::from((redis::ErrorKind::TypeError, "WRONGTYPE"));
        assert!(matches!(store_error("GET", &e), StoreError::Backend(_)));
    }

    #[test]
    fn io_errors_are_unavailable() {
        let e = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(matches!(store_error("GET", &e), StoreError::Unavailable(_)));
    }
}
