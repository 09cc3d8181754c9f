//! Redis connection pool.
//!
//! Claims run `WATCH`/`MULTI`/`EXEC` on a checked-out connection. A claim that
//! is dropped part-way (its task aborted, or an error before `EXEC`) returns
//! the connection still watching the index, so every checkout starts with
//! `UNWATCH`.

use bb8::{ManageConnection, Pool, PooledConnection};
use bb8_redis::RedisConnectionManager;
use redis::aio::MultiplexedConnection;
use std::ops::{Deref, DerefMut};
use tracing::info;

use crate::{RedisConfig, RedisError, Result};

/// Type alias for the connection pool.
pub type RedisPool = Pool<WatchResetManager>;

/// Connection manager that clears `WATCH` state when a connection is checked out.
///
/// The `UNWATCH` also serves as the checkout health check.
pub struct WatchResetManager {
    inner: RedisConnectionManager,
}

impl WatchResetManager {
    /// Create a manager for the given connection URL.
    pub fn new(url: &str) -> Result<Self> {
        let inner =
            RedisConnectionManager::new(url).map_err(|e| RedisError::Connection(e.to_string()))?;
        Ok(Self { inner })
    }
}

impl ManageConnection for WatchResetManager {
    type Connection = MultiplexedConnection;
    type Error = redis::RedisError;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        self.inner.connect().await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        let _: () = redis::cmd("UNWATCH").query_async(conn).await?;
        Ok(())
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        self.inner.has_broken(conn)
    }
}

/// A pooled Redis connection.
///
/// Exclusive to the holder until dropped.
pub struct RedisConnection<'a> {
    conn: PooledConnection<'a, WatchResetManager>,
}

impl<'a> RedisConnection<'a> {
    /// Wrap a pooled connection.
    pub fn new(conn: PooledConnection<'a, WatchResetManager>) -> Self {
        Self { conn }
    }
}

impl Deref for RedisConnection<'_> {
    type Target = MultiplexedConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for RedisConnection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

/// Open a pool for `config` and make sure the server answers.
pub async fn connect_pool(config: &RedisConfig) -> Result<RedisPool> {
    let manager = WatchResetManager::new(&config.connection_url())?;

    let pool = Pool::builder()
        .max_size(config.pool_size.max(1))
        .min_idle(config.min_idle)
        .connection_timeout(config.connection_timeout)
        .test_on_check_out(true)
        .build(manager)
        .await
        .map_err(|e| RedisError::Pool(e.to_string()))?;

    {
        let mut conn = pool.get().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| RedisError::Connection(e.to_string()))?;
    }
    info!(
        pool_size = config.pool_size,
        url = %config.url,
        "Redis connection pool created"
    );

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_rejects_bad_url() {
        assert!(matches!(
            WatchResetManager::new("not a url"),
            Err(RedisError::Connection(_))
        ));
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_checkout_clears_abandoned_watch() {
        let config = RedisConfig::from_env().pool_size(1).build();
        let pool = connect_pool(&config).await.unwrap();
        let key = format!("backlog:test:watch:{}", std::process::id());

        // Leave a WATCH behind, as a claim dropped before EXEC would.
        {
            let mut conn = pool.get().await.unwrap();
            let _: () = redis::cmd("WATCH").arg(&key).query_async(&mut *conn).await.unwrap();
        }

        let mut conn = pool.get().await.unwrap();
        let _: () = redis::cmd("SET").arg(&key).arg("changed").query_async(&mut *conn).await.unwrap();
        let committed: Option<(String,)> = redis::pipe()
            .atomic()
            .set(&key, "claimed")
            .query_async(&mut *conn)
            .await
            .unwrap();
        assert!(committed.is_some());

        let _: () = redis::cmd("DEL").arg(&key).query_async(&mut *conn).await.unwrap();
    }
}
