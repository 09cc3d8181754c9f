//! Redis service shared by the queue backend.

use crate::{
    RedisConfig, Result,
    pool::{RedisConnection, RedisPool, connect_pool},
    pubsub::PubSub,
};

/// Redis service providing the connection pool and pub/sub client.
///
/// Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct RedisService {
    config: RedisConfig,
    pool: RedisPool,
}

impl RedisService {
    /// Create a new Redis service.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let pool = connect_pool(&config).await?;
        Ok(Self { config, pool })
    }

    /// Create from an existing pool.
    pub fn from_pool(config: RedisConfig, pool: RedisPool) -> Self {
        Self { config, pool }
    }

    /// Get the configuration.
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &RedisPool {
        &self.pool
    }

    /// Get a connection from the pool.
    pub async fn get(&self) -> Result<RedisConnection<'_>> {
        let conn = self.pool.get().await?;
        Ok(RedisConnection::new(conn))
    }

    /// Create a Pub/Sub client.
    pub fn pubsub(&self) -> Result<PubSub> {
        PubSub::new(&self.config)
    }

    /// Check if the connection is healthy.
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }

    /// Get pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        let state = self.pool.state();
        PoolStats {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }
}

/// Connection pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Total connections.
    pub connections: u32,
    /// Idle connections.
    pub idle_connections: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::AsyncCommands;

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_pool_and_pubsub_round_trip() {
        let config = RedisConfig::from_env().build();
        let redis = RedisService::new(config).await.unwrap();
        redis.health_check().await.unwrap();

        let mut subscription = redis.pubsub().unwrap().subscribe("backlog:test:ping").await.unwrap();

        let mut conn = redis.get().await.unwrap();
        let _: u32 = conn.publish("backlog:test:ping", "hello").await.unwrap();

        let message = subscription.recv().await.unwrap();
        assert_eq!(message.channel, "backlog:test:ping");
        assert_eq!(message.payload, "hello");
    }
}
