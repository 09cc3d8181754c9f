//! Redis backend.

use super::{ClaimTransaction, QueueBackend, ScoreRange};
use crate::error::QueueResult;
use async_trait::async_trait;
use backlog_redis::{PubSub, RedisConfig, RedisConnection, RedisService, Subscription};
use redis::AsyncCommands;
use redis::aio::ConnectionLike;

/// Backend storing lists, indexes and rings in Redis.
///
/// Lists are Redis lists, the ready-time index is a sorted set, the deferred
/// ring is a list rotated with `RPOPLPUSH`, and readiness channels are Redis
/// pub/sub channels.
#[derive(Clone)]
pub struct RedisBackend {
    service: RedisService,
    pubsub: PubSub,
}

impl RedisBackend {
    /// Connect using `config`.
    pub async fn connect(config: &RedisConfig) -> QueueResult<Self> {
        let service = RedisService::new(config.clone()).await?;
        Self::new(service)
    }

    /// Wrap an existing service.
    pub fn new(service: RedisService) -> QueueResult<Self> {
        let pubsub = service.pubsub()?;
        Ok(Self { service, pubsub })
    }

    /// The underlying service.
    pub fn service(&self) -> &RedisService {
        &self.service
    }

    async fn conn(&self) -> QueueResult<RedisConnection<'_>> {
        Ok(self.service.get().await?)
    }
}

async fn first_in_range<C: ConnectionLike + Send>(
    conn: &mut C,
    index: &str,
    range: &ScoreRange,
) -> QueueResult<Option<(String, f64)>> {
    let found: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
        .arg(index)
        .arg(range.min_arg())
        .arg(range.max_arg())
        .arg("WITHSCORES")
        .arg("LIMIT")
        .arg(0)
        .arg(1)
        .query_async(conn)
        .await?;
    Ok(found.into_iter().next())
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn append(&self, list: &str, items: &[Vec<u8>]) -> QueueResult<usize> {
        let mut conn = self.conn().await?;
        if items.is_empty() {
            return Ok(conn.llen(list).await?);
        }
        Ok(conn.rpush(list, items).await?)
    }

    async fn pop_front(&self, list: &str) -> QueueResult<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        Ok(conn.lpop(list, None).await?)
    }

    async fn list_len(&self, list: &str) -> QueueResult<usize> {
        let mut conn = self.conn().await?;
        Ok(conn.llen(list).await?)
    }

    async fn delete(&self, key: &str) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let deleted: usize = conn.del(key).await?;
        Ok(deleted > 0)
    }

    async fn set_score(&self, index: &str, member: &str, score: f64) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let _: usize = conn.zadd(index, member, score).await?;
        Ok(())
    }

    async fn remove_member(&self, index: &str, member: &str) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let removed: usize = conn.zrem(index, member).await?;
        Ok(removed > 0)
    }

    async fn score(&self, index: &str, member: &str) -> QueueResult<Option<f64>> {
        let mut conn = self.conn().await?;
        Ok(conn.zscore(index, member).await?)
    }

    async fn first_in_range(
        &self,
        index: &str,
        range: &ScoreRange,
    ) -> QueueResult<Option<(String, f64)>> {
        let mut conn = self.conn().await?;
        first_in_range(&mut *conn, index, range).await
    }

    async fn index_len(&self, index: &str) -> QueueResult<usize> {
        let mut conn = self.conn().await?;
        Ok(conn.zcard(index).await?)
    }

    async fn begin_claim<'a>(
        &'a self,
        index: &'a str,
    ) -> QueueResult<Box<dyn ClaimTransaction + 'a>> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("WATCH").arg(index).query_async(&mut *conn).await?;
        Ok(Box::new(RedisClaim {
            conn,
            index,
            watching: true,
        }))
    }

    async fn ring_push(&self, ring: &str, member: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let _: usize = conn.lpush(ring, member).await?;
        Ok(())
    }

    async fn ring_rotate(&self, ring: &str) -> QueueResult<Option<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.rpoplpush(ring, ring).await?)
    }

    async fn ring_remove(&self, ring: &str, member: &str) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let removed: usize = conn.lrem(ring, 1, member).await?;
        Ok(removed > 0)
    }

    async fn ring_len(&self, ring: &str) -> QueueResult<usize> {
        let mut conn = self.conn().await?;
        Ok(conn.llen(ring).await?)
    }

    async fn publish(&self, channel: &str, message: &str) -> QueueResult<usize> {
        let mut conn = self.conn().await?;
        Ok(conn.publish(channel, message).await?)
    }

    async fn subscribe(&self, channel: &str) -> QueueResult<Subscription> {
        Ok(self.pubsub.subscribe(channel).await?)
    }
}

/// `WATCH`-based claim on a pooled connection held for the whole attempt.
///
/// If the transaction is dropped while still watching, the pool clears the
/// `WATCH` before the connection is handed out again.
struct RedisClaim<'a> {
    conn: RedisConnection<'a>,
    index: &'a str,
    watching: bool,
}

#[async_trait]
impl ClaimTransaction for RedisClaim<'_> {
    async fn first_in_range(&mut self, range: &ScoreRange) -> QueueResult<Option<(String, f64)>> {
        first_in_range(&mut *self.conn, self.index, range).await
    }

    async fn commit(&mut self, member: &str, score: f64) -> QueueResult<bool> {
        // EXEC answers nil when a watched key changed.
        let result: Option<(usize,)> = redis::pipe()
            .atomic()
            .zadd(self.index, member, score)
            .query_async(&mut *self.conn)
            .await?;
        self.watching = false;
        Ok(result.is_some())
    }

    async fn abandon(&mut self) -> QueueResult<()> {
        if self.watching {
            let _: () = redis::cmd("UNWATCH").query_async(&mut *self.conn).await?;
            self.watching = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend() -> RedisBackend {
        RedisBackend::connect(&RedisConfig::from_env().build())
            .await
            .unwrap()
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_claim_fence_detects_concurrent_write() {
        let backend = backend().await;
        let index = format!("backlog:test:{}:ready", uuid::Uuid::new_v4());
        backend.set_score(&index, "k", 0.0).await.unwrap();

        let mut claim = backend.begin_claim(&index).await.unwrap();
        let found = claim.first_in_range(&ScoreRange::up_to(1.0)).await.unwrap();
        assert_eq!(found, Some(("k".to_string(), 0.0)));

        backend.set_score(&index, "other", 5.0).await.unwrap();
        assert!(!claim.commit("k", 100.0).await.unwrap());
        drop(claim);

        let mut claim = backend.begin_claim(&index).await.unwrap();
        assert!(claim.commit("k", 100.0).await.unwrap());
        drop(claim);
        assert_eq!(backend.score(&index, "k").await.unwrap(), Some(100.0));

        backend.delete(&index).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_ring_and_lists() {
        let backend = backend().await;
        let ring = format!("backlog:test:{}:deferred", uuid::Uuid::new_v4());
        backend.ring_push(&ring, "a").await.unwrap();
        backend.ring_push(&ring, "b").await.unwrap();
        assert_eq!(backend.ring_rotate(&ring).await.unwrap(), Some("a".to_string()));
        assert!(backend.ring_remove(&ring, "a").await.unwrap());
        assert_eq!(backend.ring_len(&ring).await.unwrap(), 1);
        backend.delete(&ring).await.unwrap();

        let list = format!("backlog:test:{}:list", uuid::Uuid::new_v4());
        assert_eq!(backend.append(&list, &[b"x".to_vec(), b"y".to_vec()]).await.unwrap(), 2);
        assert_eq!(backend.pop_front(&list).await.unwrap(), Some(b"x".to_vec()));
        assert!(backend.delete(&list).await.unwrap());
    }
}
