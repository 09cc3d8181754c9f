//! Storage backends.
//!
//! Every structure the coordinator owns lives behind [`QueueBackend`]: payload
//! lists, the ready-time index (a sorted set), the deferred ring and the
//! readiness channels. [`RedisBackend`] is the production implementation;
//! [`MemoryBackend`] keeps the same semantics inside one process.

mod memory_backend;
mod redis_backend;

pub use memory_backend::MemoryBackend;
pub use redis_backend::RedisBackend;

use crate::error::QueueResult;
use async_trait::async_trait;
use backlog_redis::Subscription;

/// One end of a score range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreBound {
    /// Scores equal to the value are in range.
    Inclusive(f64),
    /// Scores equal to the value are out of range.
    Exclusive(f64),
    /// No limit on this side.
    Unbounded,
}

impl ScoreBound {
    /// Redis `ZRANGEBYSCORE` argument for this bound.
    fn to_arg(self, infinity: &str) -> String {
        match self {
            Self::Inclusive(value) => value.to_string(),
            Self::Exclusive(value) => format!("({}", value),
            Self::Unbounded => infinity.to_string(),
        }
    }
}

/// A range of scores in the ready-time index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreRange {
    /// Lower bound
    pub min: ScoreBound,
    /// Upper bound
    pub max: ScoreBound,
}

impl ScoreRange {
    /// Create a range.
    pub fn new(min: ScoreBound, max: ScoreBound) -> Self {
        Self { min, max }
    }

    /// Every score.
    pub fn all() -> Self {
        Self::new(ScoreBound::Unbounded, ScoreBound::Unbounded)
    }

    /// Scores up to and including `max`.
    pub fn up_to(max: f64) -> Self {
        Self::new(ScoreBound::Unbounded, ScoreBound::Inclusive(max))
    }

    /// Scores from `min` (inclusive) to `max` (exclusive).
    pub fn half_open(min: f64, max: f64) -> Self {
        Self::new(ScoreBound::Inclusive(min), ScoreBound::Exclusive(max))
    }

    /// Whether `score` falls in the range.
    pub fn contains(&self, score: f64) -> bool {
        let above = match self.min {
            ScoreBound::Inclusive(min) => score >= min,
            ScoreBound::Exclusive(min) => score > min,
            ScoreBound::Unbounded => true,
        };
        let below = match self.max {
            ScoreBound::Inclusive(max) => score <= max,
            ScoreBound::Exclusive(max) => score < max,
            ScoreBound::Unbounded => true,
        };
        above && below
    }

    /// `min` argument for `ZRANGEBYSCORE`.
    pub fn min_arg(&self) -> String {
        self.min.to_arg("-inf")
    }

    /// `max` argument for `ZRANGEBYSCORE`.
    pub fn max_arg(&self) -> String {
        self.max.to_arg("+inf")
    }
}

/// Storage operations used by the coordinator.
///
/// Names are full backend keys; the coordinator owns the naming scheme.
#[async_trait]
pub trait QueueBackend: Send + Sync + 'static {
    // Payload lists

    /// Append items to the tail of a list. Returns the new length.
    async fn append(&self, list: &str, items: &[Vec<u8>]) -> QueueResult<usize>;

    /// Remove and return the head of a list.
    async fn pop_front(&self, list: &str) -> QueueResult<Option<Vec<u8>>>;

    /// Number of items in a list.
    async fn list_len(&self, list: &str) -> QueueResult<usize>;

    /// Delete a key of any kind. Returns whether it existed.
    async fn delete(&self, key: &str) -> QueueResult<bool>;

    // Ready-time index

    /// Insert or update a member's score.
    async fn set_score(&self, index: &str, member: &str, score: f64) -> QueueResult<()>;

    /// Remove a member. Returns whether it was present.
    async fn remove_member(&self, index: &str, member: &str) -> QueueResult<bool>;

    /// A member's score.
    async fn score(&self, index: &str, member: &str) -> QueueResult<Option<f64>>;

    /// The lowest-scored member in range; ties go to the lexicographically
    /// smallest member.
    async fn first_in_range(
        &self,
        index: &str,
        range: &ScoreRange,
    ) -> QueueResult<Option<(String, f64)>>;

    /// Number of members.
    async fn index_len(&self, index: &str) -> QueueResult<usize>;

    /// Start an optimistic transaction on an index.
    async fn begin_claim<'a>(&'a self, index: &'a str)
    -> QueueResult<Box<dyn ClaimTransaction + 'a>>;

    // Deferred ring

    /// Push a member onto the head of a ring.
    async fn ring_push(&self, ring: &str, member: &str) -> QueueResult<()>;

    /// Move the tail member to the head and return it.
    async fn ring_rotate(&self, ring: &str) -> QueueResult<Option<String>>;

    /// Remove the first occurrence of a member. Returns whether one was found.
    async fn ring_remove(&self, ring: &str, member: &str) -> QueueResult<bool>;

    /// Number of members.
    async fn ring_len(&self, ring: &str) -> QueueResult<usize>;

    // Readiness channels

    /// Publish a message. Returns the number of subscribers reached.
    async fn publish(&self, channel: &str, message: &str) -> QueueResult<usize>;

    /// Subscribe to a channel.
    async fn subscribe(&self, channel: &str) -> QueueResult<Subscription>;
}

/// A compare-and-swap fence over one index.
///
/// Reads happen inside the fence; [`commit`](Self::commit) writes only if
/// nothing modified the index since the fence was taken.
#[async_trait]
pub trait ClaimTransaction: Send {
    /// The lowest-scored member in range.
    async fn first_in_range(&mut self, range: &ScoreRange) -> QueueResult<Option<(String, f64)>>;

    /// Set `member`'s score. `false` means the index changed and nothing was written.
    async fn commit(&mut self, member: &str, score: f64) -> QueueResult<bool>;

    /// Release the fence without writing.
    async fn abandon(&mut self) -> QueueResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_arguments() {
        let range = ScoreRange::half_open(915.0, 603_585.5);
        assert_eq!(range.min_arg(), "915");
        assert_eq!(range.max_arg(), "(603585.5");

        let range = ScoreRange::up_to(16.0);
        assert_eq!(range.min_arg(), "-inf");
        assert_eq!(range.max_arg(), "16");

        assert_eq!(ScoreRange::all().max_arg(), "+inf");
    }

    #[test]
    fn test_range_contains() {
        let range = ScoreRange::half_open(10.0, 20.0);
        assert!(range.contains(10.0));
        assert!(range.contains(19.999));
        assert!(!range.contains(20.0));
        assert!(!range.contains(9.0));

        let ready = ScoreRange::up_to(15.0);
        assert!(ready.contains(-1.0));
        assert!(ready.contains(15.0));
        assert!(!ready.contains(15.5));

        let open = ScoreRange::new(ScoreBound::Exclusive(1.0), ScoreBound::Unbounded);
        assert!(!open.contains(1.0));
        assert!(open.contains(1e12));
    }
}
