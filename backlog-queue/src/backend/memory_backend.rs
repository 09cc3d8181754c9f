//! In-process backend.

use super::{ClaimTransaction, QueueBackend, ScoreRange};
use crate::error::QueueResult;
use async_trait::async_trait;
use backlog_redis::{Message, Subscription};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Default)]
struct Index {
    members: HashMap<String, f64>,
    /// Bumped on every change; the claim fence compares it.
    version: u64,
}

impl Index {
    fn first_in_range(&self, range: &ScoreRange) -> Option<(String, f64)> {
        self.members
            .iter()
            .filter(|(_, score)| range.contains(**score))
            .min_by(|(a, sa), (b, sb)| sa.total_cmp(sb).then_with(|| a.cmp(b)))
            .map(|(member, score)| (member.clone(), *score))
    }
}

#[derive(Default)]
struct State {
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    indexes: HashMap<String, Index>,
    rings: HashMap<String, VecDeque<String>>,
    subscribers: HashMap<String, Vec<mpsc::Sender<Message>>>,
}

/// Backend holding everything in process memory.
///
/// Clones share the same data, so several stores built on clones behave like
/// several processes sharing one Redis.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn index_version(&self, index: &str) -> u64 {
        self.state
            .lock()
            .indexes
            .get(index)
            .map(|i| i.version)
            .unwrap_or(0)
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn append(&self, list: &str, items: &[Vec<u8>]) -> QueueResult<usize> {
        let mut state = self.state.lock();
        if items.is_empty() {
            return Ok(state.lists.get(list).map_or(0, VecDeque::len));
        }
        let entries = state.lists.entry(list.to_string()).or_default();
        entries.extend(items.iter().cloned());
        Ok(entries.len())
    }

    async fn pop_front(&self, list: &str) -> QueueResult<Option<Vec<u8>>> {
        let mut state = self.state.lock();
        let Some(entries) = state.lists.get_mut(list) else {
            return Ok(None);
        };
        let item = entries.pop_front();
        if entries.is_empty() {
            state.lists.remove(list);
        }
        Ok(item)
    }

    async fn list_len(&self, list: &str) -> QueueResult<usize> {
        Ok(self.state.lock().lists.get(list).map_or(0, VecDeque::len))
    }

    async fn delete(&self, key: &str) -> QueueResult<bool> {
        let mut state = self.state.lock();
        let list = state.lists.remove(key).is_some();
        let index = state.indexes.remove(key).is_some();
        let ring = state.rings.remove(key).is_some();
        Ok(list || index || ring)
    }

    async fn set_score(&self, index: &str, member: &str, score: f64) -> QueueResult<()> {
        let mut state = self.state.lock();
        let index = state.indexes.entry(index.to_string()).or_default();
        if index.members.insert(member.to_string(), score) != Some(score) {
            index.version += 1;
        }
        Ok(())
    }

    async fn remove_member(&self, index: &str, member: &str) -> QueueResult<bool> {
        let mut state = self.state.lock();
        let Some(entry) = state.indexes.get_mut(index) else {
            return Ok(false);
        };
        let removed = entry.members.remove(member).is_some();
        if removed {
            entry.version += 1;
        }
        Ok(removed)
    }

    async fn score(&self, index: &str, member: &str) -> QueueResult<Option<f64>> {
        Ok(self
            .state
            .lock()
            .indexes
            .get(index)
            .and_then(|i| i.members.get(member).copied()))
    }

    async fn first_in_range(
        &self,
        index: &str,
        range: &ScoreRange,
    ) -> QueueResult<Option<(String, f64)>> {
        Ok(self
            .state
            .lock()
            .indexes
            .get(index)
            .and_then(|i| i.first_in_range(range)))
    }

    async fn index_len(&self, index: &str) -> QueueResult<usize> {
        Ok(self
            .state
            .lock()
            .indexes
            .get(index)
            .map_or(0, |i| i.members.len()))
    }

    async fn begin_claim<'a>(
        &'a self,
        index: &'a str,
    ) -> QueueResult<Box<dyn ClaimTransaction + 'a>> {
        Ok(Box::new(MemoryClaim {
            backend: self,
            index,
            version: self.index_version(index),
        }))
    }

    async fn ring_push(&self, ring: &str, member: &str) -> QueueResult<()> {
        self.state
            .lock()
            .rings
            .entry(ring.to_string())
            .or_default()
            .push_front(member.to_string());
        Ok(())
    }

    async fn ring_rotate(&self, ring: &str) -> QueueResult<Option<String>> {
        let mut state = self.state.lock();
        let Some(entries) = state.rings.get_mut(ring) else {
            return Ok(None);
        };
        let Some(member) = entries.pop_back() else {
            return Ok(None);
        };
        entries.push_front(member.clone());
        Ok(Some(member))
    }

    async fn ring_remove(&self, ring: &str, member: &str) -> QueueResult<bool> {
        let mut state = self.state.lock();
        let Some(entries) = state.rings.get_mut(ring) else {
            return Ok(false);
        };
        let Some(position) = entries.iter().position(|m| m == member) else {
            return Ok(false);
        };
        entries.remove(position);
        if entries.is_empty() {
            state.rings.remove(ring);
        }
        Ok(true)
    }

    async fn ring_len(&self, ring: &str) -> QueueResult<usize> {
        Ok(self.state.lock().rings.get(ring).map_or(0, VecDeque::len))
    }

    async fn publish(&self, channel: &str, message: &str) -> QueueResult<usize> {
        let mut state = self.state.lock();
        let Some(senders) = state.subscribers.get_mut(channel) else {
            return Ok(0);
        };
        senders.retain(|tx| !tx.is_closed());

        let mut delivered = 0;
        for tx in senders.iter() {
            // A full buffer already holds a pending wake-up.
            if tx.try_send(Message::new(channel, message)).is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> QueueResult<Subscription> {
        let (tx, subscription) = Subscription::channel(channel);
        self.state
            .lock()
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(subscription)
    }
}

struct MemoryClaim<'a> {
    backend: &'a MemoryBackend,
    index: &'a str,
    version: u64,
}

#[async_trait]
impl ClaimTransaction for MemoryClaim<'_> {
    async fn first_in_range(&mut self, range: &ScoreRange) -> QueueResult<Option<(String, f64)>> {
        self.backend.first_in_range(self.index, range).await
    }

    async fn commit(&mut self, member: &str, score: f64) -> QueueResult<bool> {
        let mut state = self.backend.state.lock();
        let index = state.indexes.entry(self.index.to_string()).or_default();
        if index.version != self.version {
            return Ok(false);
        }
        if index.members.insert(member.to_string(), score) != Some(score) {
            index.version += 1;
        }
        Ok(true)
    }

    async fn abandon(&mut self) -> QueueResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScoreBound;

    #[tokio::test]
    async fn test_list_fifo() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.append("l", &[b"a".to_vec(), b"b".to_vec()]).await.unwrap(), 2);
        assert_eq!(backend.append("l", &[b"c".to_vec()]).await.unwrap(), 3);
        assert_eq!(backend.append("l", &[]).await.unwrap(), 3);

        assert_eq!(backend.pop_front("l").await.unwrap(), Some(b"a".to_vec()));
        assert_eq!(backend.list_len("l").await.unwrap(), 2);
        assert!(backend.delete("l").await.unwrap());
        assert!(!backend.delete("l").await.unwrap());
        assert_eq!(backend.pop_front("l").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_first_in_range_orders_by_score_then_member() {
        let backend = MemoryBackend::new();
        backend.set_score("i", "b", 5.0).await.unwrap();
        backend.set_score("i", "a", 5.0).await.unwrap();
        backend.set_score("i", "c", 1.0).await.unwrap();
        backend.set_score("i", "d", 100.0).await.unwrap();

        let first = backend.first_in_range("i", &ScoreRange::all()).await.unwrap();
        assert_eq!(first, Some(("c".to_string(), 1.0)));

        let range = ScoreRange::new(ScoreBound::Exclusive(1.0), ScoreBound::Inclusive(50.0));
        let first = backend.first_in_range("i", &range).await.unwrap();
        assert_eq!(first, Some(("a".to_string(), 5.0)));
    }

    #[tokio::test]
    async fn test_claim_conflict_detected() {
        let backend = MemoryBackend::new();
        backend.set_score("i", "k", 0.0).await.unwrap();

        let mut first = backend.begin_claim("i").await.unwrap();
        let mut second = backend.begin_claim("i").await.unwrap();

        assert!(first.first_in_range(&ScoreRange::up_to(1.0)).await.unwrap().is_some());
        assert!(second.first_in_range(&ScoreRange::up_to(1.0)).await.unwrap().is_some());

        assert!(first.commit("k", 100.0).await.unwrap());
        assert!(!second.commit("k", 200.0).await.unwrap());
        assert_eq!(backend.score("i", "k").await.unwrap(), Some(100.0));
    }

    #[tokio::test]
    async fn test_unrelated_write_breaks_fence() {
        let backend = MemoryBackend::new();
        backend.set_score("i", "k", 0.0).await.unwrap();

        let mut claim = backend.begin_claim("i").await.unwrap();
        backend.set_score("i", "other", 3.0).await.unwrap();
        assert!(!claim.commit("k", 100.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_ring_rotation() {
        let backend = MemoryBackend::new();
        backend.ring_push("r", "a").await.unwrap();
        backend.ring_push("r", "b").await.unwrap();
        backend.ring_push("r", "c").await.unwrap();

        // Oldest push sits at the tail.
        assert_eq!(backend.ring_rotate("r").await.unwrap(), Some("a".to_string()));
        assert_eq!(backend.ring_rotate("r").await.unwrap(), Some("b".to_string()));
        assert_eq!(backend.ring_len("r").await.unwrap(), 3);

        assert!(backend.ring_remove("r", "b").await.unwrap());
        assert!(!backend.ring_remove("r", "b").await.unwrap());
        assert_eq!(backend.ring_len("r").await.unwrap(), 2);
        assert_eq!(backend.ring_rotate("empty").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_publish_reaches_live_subscribers() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.publish("ch", "x").await.unwrap(), 0);

        let mut one = backend.subscribe("ch").await.unwrap();
        let two = backend.subscribe("ch").await.unwrap();
        drop(two);

        assert_eq!(backend.publish("ch", "hello").await.unwrap(), 1);
        let message = one.recv().await.unwrap();
        assert_eq!(message.channel, "ch");
        assert_eq!(message.payload, "hello");
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let backend = MemoryBackend::new();
        let other = backend.clone();
        backend.set_score("i", "k", 1.0).await.unwrap();
        assert_eq!(other.index_len("i").await.unwrap(), 1);
    }
}
