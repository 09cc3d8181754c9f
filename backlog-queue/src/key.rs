//! Unit-of-work keys.
//!
//! A key names one list of payloads. Its string form,
//! `{item_type}:{stamp}:{generation}`, only appears at the backend boundary.

use crate::error::{QueueError, QueueResult};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Random per-process identifier; stamps from processes started in the same
/// microsecond still differ.
static NODE: LazyLock<String> =
    LazyLock::new(|| uuid::Uuid::new_v4().simple().to_string()[..8].to_string());

/// Structured unit-of-work key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ListKey {
    item_type: String,
    stamp: String,
    generation: u32,
}

impl ListKey {
    /// A fresh generation-0 key for `item_type`.
    ///
    /// ```
    /// use backlog_queue::ListKey;
    ///
    /// let key = ListKey::new("webhook").unwrap();
    /// assert_eq!(key.item_type(), "webhook");
    /// assert_eq!(key.generation(), 0);
    /// assert_eq!(key.next_generation().generation(), 1);
    /// ```
    pub fn new(item_type: &str) -> QueueResult<Self> {
        validate_item_type(item_type)?;
        Ok(Self {
            item_type: item_type.to_string(),
            stamp: new_stamp(Utc::now()),
            generation: 0,
        })
    }

    /// The logical queue partition.
    pub fn item_type(&self) -> &str {
        &self.item_type
    }

    /// Creation stamp shared by every generation.
    pub fn stamp(&self) -> &str {
        &self.stamp
    }

    /// Retry generation, 0 for new work.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// The key that carries this unit's leftovers forward.
    pub fn next_generation(&self) -> Self {
        Self {
            item_type: self.item_type.clone(),
            stamp: self.stamp.clone(),
            generation: self.generation.saturating_add(1),
        }
    }

    /// When the first generation was created, if the stamp is one of ours.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let mut parts = self.stamp.splitn(4, '.');
        let date = parts.next()?;
        let time = parts.next()?;
        let micros: u32 = parts.next()?.parse().ok()?;

        let naive =
            NaiveDateTime::parse_from_str(&format!("{}.{}", date, time), "%Y%m%d.%H%M%S").ok()?;
        let naive = naive.checked_add_signed(chrono::Duration::microseconds(micros as i64))?;
        Some(Utc.from_utc_datetime(&naive))
    }

    /// Time elapsed since creation; zero if the stamp is unreadable or in the future.
    pub fn age(&self) -> Duration {
        self.created_at()
            .and_then(|created| (Utc::now() - created).to_std().ok())
            .unwrap_or_default()
    }
}

impl fmt::Display for ListKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.item_type, self.stamp, self.generation)
    }
}

impl FromStr for ListKey {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let [item_type, stamp, generation] = parts.as_slice() else {
            return Err(QueueError::InvalidKey(s.to_string()));
        };

        validate_item_type(item_type).map_err(|_| QueueError::InvalidKey(s.to_string()))?;
        if stamp.is_empty() || stamp.chars().any(char::is_whitespace) {
            return Err(QueueError::InvalidKey(s.to_string()));
        }
        let generation = generation
            .parse()
            .map_err(|_| QueueError::InvalidKey(s.to_string()))?;

        Ok(Self {
            item_type: item_type.to_string(),
            stamp: stamp.to_string(),
            generation,
        })
    }
}

impl TryFrom<String> for ListKey {
    type Error = QueueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ListKey> for String {
    fn from(key: ListKey) -> Self {
        key.to_string()
    }
}

pub(crate) fn validate_item_type(item_type: &str) -> QueueResult<()> {
    if item_type.is_empty() || item_type.contains(':') || item_type.chars().any(char::is_whitespace)
    {
        return Err(QueueError::InvalidKey(format!(
            "item type '{}' must be non-empty without ':' or whitespace",
            item_type
        )));
    }
    Ok(())
}

fn new_stamp(now: DateTime<Utc>) -> String {
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{}.{}.{}", now.format("%Y%m%d.%H%M%S.%6f"), NODE.as_str(), seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_key_shape() {
        let key = ListKey::new("csv").unwrap();
        let text = key.to_string();
        assert!(text.starts_with("csv:"));
        assert!(text.ends_with(":0"));
        assert_eq!(text.split(':').count(), 3);
    }

    #[test]
    fn test_keys_are_unique() {
        let a = ListKey::new("webhook").unwrap();
        let b = ListKey::new("webhook").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_item_types() {
        assert!(ListKey::new("").is_err());
        assert!(ListKey::new("a:b").is_err());
        assert!(ListKey::new("web hook").is_err());
    }

    #[test]
    fn test_parse_and_display() {
        let key: ListKey = "webhook:20261017.101500.000001.3f9a2c1e.7:2".parse().unwrap();
        assert_eq!(key.item_type(), "webhook");
        assert_eq!(key.stamp(), "20261017.101500.000001.3f9a2c1e.7");
        assert_eq!(key.generation(), 2);
        assert_eq!(key.to_string(), "webhook:20261017.101500.000001.3f9a2c1e.7:2");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("K1".parse::<ListKey>().is_err());
        assert!("webhook:stamp".parse::<ListKey>().is_err());
        assert!("webhook:stamp:x".parse::<ListKey>().is_err());
        assert!("webhook:stamp:1:2".parse::<ListKey>().is_err());
        assert!(":stamp:1".parse::<ListKey>().is_err());
        assert!("webhook::1".parse::<ListKey>().is_err());
    }

    #[test]
    fn test_generation_strictly_increases() {
        let key = ListKey::new("webhook").unwrap();
        let next = key.next_generation();
        assert_eq!(next.item_type(), key.item_type());
        assert_eq!(next.stamp(), key.stamp());
        assert!(next.generation() > key.generation());
        assert!(next.next_generation().generation() > next.generation());
    }

    #[test]
    fn test_created_at_from_stamp() {
        let key: ListKey = "webhook:20261017.101500.000250.3f9a2c1e.7:0".parse().unwrap();
        let created = key.created_at().unwrap();
        assert_eq!(
            created.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            "2026-10-17 10:15:00.000250"
        );
    }

    #[test]
    fn test_age_of_new_key_is_small() {
        let key = ListKey::new("webhook").unwrap();
        assert!(key.created_at().is_some());
        assert!(key.age() < Duration::from_secs(5));
    }

    #[test]
    fn test_foreign_stamp_has_no_creation_time() {
        let key: ListKey = "webhook:K1:0".parse().unwrap();
        assert!(key.created_at().is_none());
        assert_eq!(key.age(), Duration::ZERO);
    }

    #[test]
    fn test_serde_uses_string_form() {
        let key: ListKey = "csv:s1:3".parse().unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"csv:s1:3\"");
        let back: ListKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
