//! Crash-tolerant work-queue coordination for Backlog.
//!
//! Producers store batches of payloads under a unit-of-work key; any number of
//! worker processes claim and drain those batches. Provides:
//! - 📦 Redis-backed ready-time index, payload lists and pub/sub wake-ups
//! - 🔒 Optimistic claims: each ready list goes to exactly one worker
//! - 💀 Abandoned-claim recovery without heartbeats
//! - 🔄 Retry generations with a fixed budget
//! - 🅿️ Deferred ring for lists that exhausted their retries
//! - 👷 Worker loop with cancellable waits and jittered wake-ups
//! - 🧪 In-memory backend and manual clock for tests
//!
//! ## Quick Start - Keys
//!
//! ```
//! use backlog_queue::ListKey;
//!
//! let key = ListKey::new("webhook").unwrap();
//! assert_eq!(key.item_type(), "webhook");
//! assert_eq!(key.generation(), 0);
//!
//! let retry = key.next_generation();
//! assert_eq!(retry.generation(), 1);
//! assert_eq!(retry.stamp(), key.stamp());
//!
//! let parsed: ListKey = retry.to_string().parse().unwrap();
//! assert_eq!(parsed, retry);
//! ```
//!
//! ## Store Configuration
//!
//! ```
//! use backlog_queue::{Environment, StoreConfig};
//! use std::time::Duration;
//!
//! let config = StoreConfig::new(Environment::Stage)
//!     .with_timeout(Duration::from_secs(6 * 3600))
//!     .with_retry_delay(Duration::from_secs(600));
//!
//! assert_eq!(config.prefix(), "backlog:stage");
//! assert!(config.validate().is_ok());
//! ```
//!
//! ## Claiming and Draining
//!
//! ```
//! use backlog_queue::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> QueueResult<()> {
//! let store = ItemListStore::in_memory(StoreConfig::new(Environment::Dev))?;
//! store.submit("csv", vec![Payload::from("a,b,c")]).await?;
//!
//! let key = store.select_for_processing("csv").await?.unwrap();
//! // A second caller finds nothing: the list is claimed.
//! assert!(store.select_for_processing("csv").await?.is_none());
//!
//! while let Some(payload) = store.pop_item(&key).await? {
//!     assert_eq!(payload.as_bytes(), b"a,b,c");
//! }
//! store.remove_completed(&key).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Complete Example
//!
//! ```no_run
//! use backlog_queue::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), QueueError> {
//!     backlog_log::init();
//!
//!     // Connect using ENVIRONMENT, REDIS_URL and BACKLOG_* variables
//!     let store = ItemListStore::open(StoreConfig::from_env()?).await?;
//!
//!     // Producer side
//!     let accepted = store
//!         .submit("webhook", vec![Payload::json(&serde_json::json!({"id": 1}))?])
//!         .await?;
//!     println!("accepted {}", accepted.accepted);
//!
//!     // Consumer side
//!     let mut worker = Worker::new(store.clone(), "webhook", |_, payload| async move {
//!         match payload.decode::<serde_json::Value>() {
//!             Ok(_) => Outcome::Success,
//!             Err(e) => Outcome::PermanentFailure(e.to_string()),
//!         }
//!     });
//!     worker.start().await?;
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     worker.stop().await?;
//!     store.close();
//!
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod clock;
pub mod config;
pub mod control;
pub mod error;
pub mod key;
pub mod payload;
pub mod store;
pub mod worker;

pub use backend::{
    ClaimTransaction, MemoryBackend, QueueBackend, RedisBackend, ScoreBound, ScoreRange,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Environment, StoreConfig};
pub use control::{DeferralControl, DeferralReport};
pub use error::{QueueError, QueueResult};
pub use key::ListKey;
pub use payload::{Outcome, Payload};
pub use store::{Accepted, ClaimAttempt, ClaimWindows, ItemListStore, ReadinessListener};
pub use worker::{
    DrainReport, FollowUp, ItemHandler, RunReport, Worker, WorkerConfig, WorkerState, WorkerStats,
};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Environment, StoreConfig};
    pub use crate::control::{DeferralControl, DeferralReport};
    pub use crate::error::{QueueError, QueueResult};
    pub use crate::key::ListKey;
    pub use crate::payload::{Outcome, Payload};
    pub use crate::store::{Accepted, ItemListStore};
    pub use crate::worker::{ItemHandler, Worker, WorkerConfig};
}
