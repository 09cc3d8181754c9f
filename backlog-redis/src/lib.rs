//! # Backlog Redis
//!
//! Redis connectivity shared by every backlog process.
//!
//! ## Features
//!
//! - **Connection Pooling**: bb8 pool of multiplexed connections; a checked-out
//!   connection is exclusive and starts with no watched keys, so
//!   `WATCH`/`MULTI`/`EXEC` transactions are safe on it
//! - **Pub/Sub**: channel subscriptions delivered over a bounded `mpsc` receiver
//! - **Environment Configuration**: `REDIS_*` variables with a builder fallback
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use backlog_redis::{RedisService, RedisConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RedisConfig::from_env().pool_size(4).build();
//!     let redis = RedisService::new(config).await?;
//!
//!     let mut conn = redis.get().await?;
//!     let depth: usize = redis::cmd("ZCARD")
//!         .arg("backlog:prod:webhook:ready")
//!         .query_async(&mut *conn)
//!         .await?;
//!     println!("{} lists waiting", depth);
//!
//!     let mut arrivals = redis.pubsub()?.subscribe("backlog:prod:webhook:arrivals").await?;
//!     while let Some(message) = arrivals.recv().await {
//!         println!("new list {}", message.payload);
//!     }
//!
//!     Ok(())
//! }
//! ```

mod config;
mod error;
mod pool;
mod pubsub;
mod service;

pub use config::{RedisConfig, RedisConfigBuilder};
pub use error::{RedisError, Result};
pub use pool::{RedisConnection, RedisPool, WatchResetManager, connect_pool};
pub use pubsub::{Message, PubSub, Subscription};
pub use service::{PoolStats, RedisService};

// Re-export redis crate for convenience
pub use redis;
pub use redis::{AsyncCommands, RedisResult};

/// Prelude for common imports.
///
/// ```
/// use backlog_redis::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{RedisConfig, RedisConfigBuilder};
    pub use crate::error::{RedisError, Result};
    pub use crate::pool::{RedisConnection, RedisPool};
    pub use crate::pubsub::{Message, PubSub, Subscription};
    pub use crate::service::RedisService;
    pub use redis::AsyncCommands;
}
