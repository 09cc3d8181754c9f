// Backlog - crash-tolerant work queues for Rust
//
// This library coordinates batches of payloads between producers and any
// number of worker processes sharing one Redis instance.

// Re-export the coordinator and worker loop
pub use backlog_queue::*;

// Re-export supporting crates
pub use backlog_log;
pub use backlog_redis;

// Prelude for common imports
pub mod prelude {
    pub use backlog_log::{debug, error, info, trace, warn};
    pub use backlog_queue::prelude::*;
    pub use backlog_redis::{RedisConfig, RedisConfigBuilder};
}
