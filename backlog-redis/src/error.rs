//! Redis error types.

use thiserror::Error;

/// Result type for Redis operations.
pub type Result<T> = std::result::Result<T, RedisError>;

/// Redis errors.
#[derive(Debug, Error)]
pub enum RedisError {
    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Pool error.
    #[error("Pool error: {0}")]
    Pool(String),

    /// Command error.
    #[error("Command error: {0}")]
    Command(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout error.
    #[error("Operation timed out")]
    Timeout,

    /// Pub/Sub error.
    #[error("Pub/Sub error: {0}")]
    PubSub(String),

    /// Underlying Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl RedisError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout | Self::Pool(_) | Self::PubSub(_) => true,
            Self::Redis(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            Self::Command(_) | Self::Config(_) => false,
        }
    }

    /// Check if this error indicates connection loss.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Pool(_) => true,
            Self::Redis(e) => e.is_connection_refusal() || e.is_connection_dropped(),
            _ => false,
        }
    }
}

impl<E> From<bb8::RunError<E>> for RedisError
where
    E: std::error::Error + 'static,
{
    fn from(err: bb8::RunError<E>) -> Self {
        match err {
            bb8::RunError::TimedOut => Self::Pool("timed out waiting for a connection".to_string()),
            bb8::RunError::User(e) => Self::Pool(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RedisError::Timeout.is_retryable());
        assert!(RedisError::Pool("exhausted".into()).is_retryable());
        assert!(!RedisError::Config("bad url".into()).is_retryable());
        assert!(!RedisError::Command("WRONGTYPE".into()).is_retryable());
    }

    #[test]
    fn test_pool_timeout_conversion() {
        let err: RedisError = bb8::RunError::<std::io::Error>::TimedOut.into();
        assert!(matches!(err, RedisError::Pool(_)));
        assert!(err.is_connection_error());
    }
}
