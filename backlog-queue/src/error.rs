//! Error types for queue operations.

use redis::{ErrorKind, ServerErrorKind};
use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-specific errors.
///
/// Claim conflicts are not errors; they are reported as
/// [`ClaimAttempt::Conflict`](crate::store::ClaimAttempt::Conflict).
#[derive(Debug, Error)]
pub enum QueueError {
    /// The storage backend cannot be reached.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The backend rejected or failed a command.
    #[error("Backend error: {message}")]
    Backend {
        /// Backend message
        message: String,
        /// Whether repeating the command may succeed
        transient: bool,
    },

    /// A string that is not a unit-of-work key
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The store has been closed
    #[error("Store closed")]
    StoreClosed,

    /// Worker already running
    #[error("Worker already running")]
    WorkerAlreadyRunning,

    /// Worker not running
    #[error("Worker not running")]
    WorkerNotRunning,
}

impl QueueError {
    /// Create a transient backend error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            transient: true,
        }
    }

    /// Whether the operation may succeed if simply repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend { transient: true, .. })
    }

    /// Whether the backend is unreachable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            return Self::StorageUnavailable(err.to_string());
        }

        let transient = matches!(
            err.kind(),
            ErrorKind::Server(
                ServerErrorKind::TryAgain | ServerErrorKind::BusyLoading | ServerErrorKind::ExecAbort
            )
        );

        Self::Backend {
            message: err.to_string(),
            transient,
        }
    }
}

impl From<backlog_redis::RedisError> for QueueError {
    fn from(err: backlog_redis::RedisError) -> Self {
        use backlog_redis::RedisError as E;

        match err {
            E::Redis(e) => e.into(),
            E::Config(msg) => Self::Config(msg),
            E::Command(msg) => Self::Backend {
                message: msg,
                transient: false,
            },
            other => Self::StorageUnavailable(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Self::Deserialization(err.to_string())
        } else {
            Self::Serialization(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_are_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: QueueError = redis::RedisError::from(io).into();
        assert!(err.is_unavailable());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_pool_errors_are_unavailable() {
        let err: QueueError = backlog_redis::RedisError::Pool("timed out".into()).into();
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_command_errors_are_permanent() {
        let err: QueueError = backlog_redis::RedisError::Command("WRONGTYPE".into()).into();
        assert!(!err.is_transient());
        assert!(!err.is_unavailable());
    }

    #[test]
    fn test_transient_constructor() {
        let err = QueueError::transient("LOADING");
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "Backend error: LOADING");
    }

    #[test]
    fn test_bad_json_is_deserialization() {
        let err: QueueError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(err, QueueError::Deserialization(_)));
    }
}
