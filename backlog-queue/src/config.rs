//! Store configuration.

use crate::error::{QueueError, QueueResult};
use backlog_redis::RedisConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Deployment environment.
///
/// Scopes key names so that environments sharing one Redis never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Environment {
    /// Development, QA and test
    Dev,
    /// Staging
    Stage,
    /// Production
    Prod,
}

impl Environment {
    /// Map an environment name to an environment. Unknown names are production.
    pub fn lookup(name: &str) -> Self {
        match name.trim().to_uppercase().as_str() {
            "DEV" | "DEVELOPMENT" | "QA" | "TEST" => Self::Dev,
            "STAGE" | "STAGING" => Self::Stage,
            _ => Self::Prod,
        }
    }

    /// The environment named by `ENVIRONMENT`.
    pub fn from_env() -> Self {
        Self::lookup(&std::env::var("ENVIRONMENT").unwrap_or_default())
    }

    /// Lower-case name used in key prefixes.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Stage => "stage",
            Self::Prod => "prod",
        }
    }

    /// Redis pool size for this environment.
    pub fn pool_size(&self) -> u32 {
        match self {
            Self::Prod => 5,
            Self::Dev | Self::Stage => 2,
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::from_env()
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for an [`ItemListStore`](crate::store::ItemListStore).
///
/// ```
/// use backlog_queue::{Environment, StoreConfig};
/// use std::time::Duration;
///
/// let config = StoreConfig::new(Environment::Stage)
///     .with_timeout(Duration::from_secs(6 * 3600))
///     .with_retry_delay(Duration::from_secs(600));
///
/// assert_eq!(config.prefix(), "backlog:stage");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis connection settings
    pub redis: RedisConfig,

    /// Deployment environment
    pub environment: Environment,

    /// Prefix for every key; `backlog:{environment}` when unset
    pub key_prefix: Option<String>,

    /// Offset of the claim marker from the claim time
    #[serde(with = "secs")]
    pub in_process_window: Duration,

    /// How long a claim may be held before it counts as abandoned
    #[serde(with = "secs")]
    pub timeout: Duration,

    /// Delay before a retry generation becomes ready
    #[serde(with = "secs")]
    pub retry_delay: Duration,

    /// Tolerated clock skew between cooperating processes
    #[serde(with = "secs")]
    pub clock_drift: Duration,

    /// Shortest pause after a claim conflict
    #[serde(with = "millis")]
    pub claim_backoff_min: Duration,

    /// Longest pause after a claim conflict
    #[serde(with = "millis")]
    pub claim_backoff_max: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new(Environment::from_env())
    }
}

impl StoreConfig {
    /// Defaults for an environment.
    pub fn new(environment: Environment) -> Self {
        let redis = RedisConfig::builder()
            .pool_size(environment.pool_size())
            .build();

        Self {
            redis,
            environment,
            key_prefix: None,
            in_process_window: Duration::from_secs(7 * 24 * 3600),
            timeout: Duration::from_secs(20 * 60),
            retry_delay: Duration::from_secs(15 * 60),
            clock_drift: Duration::from_secs(15),
            claim_backoff_min: Duration::from_millis(10),
            claim_backoff_max: Duration::from_millis(250),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        let environment = Environment::from_env();
        let mut config = Self::new(environment);

        let mut redis = RedisConfig::from_env().build();
        if std::env::var("REDIS_POOL_SIZE").is_err() {
            redis.pool_size = environment.pool_size();
        }
        config.redis = redis;

        if let Ok(prefix) = std::env::var("BACKLOG_KEY_PREFIX") {
            config.key_prefix = Some(prefix);
        }
        if let Some(timeout) = env_secs("BACKLOG_TIMEOUT_SECS")? {
            config.timeout = timeout;
        }
        if let Some(delay) = env_secs("BACKLOG_RETRY_DELAY_SECS")? {
            config.retry_delay = delay;
        }
        if let Some(window) = env_secs("BACKLOG_IN_PROCESS_SECS")? {
            config.in_process_window = window;
        }
        if let Some(drift) = env_secs("BACKLOG_CLOCK_DRIFT_SECS")? {
            config.clock_drift = drift;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> QueueResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| QueueError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the Redis configuration.
    pub fn with_redis(mut self, redis: RedisConfig) -> Self {
        self.redis = redis;
        self
    }

    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Set the claim marker offset.
    pub fn with_in_process_window(mut self, window: Duration) -> Self {
        self.in_process_window = window;
        self
    }

    /// Set the abandonment timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the clock drift tolerance.
    pub fn with_clock_drift(mut self, drift: Duration) -> Self {
        self.clock_drift = drift;
        self
    }

    /// Set the claim conflict pause range.
    pub fn with_claim_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.claim_backoff_min = min;
        self.claim_backoff_max = max;
        self
    }

    /// The resolved key prefix.
    pub fn prefix(&self) -> String {
        match &self.key_prefix {
            Some(prefix) => prefix.clone(),
            None => format!("backlog:{}", self.environment),
        }
    }

    /// Reject configurations whose score windows overlap.
    ///
    /// Claim markers must sort after every retry entry and the abandoned
    /// window must be non-empty.
    pub fn validate(&self) -> QueueResult<()> {
        if self.timeout.is_zero() {
            return Err(QueueError::Config("timeout must be positive".into()));
        }

        let floor = self.timeout + self.retry_delay + self.clock_drift * 2;
        if self.in_process_window <= floor {
            return Err(QueueError::Config(format!(
                "in_process_window ({}s) must exceed timeout + retry_delay + 2 * clock_drift ({}s)",
                self.in_process_window.as_secs(),
                floor.as_secs()
            )));
        }

        if self.claim_backoff_min > self.claim_backoff_max {
            return Err(QueueError::Config(
                "claim_backoff_min must not exceed claim_backoff_max".into(),
            ));
        }

        Ok(())
    }
}

fn env_secs(name: &str) -> QueueResult<Option<Duration>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|e| QueueError::Config(format!("{}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_lookup() {
        assert_eq!(Environment::lookup("DEV"), Environment::Dev);
        assert_eq!(Environment::lookup("development"), Environment::Dev);
        assert_eq!(Environment::lookup("QA"), Environment::Dev);
        assert_eq!(Environment::lookup("TEST"), Environment::Dev);
        assert_eq!(Environment::lookup("STAGING"), Environment::Stage);
        assert_eq!(Environment::lookup("STAGE"), Environment::Stage);
        assert_eq!(Environment::lookup("PROD"), Environment::Prod);
        assert_eq!(Environment::lookup(""), Environment::Prod);
        assert_eq!(Environment::lookup("anything"), Environment::Prod);
    }

    #[test]
    fn test_pool_size_by_environment() {
        assert_eq!(StoreConfig::new(Environment::Prod).redis.pool_size, 5);
        assert_eq!(StoreConfig::new(Environment::Dev).redis.pool_size, 2);
    }

    #[test]
    fn test_defaults() {
        let config = StoreConfig::new(Environment::Prod);
        assert_eq!(config.in_process_window, Duration::from_secs(604_800));
        assert_eq!(config.timeout, Duration::from_secs(1200));
        assert_eq!(config.retry_delay, Duration::from_secs(900));
        assert_eq!(config.clock_drift, Duration::from_secs(15));
        assert_eq!(config.prefix(), "backlog:prod");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_prefix() {
        let config = StoreConfig::new(Environment::Dev).with_key_prefix("acme:q");
        assert_eq!(config.prefix(), "acme:q");
    }

    #[test]
    fn test_validate_rejects_overlapping_windows() {
        let config = StoreConfig::new(Environment::Dev)
            .with_in_process_window(Duration::from_secs(3600))
            .with_timeout(Duration::from_secs(3000))
            .with_retry_delay(Duration::from_secs(900));
        assert!(matches!(config.validate(), Err(QueueError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let config = StoreConfig::new(Environment::Dev)
            .with_claim_backoff(Duration::from_millis(500), Duration::from_millis(10));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml() {
        let config = StoreConfig::from_toml_str(
            r#"
            environment = "STAGE"
            key_prefix = "acme"
            timeout = 21600
            retry_delay = 600
            claim_backoff_max = 100

            [redis]
            url = "redis://queue:6379"
            pool_size = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.environment, Environment::Stage);
        assert_eq!(config.prefix(), "acme");
        assert_eq!(config.timeout, Duration::from_secs(21_600));
        assert_eq!(config.retry_delay, Duration::from_secs(600));
        assert_eq!(config.clock_drift, Duration::from_secs(15));
        assert_eq!(config.claim_backoff_max, Duration::from_millis(100));
        assert_eq!(config.redis.url, "redis://queue:6379");
        assert_eq!(config.redis.pool_size, 3);
    }

    #[test]
    fn test_from_toml_rejects_invalid_windows() {
        let result = StoreConfig::from_toml_str("in_process_window = 60\n");
        assert!(matches!(result, Err(QueueError::Config(_))));
    }
}
