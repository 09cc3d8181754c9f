//! Redis configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Redis configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL (redis://host:port or rediss://host:port for TLS).
    pub url: String,
    /// Connection pool size.
    pub pool_size: u32,
    /// Minimum idle connections.
    #[serde(default)]
    pub min_idle: Option<u32>,
    /// Connection timeout.
    #[serde(with = "secs", default = "default_connection_timeout")]
    pub connection_timeout: Duration,
    /// Command timeout.
    #[serde(with = "secs", default = "default_command_timeout")]
    pub command_timeout: Duration,
    /// Database number (0-15).
    #[serde(default)]
    pub database: Option<u8>,
    /// Username for Redis 6+ ACL.
    #[serde(default)]
    pub username: Option<String>,
    /// Password.
    #[serde(default)]
    pub password: Option<String>,
    /// Use TLS.
    #[serde(default)]
    pub tls: bool,
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 2,
            min_idle: Some(1),
            connection_timeout: default_connection_timeout(),
            command_timeout: default_command_timeout(),
            database: None,
            username: None,
            password: None,
            tls: false,
        }
    }
}

impl RedisConfig {
    /// Create a new configuration.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Create a builder.
    pub fn builder() -> RedisConfigBuilder {
        RedisConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> RedisConfigBuilder {
        let mut builder = RedisConfigBuilder::new();

        if let Ok(url) = std::env::var("REDIS_URL") {
            builder = builder.url(url);
        }

        if let Ok(pool_size) = std::env::var("REDIS_POOL_SIZE")
            && let Ok(size) = pool_size.parse()
        {
            builder = builder.pool_size(size);
        }

        if let Ok(db) = std::env::var("REDIS_DATABASE")
            && let Ok(db_num) = db.parse()
        {
            builder = builder.database(db_num);
        }

        if let Ok(username) = std::env::var("REDIS_USERNAME") {
            builder = builder.username(username);
        }

        if let Ok(password) = std::env::var("REDIS_PASSWORD") {
            builder = builder.password(password);
        }

        if std::env::var("REDIS_TLS").is_ok() {
            builder = builder.tls(true);
        }

        builder
    }

    /// Get the full Redis URL with auth and database.
    pub fn connection_url(&self) -> String {
        let (scheme, rest) = match self.url.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => ("redis", self.url.as_str()),
        };

        let auth = match (&self.username, &self.password) {
            (Some(user), Some(password)) => format!("{}:{}@", user, password),
            (None, Some(password)) => format!(":{}@", password),
            _ => String::new(),
        };

        let mut url = format!("{}://{}{}", scheme, auth, rest);

        // A database already present in the URL path wins.
        if let Some(db) = self.database
            && !rest.contains('/')
        {
            url = format!("{}/{}", url, db);
        }

        url
    }
}

/// Builder for Redis configuration.
#[derive(Default)]
pub struct RedisConfigBuilder {
    config: RedisConfig,
}

impl RedisConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: RedisConfig::default(),
        }
    }

    /// Set the Redis URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    /// Set the pool size.
    pub fn pool_size(mut self, size: u32) -> Self {
        self.config.pool_size = size;
        self
    }

    /// Set the minimum idle connections.
    pub fn min_idle(mut self, min_idle: u32) -> Self {
        self.config.min_idle = Some(min_idle);
        self
    }

    /// Set the connection timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    /// Set the command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout = timeout;
        self
    }

    /// Set the database number.
    pub fn database(mut self, db: u8) -> Self {
        self.config.database = Some(db);
        self
    }

    /// Set the username (Redis 6+ ACL).
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    /// Enable TLS.
    pub fn tls(mut self, enabled: bool) -> Self {
        self.config.tls = enabled;
        if enabled && self.config.url.starts_with("redis://") {
            self.config.url = self.config.url.replacen("redis://", "rediss://", 1);
        }
        self
    }

    /// Build the configuration.
    pub fn build(self) -> RedisConfig {
        self.config
    }
}

/// Durations as whole seconds.
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
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_url_plain() {
        let config = RedisConfig::new("redis://cache:6379");
        assert_eq!(config.connection_url(), "redis://cache:6379");
    }

    #[test]
    fn test_connection_url_with_password_and_database() {
        let config = RedisConfig::builder()
            .url("redis://cache:6379")
            .password("s3cret")
            .database(3)
            .build();
        assert_eq!(config.connection_url(), "redis://:s3cret@cache:6379/3");
    }

    #[test]
    fn test_connection_url_with_acl_user() {
        let config = RedisConfig::builder()
            .url("redis://cache:6379")
            .username("worker")
            .password("pw")
            .build();
        assert_eq!(config.connection_url(), "redis://worker:pw@cache:6379");
    }

    #[test]
    fn test_database_in_url_is_kept() {
        let config = RedisConfig::builder()
            .url("redis://cache:6379/1")
            .database(5)
            .build();
        assert_eq!(config.connection_url(), "redis://cache:6379/1");
    }

    #[test]
    fn test_tls_switches_scheme() {
        let config = RedisConfig::builder()
            .url("redis://cache:6379")
            .tls(true)
            .build();
        assert!(config.tls);
        assert_eq!(config.url, "rediss://cache:6379");
    }

    #[test]
    fn test_timeouts_serialize_as_seconds() {
        let config = RedisConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["connection_timeout"], 5);
        assert_eq!(json["command_timeout"], 30);

        let parsed: RedisConfig = serde_json::from_value(serde_json::json!({
            "url": "redis://other:6380",
            "pool_size": 8,
            "connection_timeout": 2
        }))
        .unwrap();
        assert_eq!(parsed.pool_size, 8);
        assert_eq!(parsed.connection_timeout, Duration::from_secs(2));
        assert_eq!(parsed.command_timeout, Duration::from_secs(30));
    }
}
