//! Redis configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{RedisError, Result};

/// Redis configuration for one logical connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis URL (redis://host:port or rediss://host:port for TLS).
    pub url: String,
    /// Connection timeout.
    #[serde(with = "secs_serde")]
    pub connection_timeout: Duration,
    /// Command timeout.
    #[serde(with = "secs_serde")]
    pub command_timeout: Duration,
    /// Database number (0-15). Ignored in cluster mode.
    pub database: Option<u8>,
    /// Username for Redis 6+ ACL.
    pub username: Option<String>,
    /// Password.
    pub password: Option<String>,
    /// Cluster mode.
    pub cluster: bool,
    /// Cluster seed nodes. Falls back to `url` when empty.
    pub cluster_nodes: Vec<String>,
    /// Use TLS.
    pub tls: bool,
    /// Connection name (for CLIENT SETNAME).
    pub connection_name: Option<String>,
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
            connection_timeout: default_connection_timeout(),
            command_timeout: default_command_timeout(),
            database: None,
            username: None,
            password: None,
            cluster: false,
            cluster_nodes: Vec::new(),
            tls: false,
            connection_name: None,
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

    /// Load configuration from `REDIS_*` environment variables.
    pub fn from_env() -> RedisConfigBuilder {
        Self::from_env_with_prefix("REDIS")
    }

    /// Load configuration from `{prefix}_*` environment variables.
    ///
    /// Lets queue and worker connections read separate settings, e.g.
    /// `BG_QUEUE_REDIS_URL` and `BG_WORKER_REDIS_URL`.
    pub fn from_env_with_prefix(prefix: &str) -> RedisConfigBuilder {
        let var = |suffix: &str| std::env::var(format!("{}_{}", prefix, suffix));
        let mut builder = RedisConfigBuilder::new();

        if let Ok(url) = var("URL") {
            builder = builder.url(url);
        }

        if let Ok(db) = var("DATABASE")
            && let Ok(db_num) = db.parse()
        {
            builder = builder.database(db_num);
        }

        if let Ok(username) = var("USERNAME") {
            builder = builder.username(username);
        }

        if let Ok(password) = var("PASSWORD") {
            builder = builder.password(password);
        }

        if var("TLS").is_ok() {
            builder = builder.tls(true);
        }

        if var("CLUSTER").is_ok() {
            builder = builder.cluster(true);
        }

        if let Ok(nodes) = var("CLUSTER_NODES") {
            let nodes: Vec<String> = nodes.split(',').map(|s| s.trim().to_string()).collect();
            builder = builder.cluster_nodes(nodes);
        }

        builder
    }

    /// Check that every configured URL parses and uses a redis scheme.
    pub fn validate(&self) -> Result<()> {
        let urls = std::iter::once(&self.url).chain(self.cluster_nodes.iter());
        for raw in urls {
            let parsed = url::Url::parse(raw)
                .map_err(|e| RedisError::Config(format!("invalid url '{}': {}", raw, e)))?;
            if !matches!(parsed.scheme(), "redis" | "rediss") {
                return Err(RedisError::Config(format!(
                    "unsupported scheme '{}' in '{}'",
                    parsed.scheme(),
                    raw
                )));
            }
        }
        Ok(())
    }

    /// Get the full Redis URL with auth and database.
    pub fn connection_url(&self) -> String {
        with_credentials(&self.url, self.username.as_deref(), self.password.as_deref(), self.database)
    }

    /// Seed node URLs for cluster mode, with credentials applied.
    pub fn cluster_urls(&self) -> Vec<String> {
        let nodes: Vec<&String> = if self.cluster_nodes.is_empty() {
            vec![&self.url]
        } else {
            self.cluster_nodes.iter().collect()
        };

        nodes
            .into_iter()
            .map(|node| with_credentials(node, self.username.as_deref(), self.password.as_deref(), None))
            .collect()
    }
}

fn with_credentials(
    base: &str,
    username: Option<&str>,
    password: Option<&str>,
    database: Option<u8>,
) -> String {
    let mut url = base.to_string();

    if let Some(password) = password {
        let auth = match username {
            Some(username) => format!("{}:{}@", username, password),
            None => format!(":{}@", password),
        };
        if let Some(rest) = url.strip_prefix("rediss://") {
            url = format!("rediss://{}{}", auth, rest);
        } else if let Some(rest) = url.strip_prefix("redis://") {
            url = format!("redis://{}{}", auth, rest);
        }
    }

    if let Some(db) = database {
        let after_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(&url);
        if !after_scheme.contains('/') {
            url = format!("{}/{}", url, db);
        }
    }

    url
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

    /// Enable cluster mode.
    pub fn cluster(mut self, enabled: bool) -> Self {
        self.config.cluster = enabled;
        self
    }

    /// Set cluster nodes. Implies cluster mode.
    pub fn cluster_nodes(mut self, nodes: Vec<String>) -> Self {
        self.config.cluster_nodes = nodes;
        self.config.cluster = true;
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

    /// Set the connection name.
    pub fn connection_name(mut self, name: impl Into<String>) -> Self {
        self.config.connection_name = Some(name.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> RedisConfig {
        self.config
    }
}

mod secs_serde {
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
