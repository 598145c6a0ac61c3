//! Named Redis connections shared by queues and workers.

use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::cluster_async::ClusterConnection;
use redis::{Cmd, FromRedisValue, Pipeline};
use tracing::{debug, info, warn};

use crate::{RedisConfig, RedisError, Result};

/// A live handle to either a single node or a cluster.
///
/// Both variants are cheap to clone and multiplex commands over a shared
/// socket, so every queue opened on a connection clones the same handle.
#[derive(Clone)]
pub enum RedisHandle {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

impl RedisHandle {
    /// Run one command on this handle.
    pub async fn query<T: FromRedisValue>(&mut self, cmd: &Cmd) -> redis::RedisResult<T> {
        match self {
            Self::Single(conn) => cmd.query_async(conn).await,
            Self::Cluster(conn) => cmd.query_async(conn).await,
        }
    }

    /// Run a pipeline on this handle.
    pub async fn query_pipeline<T: FromRedisValue>(&mut self, pipe: &Pipeline) -> redis::RedisResult<T> {
        match self {
            Self::Single(conn) => pipe.query_async(conn).await,
            Self::Cluster(conn) => pipe.query_async(conn).await,
        }
    }
}

/// A named Redis connection.
///
/// The name identifies the connection in logs and in topology errors
/// ("queue connection", "worker connection", ...). Closing drops the
/// underlying handle; later commands fail with [`RedisError::Closed`].
pub struct RedisConnection {
    name: String,
    config: RedisConfig,
    handle: RwLock<Option<RedisHandle>>,
}

impl RedisConnection {
    /// Open a connection and verify it with `PING`.
    pub async fn connect(name: impl Into<String>, config: RedisConfig) -> Result<Self> {
        let name = name.into();
        config.validate()?;

        let handle = tokio::time::timeout(config.connection_timeout, open_handle(&config))
            .await
            .map_err(|_| RedisError::Timeout)??;

        let connection = Self {
            name,
            config,
            handle: RwLock::new(Some(handle)),
        };

        let pong: String = connection.query(&redis::cmd("PING")).await?;
        debug!(connection = %connection.name, reply = %pong, "Redis ping");

        if let Some(client_name) = connection.config.connection_name.clone() {
            let mut cmd = redis::cmd("CLIENT");
            cmd.arg("SETNAME").arg(&client_name);
            if let Err(err) = connection.query::<()>(&cmd).await {
                warn!(connection = %connection.name, error = %err, "CLIENT SETNAME failed");
            }
        }

        info!(
            connection = %connection.name,
            url = %connection.config.url,
            cluster = connection.config.cluster,
            "Redis connection established"
        );

        Ok(connection)
    }

    /// Connection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration this connection was opened with.
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Whether this is a cluster connection.
    pub fn is_cluster(&self) -> bool {
        self.config.cluster
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.handle.read().is_none()
    }

    /// Clone the live handle.
    pub fn handle(&self) -> Result<RedisHandle> {
        self.handle
            .read()
            .clone()
            .ok_or_else(|| RedisError::Closed(self.name.clone()))
    }

    /// Run one command, bounded by the configured command timeout.
    pub async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T> {
        let mut handle = self.handle()?;
        tokio::time::timeout(self.config.command_timeout, handle.query(cmd))
            .await
            .map_err(|_| RedisError::Timeout)?
            .map_err(RedisError::from)
    }

    /// Run a pipeline, bounded by the configured command timeout.
    pub async fn query_pipeline<T: FromRedisValue>(&self, pipe: &Pipeline) -> Result<T> {
        let mut handle = self.handle()?;
        tokio::time::timeout(self.config.command_timeout, handle.query_pipeline(pipe))
            .await
            .map_err(|_| RedisError::Timeout)?
            .map_err(RedisError::from)
    }

    /// Check the connection with `PING`.
    pub async fn health_check(&self) -> Result<()> {
        let _: String = self.query(&redis::cmd("PING")).await?;
        Ok(())
    }

    /// Drop the handle. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let previous = self.handle.write().take();
        if previous.is_some() {
            info!(connection = %self.name, "Redis connection closed");
        }
        Ok(())
    }
}

impl std::fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnection")
            .field("name", &self.name)
            .field("url", &self.config.url)
            .field("cluster", &self.config.cluster)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn open_handle(config: &RedisConfig) -> Result<RedisHandle> {
    if config.cluster {
        let client = redis::cluster::ClusterClient::new(config.cluster_urls())
            .map_err(|e| RedisError::Connection(e.to_string()))?;
        let conn = client
            .get_async_connection()
            .await
            .map_err(|e| RedisError::Connection(e.to_string()))?;
        Ok(RedisHandle::Cluster(conn))
    } else {
        let client = redis::Client::open(config.connection_url())
            .map_err(|e| RedisError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| RedisError::Connection(e.to_string()))?;
        Ok(RedisHandle::Single(conn))
    }
}
