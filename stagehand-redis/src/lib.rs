//! # Stagehand Redis
//!
//! Named Redis connections for Stagehand queues and workers.
//!
//! A [`RedisConnection`] wraps either a single-node connection manager or an
//! async cluster connection behind one API, so queue code does not care which
//! deployment it talks to. Queue names must be hash-tagged on clusters; the
//! queue layer reads [`RedisConnection::is_cluster`] for that.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stagehand_redis::{RedisConfig, RedisConnection};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RedisConfig::from_env_with_prefix("BG_QUEUE_REDIS")
//!         .connection_name("my-app-queue")
//!         .build();
//!
//!     let conn = RedisConnection::connect("queue", config).await?;
//!
//!     let mut cmd = redis::cmd("SET");
//!     cmd.arg("key").arg("value");
//!     let _: () = conn.query(&cmd).await?;
//!
//!     conn.close().await?;
//!     Ok(())
//! }
//! ```

mod config;
mod connection;
mod error;

pub use config::{RedisConfig, RedisConfigBuilder};
pub use connection::{RedisConnection, RedisHandle};
pub use error::{RedisError, Result};

// Re-export redis crate for convenience
pub use redis;

/// Prelude for common imports.
///
/// ```
/// use stagehand_redis::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{RedisConfig, RedisConfigBuilder};
    pub use crate::connection::{RedisConnection, RedisHandle};
    pub use crate::error::{RedisError, Result};
}
