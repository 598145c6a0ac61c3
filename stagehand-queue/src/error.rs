//! Error types for topology, dispatch and broker operations.

use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-specific errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Native config has no connection for the default queue
    #[error("Missing queue connection for the default queue")]
    DefaultQueueMissingConnection,

    /// Native config has no connection for a named queue
    #[error("Missing queue connection for named queue '{0}'")]
    NamedQueueMissingConnection(String),

    /// Workers requested without a default worker connection
    #[error("Activating background workers without a default worker connection")]
    WorkersWithoutDefaultWorkerConnection,

    /// Workers requested for a named queue without a worker connection
    #[error("Activating workers for named queue '{0}' without a worker connection")]
    NamedWorkersWithoutWorkerConnection(String),

    /// A job named a workstream that is not configured
    #[error("No queue for specified workstream: {0}")]
    NoQueueForWorkstream(String),

    /// A job named a queue that is not configured
    #[error("No queue for specified queue name: {0}")]
    NoQueueForQueueName(String),

    /// A test helper named a queue that does not exist
    #[error("Queue '{name}' not found; available queues: {}", .available.join(", "))]
    QueueNotFound { name: String, available: Vec<String> },

    /// Cron pattern could not be parsed
    #[error("Invalid cron pattern: {0}")]
    InvalidCronPattern(String),

    /// Settings file could not be loaded or understood
    #[error("Configuration error: {0}")]
    Config(String),

    /// Envelope violates its shape rules
    #[error("Invalid job envelope: {0}")]
    InvalidEnvelope(String),

    /// Envelope names a method the registered class does not have
    #[error("{global_name} has no background method '{method}'")]
    UnknownMethod { global_name: String, method: String },

    /// Model-instance job for a class registered without a finder
    #[error("{0} is not registered as a model")]
    NotAModel(String),

    /// Target method failed while running inline
    #[error("Job execution failed: {0}")]
    Execution(#[source] anyhow::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Redis connection error
    #[error(transparent)]
    Connection(#[from] stagehand_redis::RedisError),

    /// Redis command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Worker not running
    #[error("Worker not running")]
    WorkerNotRunning,

    /// Worker already running
    #[error("Worker already running")]
    WorkerAlreadyRunning,

    /// Ack or fail from a worker that no longer holds the lease
    #[error("Job {0} is not leased by this worker")]
    LeaseLost(String),

    /// Queue or connection already closed
    #[error("'{0}' is closed")]
    Closed(String),

    /// Connect or dispatch after the application's connections were closed
    #[error("Background jobs for '{0}' were shut down and their connections closed")]
    ShutDown(String),

    /// Installing a shutdown signal handler failed
    #[error("Failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

impl QueueError {
    /// Whether this error comes from configuration rather than runtime I/O.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::DefaultQueueMissingConnection
                | Self::NamedQueueMissingConnection(_)
                | Self::WorkersWithoutDefaultWorkerConnection
                | Self::NamedWorkersWithoutWorkerConnection(_)
                | Self::NoQueueForWorkstream(_)
                | Self::NoQueueForQueueName(_)
                | Self::InvalidCronPattern(_)
                | Self::Config(_)
        )
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
