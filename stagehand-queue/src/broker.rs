//! The durable-queue engine as seen by this crate.
//!
//! A [`BrokerConnection`] is one client connection to the engine; queues are
//! opened on it by wire name. Two implementations ship with the crate: Redis
//! (see [`crate::backend::redis`]) and an in-process broker for tests and
//! single-process use (see [`crate::backend::memory`]).

use crate::envelope::JobEnvelope;
use crate::error::QueueResult;
use crate::job::{Backoff, Job, JobId};
use crate::options::EnqueueOptions;
use crate::schedule::ScheduleSpec;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Default options applied to every job added to a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueDefaults {
    /// Attempts per job, including the first
    pub attempts: u32,
    /// Delay between attempts
    pub backoff: Option<Backoff>,
    /// How long finished job records are kept, in seconds
    pub retention_secs: u64,
    /// Seconds a lease stays valid before the job is handed to another worker
    pub lease_timeout_secs: u64,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff: None,
            retention_secs: 86_400,
            lease_timeout_secs: 1_800,
        }
    }
}

impl QueueDefaults {
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention_secs = retention.as_secs();
        self
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout_secs = timeout.as_secs();
        self
    }

    /// Lease timeout as a chrono duration.
    pub fn lease_timeout(&self) -> chrono::Duration {
        i64::try_from(self.lease_timeout_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}

/// Finished-job state targeted by [`BrokerQueue::clean`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanState {
    Completed,
    Failed,
}

/// One queue on the broker.
#[async_trait]
pub trait BrokerQueue: Send + Sync {
    /// Wire name of the queue.
    fn name(&self) -> &str;

    /// Add a job. A job whose explicit id already exists is ignored and the
    /// existing id returned.
    async fn add(&self, envelope: &JobEnvelope, options: &EnqueueOptions) -> QueueResult<JobId>;

    /// Create or replace the repeatable job with `schedule.id`.
    async fn upsert_schedule(&self, schedule: &ScheduleSpec) -> QueueResult<()>;

    /// Lease the next ready job, highest priority first then FIFO.
    ///
    /// Jobs leased longer ago than the queue's lease timeout go back to
    /// waiting first, and their old lease token stops working.
    async fn lease_next(&self, token: &str) -> QueueResult<Option<Job>>;

    /// Mark a leased job completed.
    async fn ack(&self, job: &Job, token: &str) -> QueueResult<()>;

    /// Record a failed attempt; the broker retries per the queue defaults.
    async fn fail(&self, job: &Job, token: &str, error: &str) -> QueueResult<()>;

    /// Jobs waiting on a delay or retry backoff.
    async fn delayed(&self) -> QueueResult<Vec<Job>>;

    /// Registered repeatable jobs.
    async fn schedules(&self) -> QueueResult<Vec<ScheduleSpec>>;

    /// Remove every waiting and delayed job.
    async fn drain(&self) -> QueueResult<()>;

    /// Remove up to `limit` finished jobs older than `grace`.
    async fn clean(&self, grace: Duration, limit: usize, state: CleanState) -> QueueResult<usize>;

    /// Remove every repeatable job, returning how many were removed.
    async fn remove_schedules(&self) -> QueueResult<usize>;

    /// Release the queue handle.
    async fn close(&self) -> QueueResult<()>;
}

/// One client connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Whether the broker is clustered; queue names are hash-tagged if so.
    fn is_cluster(&self) -> bool;

    /// Open a queue handle on this connection.
    fn open_queue(&self, wire_name: &str, defaults: &QueueDefaults) -> Arc<dyn BrokerQueue>;

    /// Close the connection. Closing twice is a no-op.
    async fn close(&self) -> QueueResult<()>;
}

/// Shared handle to a broker connection.
pub type ConnectionRef = Arc<dyn BrokerConnection>;

/// Whether two handles point at the same connection object.
pub fn same_connection(a: &ConnectionRef, b: &ConnectionRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Push `conn` unless an identical handle is already present.
pub(crate) fn push_unique(connections: &mut Vec<ConnectionRef>, conn: &ConnectionRef) {
    if !connections.iter().any(|c| same_connection(c, conn)) {
        connections.push(conn.clone());
    }
}
