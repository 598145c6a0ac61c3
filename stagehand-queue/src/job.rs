//! Job records and their state transitions.

use crate::envelope::{JobEnvelope, JobType};
use crate::options::EnqueueOptions;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Job unique identifier.
pub type JobId = String;

/// Queue name given to jobs executed inline in test mode.
pub const INLINE_QUEUE_NAME: &str = "TestQueue";

/// Job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to be leased
    Waiting,
    /// Waiting for its delay or retry backoff to pass
    Delayed,
    /// Leased by a worker
    Active,
    /// Finished successfully
    Completed,
    /// Failed with no attempts left
    Failed,
}

/// Retry backoff between failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry
    Fixed { delay_ms: u64 },
    /// `delay_ms * 2^(attempt - 1)`
    Exponential { delay_ms: u64 },
}

const MAX_BACKOFF_MS: u64 = 3_600_000;

impl Backoff {
    /// Delay before the retry that follows `attempts_made` attempts.
    pub fn delay_for(&self, attempts_made: u32) -> chrono::Duration {
        let ms = match *self {
            Backoff::Fixed { delay_ms } => delay_ms,
            Backoff::Exponential { delay_ms } => {
                let exponent = attempts_made.saturating_sub(1).min(32);
                delay_ms.saturating_mul(1u64 << exponent)
            }
        };
        chrono::Duration::milliseconds(ms.min(MAX_BACKOFF_MS) as i64)
    }
}

/// A job as stored by the broker and handed to every invoked method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub id: JobId,

    /// Job type name
    pub name: JobType,

    /// Logical queue name
    pub queue: String,

    /// The call this job performs
    pub data: JobEnvelope,

    /// Options the job was enqueued with
    pub options: EnqueueOptions,

    pub state: JobState,

    pub attempts_made: u32,

    pub max_attempts: u32,

    pub created_at: DateTime<Utc>,

    /// Earliest time the job may be leased
    pub run_at: DateTime<Utc>,

    pub processed_at: Option<DateTime<Utc>>,

    pub finished_at: Option<DateTime<Utc>>,

    pub failed_reason: Option<String>,

    /// Token of the worker currently holding the lease
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_token: Option<String>,
}

impl Job {
    /// Create a job from an envelope and its enqueue options.
    ///
    /// Takes the explicit job id from `options` when present.
    pub fn new(
        queue: impl Into<String>,
        data: JobEnvelope,
        options: EnqueueOptions,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        let run_at = i64::try_from(options.delay_ms())
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let state = if options.delay_ms() > 0 {
            JobState::Delayed
        } else {
            JobState::Waiting
        };

        Self {
            id: options
                .job_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: data.job_type(),
            queue: queue.into(),
            data,
            options,
            state,
            attempts_made: 0,
            max_attempts: max_attempts.max(1),
            created_at: now,
            run_at,
            processed_at: None,
            finished_at: None,
            failed_reason: None,
            lock_token: None,
        }
    }

    /// A job that never touched a broker, for inline execution.
    pub fn synthetic(data: JobEnvelope) -> Self {
        let mut job = Self::new(INLINE_QUEUE_NAME, data, EnqueueOptions::default(), 1);
        job.id = format!("inline-{}", job.id);
        job
    }

    pub fn envelope(&self) -> &JobEnvelope {
        &self.data
    }

    /// Check if the job is ready to be leased.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        now >= self.run_at
    }

    /// Check if another attempt is allowed.
    pub fn can_retry(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    /// Mark the job as leased by `token`.
    pub fn start_processing(&mut self, token: &str) {
        self.state = JobState::Active;
        self.processed_at = Some(Utc::now());
        self.lock_token = Some(token.to_string());
    }

    /// Check if the job reached a final state.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, JobState::Completed | JobState::Failed)
    }

    /// Check if an active lease is older than `timeout`.
    pub fn lease_expired(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        let Some(leased_at) = self.processed_at else {
            return false;
        };
        self.state == JobState::Active
            && leased_at
                .checked_add_signed(timeout)
                .is_some_and(|expires_at| expires_at <= now)
    }

    /// Return a job whose worker stopped answering to the waiting state.
    ///
    /// The attempt is not counted.
    pub fn release_stalled(&mut self) {
        self.state = JobState::Waiting;
        self.lock_token = None;
        self.run_at = Utc::now();
    }

    /// Mark the job as completed.
    pub fn complete(&mut self) {
        self.attempts_made += 1;
        self.state = JobState::Completed;
        self.finished_at = Some(Utc::now());
        self.lock_token = None;
    }

    /// Record a failed attempt. Returns `true` when the job will be retried.
    pub fn fail(&mut self, error: impl Into<String>, backoff: Option<&Backoff>) -> bool {
        self.attempts_made += 1;
        self.failed_reason = Some(error.into());
        self.lock_token = None;

        if self.can_retry() {
            let delay = backoff
                .map(|b| b.delay_for(self.attempts_made))
                .unwrap_or_else(chrono::Duration::zero);
            self.run_at = Utc::now() + delay;
            self.state = if delay > chrono::Duration::zero() {
                JobState::Delayed
            } else {
                JobState::Waiting
            };
            true
        } else {
            self.state = JobState::Failed;
            self.finished_at = Some(Utc::now());
            false
        }
    }
}
