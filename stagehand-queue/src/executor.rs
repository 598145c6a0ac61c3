//! Where dispatched calls go: to the broker, or straight to the runner.

use crate::envelope::JobEnvelope;
use crate::error::QueueResult;
use crate::job::{Job, JobId};
use crate::options::EnqueueOptions;
use crate::runner::{JobRunner, Outcome};
use crate::schedule::ScheduleSpec;
use crate::topology::QueueSpec;
use async_trait::async_trait;
use stagehand_log::debug;

/// Result of a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// Added to the broker under this job id
    Enqueued(JobId),
    /// Repeatable job registered under this schedule id
    Scheduled(String),
    /// Ran inline
    Ran(Outcome),
}

impl Dispatched {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Dispatched::Enqueued(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, Dispatched::Ran(_))
    }
}

/// Executes dispatched calls.
///
/// Chosen once per topology: [`InlineExecutor`] for tests that run jobs
/// automatically, [`BrokerExecutor`] everywhere else.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Hand over a one-off job resolved to `queue`.
    async fn enqueue(
        &self,
        queue: &QueueSpec,
        envelope: JobEnvelope,
        options: EnqueueOptions,
    ) -> QueueResult<Dispatched>;

    /// Hand over a repeatable job resolved to `queue`.
    async fn schedule(&self, queue: &QueueSpec, schedule: ScheduleSpec) -> QueueResult<Dispatched>;

    fn is_inline(&self) -> bool;
}

/// Adds jobs to the broker.
#[derive(Debug, Default, Clone, Copy)]
pub struct BrokerExecutor;

#[async_trait]
impl JobExecutor for BrokerExecutor {
    async fn enqueue(
        &self,
        queue: &QueueSpec,
        envelope: JobEnvelope,
        options: EnqueueOptions,
    ) -> QueueResult<Dispatched> {
        let id = queue.queue().add(&envelope, &options).await?;
        debug!(
            "Enqueued {}.{} as {} on '{}'",
            envelope.global_name(),
            envelope.method(),
            id,
            queue.wire_name
        );
        Ok(Dispatched::Enqueued(id))
    }

    async fn schedule(&self, queue: &QueueSpec, schedule: ScheduleSpec) -> QueueResult<Dispatched> {
        queue.queue().upsert_schedule(&schedule).await?;
        Ok(Dispatched::Scheduled(schedule.id))
    }

    fn is_inline(&self) -> bool {
        false
    }
}

/// Runs jobs in-process, in the caller's task.
///
/// Each call gets a synthetic job on the `TestQueue` queue. Errors from the
/// target method come back to the caller.
#[derive(Debug, Clone)]
pub struct InlineExecutor {
    runner: JobRunner,
}

impl InlineExecutor {
    pub fn new(runner: JobRunner) -> Self {
        Self { runner }
    }

    async fn run(&self, envelope: JobEnvelope) -> QueueResult<Dispatched> {
        let job = Job::synthetic(envelope);
        let outcome = self.runner.execute(&job).await?;
        Ok(Dispatched::Ran(outcome))
    }
}

#[async_trait]
impl JobExecutor for InlineExecutor {
    async fn enqueue(
        &self,
        _queue: &QueueSpec,
        envelope: JobEnvelope,
        _options: EnqueueOptions,
    ) -> QueueResult<Dispatched> {
        self.run(envelope).await
    }

    /// Runs the scheduled method once.
    async fn schedule(&self, _queue: &QueueSpec, schedule: ScheduleSpec) -> QueueResult<Dispatched> {
        self.run(schedule.envelope).await
    }

    fn is_inline(&self) -> bool {
        true
    }
}
