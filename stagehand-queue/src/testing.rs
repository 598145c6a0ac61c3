//! Helpers for tests that run background jobs by hand.
//!
//! With [`TestInvocation::Manual`](crate::config::TestInvocation::Manual),
//! backgrounded calls are enqueued like in production. These helpers work
//! the queues off in-process so a test can assert on the results:
//!
//! ```
//! use stagehand_queue::prelude::*;
//! use stagehand_queue::backend::memory::MemoryBroker;
//! use stagehand_queue::testing;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> QueueResult<()> {
//! let broker = MemoryBroker::new();
//! let config = WorkersConfig::new("my_app", SimpleOptions::new(broker.connection("queue")))
//!     .with_env(RuntimeEnv::test())
//!     .with_test_invocation(TestInvocation::Manual);
//! let registry = Registry::new().service("services/Ping", |s| {
//!     s.method("ping", |_args, _job| async { anyhow::Ok(()) })
//! });
//! let background = Background::new(config, registry);
//!
//! testing::clean(&background).await?;
//! background
//!     .static_method("Ping", "ping", "services/Ping", vec![], &JobOptions::default())
//!     .await?;
//!
//! let summary = testing::work(&background).await?;
//! assert_eq!(summary.completed, 1);
//! # Ok(())
//! # }
//! ```

use crate::background::Background;
use crate::broker::CleanState;
use crate::error::{QueueError, QueueResult};
use crate::job::Job;
use crate::naming;
use crate::topology::QueueSpec;
use stagehand_log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;

/// Lease token used by the test helpers.
pub const TEST_LEASE_TOKEN: &str = "stagehand-test-worker";

const CLEAN_LIMIT: usize = 10_000;

/// Jobs worked off by [`work`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkSummary {
    pub completed: usize,
    pub failed: usize,
}

impl WorkSummary {
    pub fn total(&self) -> usize {
        self.completed + self.failed
    }
}

/// Work off every ready job in every queue, round robin, until all queues
/// are empty.
///
/// A failing job is marked failed and counted; it does not stop the run.
pub async fn work(background: &Background) -> QueueResult<WorkSummary> {
    let queues = background.queues().await?;
    work_queues(background, &queues).await
}

/// Like [`work`], limited to the queue with logical name `name`.
///
/// Matches the queue's logical name as well as its parallel-test-safe and
/// hash-tagged wire names.
pub async fn work_queue(background: &Background, name: &str) -> QueueResult<WorkSummary> {
    let safe = naming::parallel_test_safe_queue_name(name, &background.config().env);
    let tagged = format!("{{{}}}", safe);

    let queues: Vec<Arc<QueueSpec>> = background
        .queues()
        .await?
        .into_iter()
        .filter(|queue| queue.name == name || queue.wire_name == safe || queue.wire_name == tagged)
        .collect();
    work_queues(background, &queues).await
}

async fn work_queues(background: &Background, queues: &[Arc<QueueSpec>]) -> QueueResult<WorkSummary> {
    let mut summary = WorkSummary::default();

    loop {
        let mut worked = false;
        for queue in queues {
            if let Some(job) = queue.queue().lease_next(TEST_LEASE_TOKEN).await? {
                worked = true;
                if process(background, queue, job).await? {
                    summary.completed += 1;
                } else {
                    summary.failed += 1;
                }
            }
        }
        if !worked {
            break;
        }
    }

    debug!(
        "Worked off {} jobs ({} failed)",
        summary.total(),
        summary.failed
    );
    Ok(summary)
}

/// Run a leased job and settle it. Returns whether it completed.
async fn process(background: &Background, queue: &QueueSpec, job: Job) -> QueueResult<bool> {
    match background.runner().execute(&job).await {
        Ok(_) => {
            queue.queue().ack(&job, TEST_LEASE_TOKEN).await?;
            Ok(true)
        }
        Err(e) => {
            warn!("Test job {} failed: {}", job.id, e);
            queue.queue().fail(&job, TEST_LEASE_TOKEN, &e.to_string()).await?;
            Ok(false)
        }
    }
}

/// Run delayed and scheduled jobs now, without waiting for their time.
///
/// Delayed jobs stay in the queue. `queue` limits the run to one queue,
/// matched by logical or wire name; `global_name` to jobs of one class.
/// Errors from the jobs are returned to the caller. Returns how many jobs
/// ran.
pub async fn work_scheduled(
    background: &Background,
    queue: Option<&str>,
    global_name: Option<&str>,
) -> QueueResult<usize> {
    let all = background.queues().await?;
    let queues: Vec<&Arc<QueueSpec>> = match queue {
        Some(name) => {
            let matching: Vec<&Arc<QueueSpec>> = all
                .iter()
                .filter(|q| q.name == name || q.wire_name == name)
                .collect();
            if matching.is_empty() {
                return Err(QueueError::QueueNotFound {
                    name: name.to_string(),
                    available: all.iter().map(|q| q.wire_name.clone()).collect(),
                });
            }
            matching
        }
        None => all.iter().collect(),
    };

    let wanted = |job: &Job| global_name.is_none_or(|name| job.envelope().global_name() == name);

    let mut ran = 0;
    for queue in queues {
        let mut jobs = queue.queue().delayed().await?;
        for schedule in queue.queue().schedules().await? {
            jobs.push(Job::new(
                queue.wire_name.clone(),
                schedule.envelope,
                schedule.options,
                1,
            ));
        }

        for job in jobs.iter().filter(|job| wanted(job)) {
            background.runner().execute(job).await?;
            ran += 1;
        }
    }

    Ok(ran)
}

/// Empty every queue: waiting and delayed jobs, finished jobs and
/// schedules.
pub async fn clean(background: &Background) -> QueueResult<()> {
    for queue in background.queues().await? {
        let broker_queue = queue.queue();
        broker_queue.drain().await?;
        broker_queue
            .clean(Duration::ZERO, CLEAN_LIMIT, CleanState::Completed)
            .await?;
        broker_queue
            .clean(Duration::ZERO, CLEAN_LIMIT, CleanState::Failed)
            .await?;
        broker_queue.remove_schedules().await?;
    }
    Ok(())
}

/// Queue name made unique per parallel test pool; see
/// [`naming::parallel_test_safe_queue_name`].
pub fn parallel_test_safe_queue_name(background: &Background, name: &str) -> String {
    naming::parallel_test_safe_queue_name(name, &background.config().env)
}
