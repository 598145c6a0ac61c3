//! In-process broker.
//!
//! A [`MemoryBroker`] plays the part of the broker server: every connection
//! made from it sees the same queues, the way a queue connection and a worker
//! connection both see the same Redis. It also records every `add` so tests
//! can assert on the exact options a job was enqueued with.

use crate::broker::{BrokerConnection, BrokerQueue, CleanState, QueueDefaults};
use crate::envelope::JobEnvelope;
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobId, JobState};
use crate::options::EnqueueOptions;
use crate::schedule::ScheduleSpec;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use stagehand_log::warn;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A job as it was handed to [`BrokerQueue::add`].
#[derive(Debug, Clone, PartialEq)]
pub struct AddedJob {
    pub queue: String,
    pub envelope: JobEnvelope,
    pub options: EnqueueOptions,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, Job>,
    order: HashMap<JobId, u64>,
    next_seq: u64,
    schedules: BTreeMap<String, (ScheduleSpec, Option<DateTime<Utc>>)>,
}

impl QueueState {
    fn insert(&mut self, job: Job) {
        self.next_seq += 1;
        self.order.insert(job.id.clone(), self.next_seq);
        self.jobs.insert(job.id.clone(), job);
    }

    fn materialize_due_schedules(&mut self, queue: &str, defaults: &QueueDefaults, now: DateTime<Utc>) {
        let mut due = Vec::new();
        for (id, (spec, next_run)) in self.schedules.iter_mut() {
            let Some(run_at) = *next_run else { continue };
            if run_at > now {
                continue;
            }
            *next_run = spec.cron().ok().and_then(|cron| cron.next_after(now));

            let mut options = spec.options.clone();
            options.job_id = Some(format!("repeat:{}:{}", id, run_at.timestamp_millis()));
            options.repeat = None;
            due.push(Job::new(queue, spec.envelope.clone(), options, defaults.attempts));
        }

        for job in due {
            if !self.jobs.contains_key(&job.id) {
                self.insert(job);
            }
        }
    }

    fn release_stalled(&mut self, queue: &str, now: DateTime<Utc>, timeout: chrono::Duration) {
        for job in self.jobs.values_mut() {
            if job.lease_expired(now, timeout) {
                warn!("Lease on job '{}' in '{}' expired, returning it to waiting", job.id, queue);
                job.release_stalled();
            }
        }
    }

    fn next_ready(&self, now: DateTime<Utc>) -> Option<JobId> {
        self.jobs
            .values()
            .filter(|job| {
                matches!(job.state, JobState::Waiting | JobState::Delayed) && job.is_ready(now)
            })
            .min_by_key(|job| {
                (
                    job.options.effective_priority(),
                    self.order.get(&job.id).copied().unwrap_or(u64::MAX),
                )
            })
            .map(|job| job.id.clone())
    }
}

#[derive(Default)]
struct Store {
    queues: Mutex<HashMap<String, QueueState>>,
    added: Mutex<Vec<AddedJob>>,
}

/// Shared in-process broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    store: Arc<Store>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A standalone connection.
    pub fn connection(&self, name: impl Into<String>) -> Arc<MemoryConnection> {
        Arc::new(MemoryConnection {
            name: name.into(),
            cluster: false,
            store: self.store.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A connection that reports itself as clustered.
    pub fn cluster_connection(&self, name: impl Into<String>) -> Arc<MemoryConnection> {
        Arc::new(MemoryConnection {
            name: name.into(),
            cluster: true,
            store: self.store.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Every job added so far, in order.
    pub fn added(&self) -> Vec<AddedJob> {
        self.store.added.lock().clone()
    }

    /// Jobs added to the queue with `wire_name`.
    pub fn added_to(&self, wire_name: &str) -> Vec<AddedJob> {
        self.store
            .added
            .lock()
            .iter()
            .filter(|added| added.queue == wire_name)
            .cloned()
            .collect()
    }

    /// Current job records of a queue, in insertion order.
    pub fn jobs(&self, wire_name: &str) -> Vec<Job> {
        let queues = self.store.queues.lock();
        let Some(state) = queues.get(wire_name) else {
            return Vec::new();
        };

        let mut jobs: Vec<Job> = state.jobs.values().cloned().collect();
        jobs.sort_by_key(|job| state.order.get(&job.id).copied().unwrap_or(u64::MAX));
        jobs
    }

    /// Jobs of a queue in `state`.
    pub fn jobs_in_state(&self, wire_name: &str, state: JobState) -> Vec<Job> {
        self.jobs(wire_name)
            .into_iter()
            .filter(|job| job.state == state)
            .collect()
    }

    /// Repeatable jobs registered on a queue.
    pub fn schedules(&self, wire_name: &str) -> Vec<ScheduleSpec> {
        self.store
            .queues
            .lock()
            .get(wire_name)
            .map(|state| state.schedules.values().map(|(spec, _)| spec.clone()).collect())
            .unwrap_or_default()
    }

    /// Names of every queue that has been written to.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.store.queues.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    name: String,
    cluster: bool,
    store: Arc<Store>,
    closed: Arc<AtomicBool>,
}

impl MemoryConnection {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_cluster(&self) -> bool {
        self.cluster
    }

    fn open_queue(&self, wire_name: &str, defaults: &QueueDefaults) -> Arc<dyn BrokerQueue> {
        Arc::new(MemoryQueue {
            name: wire_name.to_string(),
            defaults: defaults.clone(),
            store: self.store.clone(),
            connection_closed: self.closed.clone(),
            closed: AtomicBool::new(false),
        })
    }

    async fn close(&self) -> QueueResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Queue handle on a [`MemoryConnection`].
pub struct MemoryQueue {
    name: String,
    defaults: QueueDefaults,
    store: Arc<Store>,
    connection_closed: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl MemoryQueue {
    fn ensure_open(&self) -> QueueResult<()> {
        if self.closed.load(Ordering::SeqCst) || self.connection_closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed(self.name.clone()));
        }
        Ok(())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut QueueState) -> T) -> QueueResult<T> {
        self.ensure_open()?;
        let mut queues = self.store.queues.lock();
        let state = queues.entry(self.name.clone()).or_default();
        Ok(f(state))
    }

    fn leased_job<'a>(state: &'a mut QueueState, job: &Job, token: &str) -> QueueResult<&'a mut Job> {
        match state.jobs.get_mut(&job.id) {
            Some(stored)
                if stored.state == JobState::Active && stored.lock_token.as_deref() == Some(token) =>
            {
                Ok(stored)
            }
            _ => Err(QueueError::LeaseLost(job.id.clone())),
        }
    }
}

#[async_trait]
impl BrokerQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, envelope: &JobEnvelope, options: &EnqueueOptions) -> QueueResult<JobId> {
        let job = Job::new(&self.name, envelope.clone(), options.clone(), self.defaults.attempts);
        let id = self.with_state(|state| {
            if !state.jobs.contains_key(&job.id) {
                state.insert(job.clone());
            }
            job.id.clone()
        })?;

        self.store.added.lock().push(AddedJob {
            queue: self.name.clone(),
            envelope: envelope.clone(),
            options: options.clone(),
        });

        Ok(id)
    }

    async fn upsert_schedule(&self, schedule: &ScheduleSpec) -> QueueResult<()> {
        let next_run = schedule.cron()?.next();
        self.with_state(|state| {
            state
                .schedules
                .insert(schedule.id.clone(), (schedule.clone(), next_run));
        })
    }

    async fn lease_next(&self, token: &str) -> QueueResult<Option<Job>> {
        let now = Utc::now();
        self.with_state(|state| {
            state.release_stalled(&self.name, now, self.defaults.lease_timeout());
            state.materialize_due_schedules(&self.name, &self.defaults, now);

            let id = state.next_ready(now)?;
            let job = state.jobs.get_mut(&id)?;
            job.start_processing(token);
            Some(job.clone())
        })
    }

    async fn ack(&self, job: &Job, token: &str) -> QueueResult<()> {
        self.with_state(|state| -> QueueResult<()> {
            Self::leased_job(state, job, token)?.complete();
            Ok(())
        })?
    }

    async fn fail(&self, job: &Job, token: &str, error: &str) -> QueueResult<()> {
        let backoff = self.defaults.backoff;
        self.with_state(|state| -> QueueResult<()> {
            Self::leased_job(state, job, token)?.fail(error, backoff.as_ref());
            Ok(())
        })?
    }

    async fn delayed(&self) -> QueueResult<Vec<Job>> {
        self.with_state(|state| {
            let mut jobs: Vec<Job> = state
                .jobs
                .values()
                .filter(|job| job.state == JobState::Delayed)
                .cloned()
                .collect();
            jobs.sort_by_key(|job| job.run_at);
            jobs
        })
    }

    async fn schedules(&self) -> QueueResult<Vec<ScheduleSpec>> {
        self.with_state(|state| state.schedules.values().map(|(spec, _)| spec.clone()).collect())
    }

    async fn drain(&self) -> QueueResult<()> {
        self.with_state(|state| {
            let pending: Vec<JobId> = state
                .jobs
                .values()
                .filter(|job| matches!(job.state, JobState::Waiting | JobState::Delayed))
                .map(|job| job.id.clone())
                .collect();
            for id in pending {
                state.jobs.remove(&id);
                state.order.remove(&id);
            }
        })
    }

    async fn clean(&self, grace: Duration, limit: usize, clean_state: CleanState) -> QueueResult<usize> {
        let target = match clean_state {
            CleanState::Completed => JobState::Completed,
            CleanState::Failed => JobState::Failed,
        };
        let cutoff = Utc::now()
            - chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero());

        self.with_state(|state| {
            let expired: Vec<JobId> = state
                .jobs
                .values()
                .filter(|job| job.state == target && job.finished_at.is_some_and(|at| at <= cutoff))
                .map(|job| job.id.clone())
                .take(limit)
                .collect();
            for id in &expired {
                state.jobs.remove(id);
                state.order.remove(id);
            }
            expired.len()
        })
    }

    async fn remove_schedules(&self) -> QueueResult<usize> {
        self.with_state(|state| {
            let removed = state.schedules.len();
            state.schedules.clear();
            removed
        })
    }

    async fn close(&self) -> QueueResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::Priority;
    use serde_json::json;

    fn envelope(n: i64) -> JobEnvelope {
        JobEnvelope::for_static("services/Counter", "bump", vec![json!(n)])
    }

    fn open(broker: &MemoryBroker, name: &str) -> Arc<dyn BrokerQueue> {
        broker.connection("queue").open_queue(name, &QueueDefaults::default())
    }

    #[tokio::test]
    async fn test_connections_share_queues() {
        let broker = MemoryBroker::new();
        let producer = broker.connection("queue").open_queue("Jobs", &QueueDefaults::default());
        let consumer = broker.connection("worker").open_queue("Jobs", &QueueDefaults::default());

        producer
            .add(&envelope(1), &EnqueueOptions::default())
            .await
            .unwrap();

        let job = consumer.lease_next("w1").await.unwrap().unwrap();
        assert_eq!(job.data, envelope(1));
        consumer.ack(&job, "w1").await.unwrap();
        assert_eq!(broker.jobs_in_state("Jobs", JobState::Completed).len(), 1);
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let broker = MemoryBroker::new();
        let queue = open(&broker, "Jobs");

        let last = EnqueueOptions::for_job(Priority::Last, None, None, None);
        let urgent = EnqueueOptions::for_job(Priority::Urgent, Some("g"), None, None);
        let normal = EnqueueOptions::for_job(Priority::Default, None, None, None);

        queue.add(&envelope(1), &last).await.unwrap();
        queue.add(&envelope(2), &normal).await.unwrap();
        queue.add(&envelope(3), &urgent).await.unwrap();
        queue.add(&envelope(4), &normal).await.unwrap();

        let mut order = Vec::new();
        while let Some(job) = queue.lease_next("w").await.unwrap() {
            order.push(job.data.args()[0].as_i64().unwrap());
            queue.ack(&job, "w").await.unwrap();
        }
        assert_eq!(order, vec![3, 2, 4, 1]);
    }

    #[tokio::test]
    async fn test_duplicate_job_id_is_ignored() {
        let broker = MemoryBroker::new();
        let queue = open(&broker, "Jobs");
        let options = EnqueueOptions::for_job(Priority::Default, None, None, Some("once".into()));

        assert_eq!(queue.add(&envelope(1), &options).await.unwrap(), "once");
        assert_eq!(queue.add(&envelope(2), &options).await.unwrap(), "once");

        let jobs = broker.jobs("Jobs");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].data, envelope(1));
    }

    #[tokio::test]
    async fn test_delayed_jobs_wait() {
        let broker = MemoryBroker::new();
        let queue = open(&broker, "Jobs");
        let options = EnqueueOptions::for_job(Priority::Default, None, Some(3600), None);

        queue.add(&envelope(1), &options).await.unwrap();

        assert!(queue.lease_next("w").await.unwrap().is_none());
        assert_eq!(queue.delayed().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fail_without_attempts_left_marks_failed() {
        let broker = MemoryBroker::new();
        let queue = open(&broker, "Jobs");
        queue.add(&envelope(1), &EnqueueOptions::default()).await.unwrap();

        let job = queue.lease_next("w").await.unwrap().unwrap();
        queue.fail(&job, "w", "boom").await.unwrap();

        let failed = broker.jobs_in_state("Jobs", JobState::Failed);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].failed_reason.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_fail_with_attempts_left_requeues() {
        let broker = MemoryBroker::new();
        let queue = broker
            .connection("queue")
            .open_queue("Jobs", &QueueDefaults::default().with_attempts(2));
        queue.add(&envelope(1), &EnqueueOptions::default()).await.unwrap();

        let job = queue.lease_next("w").await.unwrap().unwrap();
        queue.fail(&job, "w", "flaky").await.unwrap();

        let retried = queue.lease_next("w").await.unwrap().unwrap();
        assert_eq!(retried.id, job.id);
        assert_eq!(retried.attempts_made, 1);
    }

    #[tokio::test]
    async fn test_ack_requires_lease_token() {
        let broker = MemoryBroker::new();
        let queue = open(&broker, "Jobs");
        queue.add(&envelope(1), &EnqueueOptions::default()).await.unwrap();

        let job = queue.lease_next("w1").await.unwrap().unwrap();
        let err = queue.ack(&job, "w2").await.unwrap_err();
        assert!(matches!(err, QueueError::LeaseLost(_)));
    }

    #[tokio::test]
    async fn test_upsert_schedule_replaces_by_id() {
        let broker = MemoryBroker::new();
        let queue = open(&broker, "Jobs");
        let spec = |pattern: &str| ScheduleSpec {
            id: "Reports:nightly".into(),
            pattern: pattern.into(),
            envelope: envelope(1),
            options: EnqueueOptions::for_schedule(Priority::Default, None, "Reports:nightly", pattern),
        };

        queue.upsert_schedule(&spec("0 3 * * *")).await.unwrap();
        queue.upsert_schedule(&spec("0 4 * * *")).await.unwrap();

        let schedules = broker.schedules("Jobs");
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].pattern, "0 4 * * *");
        assert_eq!(queue.remove_schedules().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_drain_and_clean() {
        let broker = MemoryBroker::new();
        let queue = open(&broker, "Jobs");
        queue.add(&envelope(1), &EnqueueOptions::default()).await.unwrap();
        let job = queue.lease_next("w").await.unwrap().unwrap();
        queue.ack(&job, "w").await.unwrap();
        queue.add(&envelope(2), &EnqueueOptions::default()).await.unwrap();

        queue.drain().await.unwrap();
        assert_eq!(broker.jobs("Jobs").len(), 1);

        let removed = queue
            .clean(Duration::ZERO, 10_000, CleanState::Completed)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(broker.jobs("Jobs").is_empty());
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_commands() {
        let broker = MemoryBroker::new();
        let conn = broker.connection("queue");
        let queue = conn.open_queue("Jobs", &QueueDefaults::default());

        conn.close().await.unwrap();

        let err = queue.add(&envelope(1), &EnqueueOptions::default()).await.unwrap_err();
        assert!(matches!(err, QueueError::Closed(name) if name == "Jobs"));
    }

    #[tokio::test]
    async fn test_added_log_records_options() {
        let broker = MemoryBroker::new();
        let queue = open(&broker, "Jobs");
        let options = EnqueueOptions::for_job(Priority::Urgent, Some("snazzy"), None, None);

        queue.add(&envelope(1), &options).await.unwrap();

        let added = broker.added_to("Jobs");
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].options, options);
        assert!(broker.added_to("Other").is_empty());
    }

    #[tokio::test]
    async fn test_expired_lease_returns_job_to_waiting() {
        let broker = MemoryBroker::new();
        let defaults = QueueDefaults::default().with_lease_timeout(Duration::ZERO);
        let queue = broker.connection("worker").open_queue("Jobs", &defaults);
        queue.add(&envelope(1), &EnqueueOptions::default()).await.unwrap();

        let first = queue.lease_next("crashed").await.unwrap().unwrap();
        let second = queue.lease_next("alive").await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempts_made, 0);

        assert!(matches!(
            queue.ack(&first, "crashed").await,
            Err(QueueError::LeaseLost(_))
        ));
        queue.ack(&second, "alive").await.unwrap();
        assert_eq!(broker.jobs_in_state("Jobs", JobState::Completed).len(), 1);
    }

    #[tokio::test]
    async fn test_live_lease_is_kept() {
        let broker = MemoryBroker::new();
        let queue = open(&broker, "Jobs");
        queue.add(&envelope(1), &EnqueueOptions::default()).await.unwrap();

        let job = queue.lease_next("w1").await.unwrap().unwrap();
        assert!(queue.lease_next("w2").await.unwrap().is_none());
        queue.ack(&job, "w1").await.unwrap();
    }
}
