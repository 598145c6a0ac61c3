//! Workers that lease jobs from a queue and run them.

use crate::broker::BrokerQueue;
use crate::config::{GroupConfig, RateLimit};
use crate::error::{QueueError, QueueResult};
use crate::job::Job;
use crate::runner::{JobRunner, Outcome};
use stagehand_log::{debug, error, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Worker tuning shared by every worker of a topology.
///
/// Jobs run until the invoked method returns. A job that outlives the
/// broker's lease timeout is handed to another worker by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Sleep between polls of an empty queue
    pub poll_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// What a worker drains and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    /// Logical queue name
    pub queue_name: String,
    /// Broker queue name
    pub wire_name: String,
    /// Jobs leased at once
    pub concurrency: usize,
    pub group: Option<GroupConfig>,
}

/// Fixed-window limiter: at most `max` leases per window.
struct RateLimiter {
    limit: RateLimit,
    window_start: Instant,
    used: u32,
}

impl RateLimiter {
    fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            window_start: Instant::now(),
            used: 0,
        }
    }

    /// Take a slot, or return how long to wait for the next window.
    fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        if now.duration_since(self.window_start) >= self.limit.duration {
            self.window_start = now;
            self.used = 0;
        }

        if self.used < self.limit.max {
            self.used += 1;
            Ok(())
        } else {
            Err(self.limit.duration - now.duration_since(self.window_start))
        }
    }
}

/// Leases jobs from one queue through a worker connection.
///
/// A started worker runs `concurrency` lease loops. Each loop leases a job,
/// runs it and acks or fails it, sleeping for the poll interval when the
/// queue is empty. [`close`](Self::close) stops leasing and waits for the
/// jobs in flight.
pub struct Worker {
    spec: WorkerSpec,
    queue: Arc<dyn BrokerQueue>,
    runner: JobRunner,
    settings: WorkerSettings,
    token: String,
    limiter: Option<Arc<Mutex<RateLimiter>>>,
    running: Arc<AtomicBool>,
    stop: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    /// Create a stopped worker leasing from `queue`.
    pub fn new(
        spec: WorkerSpec,
        queue: Arc<dyn BrokerQueue>,
        runner: JobRunner,
        settings: WorkerSettings,
    ) -> Self {
        let limiter = spec
            .group
            .as_ref()
            .and_then(|group| group.limit)
            .filter(|limit| limit.max > 0)
            .map(|limit| Arc::new(Mutex::new(RateLimiter::new(limit))));
        let token = format!("{}:{}", spec.wire_name, Uuid::new_v4());
        let (stop, _) = watch::channel(false);

        Self {
            spec,
            queue,
            runner,
            settings,
            token,
            limiter,
            running: Arc::new(AtomicBool::new(false)),
            stop,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    /// Lease token this worker acks and fails with.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the lease loops.
    pub async fn start(&self) -> QueueResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(QueueError::WorkerAlreadyRunning);
        }
        self.stop.send_replace(false);

        info!(
            "Starting worker on '{}' with concurrency {}",
            self.spec.wire_name, self.spec.concurrency
        );

        let mut handles = self.handles.lock().await;
        for slot in 0..self.spec.concurrency.max(1) {
            let lease_loop = LeaseLoop {
                slot,
                wire_name: self.spec.wire_name.clone(),
                queue: self.queue.clone(),
                runner: self.runner.clone(),
                settings: self.settings,
                token: self.token.clone(),
                limiter: self.limiter.clone(),
                running: self.running.clone(),
                stop: self.stop.subscribe(),
            };
            handles.push(tokio::spawn(lease_loop.run()));
        }

        Ok(())
    }

    /// Stop leasing and wait for in-flight jobs to finish.
    pub async fn close(&self) -> QueueResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop.send_replace(true);

        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker task on '{}' ended abnormally: {}", self.spec.wire_name, e);
            }
        }

        info!("Worker on '{}' stopped", self.spec.wire_name);
        Ok(())
    }

    /// Release the worker's queue handle.
    pub async fn close_queue(&self) -> QueueResult<()> {
        self.queue.close().await
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop.send_replace(true);
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("spec", &self.spec)
            .field("running", &self.is_running())
            .finish()
    }
}

struct LeaseLoop {
    slot: usize,
    wire_name: String,
    queue: Arc<dyn BrokerQueue>,
    runner: JobRunner,
    settings: WorkerSettings,
    token: String,
    limiter: Option<Arc<Mutex<RateLimiter>>>,
    running: Arc<AtomicBool>,
    stop: watch::Receiver<bool>,
}

impl LeaseLoop {
    async fn run(mut self) {
        while self.running.load(Ordering::SeqCst) {
            if let Some(wait) = self.rate_limited().await {
                self.pause(wait).await;
                continue;
            }

            match self.queue.lease_next(&self.token).await {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => self.pause(self.settings.poll_interval).await,
                Err(e) => {
                    error!("[{}#{}] Error leasing job: {}", self.wire_name, self.slot, e);
                    self.pause(self.settings.poll_interval).await;
                }
            }
        }

        debug!("[{}#{}] Lease loop stopped", self.wire_name, self.slot);
    }

    async fn rate_limited(&self) -> Option<Duration> {
        let limiter = self.limiter.as_ref()?;
        limiter.lock().await.try_acquire(Instant::now()).err()
    }

    /// Sleep, waking early when the worker is closed.
    async fn pause(&mut self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.stop.changed() => {}
        }
    }

    async fn process(&self, job: Job) {
        debug!(
            "[{}#{}] Processing job {} ({})",
            self.wire_name, self.slot, job.id, job.name
        );

        let settled = match self.runner.execute(&job).await {
            Ok(outcome) => {
                if outcome != Outcome::Executed {
                    debug!("[{}#{}] Job {} skipped: {:?}", self.wire_name, self.slot, job.id, outcome);
                }
                self.queue.ack(&job, &self.token).await
            }
            Err(e) => {
                warn!("[{}#{}] Job {} failed: {}", self.wire_name, self.slot, job.id, e);
                self.queue.fail(&job, &self.token, &e.to_string()).await
            }
        };

        if let Err(e) = settled {
            error!(
                "[{}#{}] Failed to settle job {}: {}",
                self.wire_name, self.slot, job.id, e
            );
        }
    }
}
