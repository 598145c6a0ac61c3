//! Redis broker backend.
//!
//! Key layout per queue, all under `stagehand:{wire_name}` so a hash-tagged
//! wire name keeps every key of a queue in one cluster slot:
//!
//! | key | type | contents |
//! |---|---|---|
//! | `job:{id}` | string | job JSON; finished jobs expire after the retention time |
//! | `seq` | counter | FIFO sequence |
//! | `waiting` | zset | ready jobs, scored by priority then sequence |
//! | `delayed` | zset | delayed jobs, scored by run-at millis |
//! | `active` | zset | leased jobs, scored by lease millis |
//! | `completed` / `failed` | zset | finished jobs, scored by finish millis |
//! | `schedules` | hash | schedule id to schedule JSON |
//! | `schedule-next` | zset | schedule id scored by next run millis |

use crate::broker::{BrokerConnection, BrokerQueue, CleanState, QueueDefaults};
use crate::envelope::JobEnvelope;
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobId, JobState};
use crate::options::EnqueueOptions;
use crate::schedule::ScheduleSpec;
use async_trait::async_trait;
use chrono::Utc;
use stagehand_log::{debug, info, warn};
use parking_lot::RwLock;
use stagehand_redis::{RedisConnection, RedisError, RedisHandle};
use std::sync::Arc;
use std::time::Duration;

const KEY_PREFIX: &str = "stagehand";

// Keeps priority classes apart in the waiting zset while leaving room for
// sequence numbers well inside f64's exact integer range.
const PRIORITY_STRIDE: f64 = 1e12;

// Moves the head of `waiting` into `active`, scored by lease time, in one step.
// KEYS: waiting, active. ARGV: lease millis.
const LEASE_SCRIPT: &str = r#"
local popped = redis.call('ZPOPMIN', KEYS[1], 1)
if #popped == 0 then
    return false
end
redis.call('ZADD', KEYS[2], ARGV[1], popped[1])
return popped[1]
"#;

/// Expiry for a stored job record: only finished jobs expire.
fn record_ttl(job: &Job, defaults: &QueueDefaults) -> Option<u64> {
    job.is_finished().then(|| defaults.retention_secs.max(1))
}

/// Active-set score below which a lease is considered stalled.
fn stalled_cutoff(now_ms: i64, defaults: &QueueDefaults) -> i64 {
    let timeout_ms = i64::try_from(defaults.lease_timeout_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
    now_ms.saturating_sub(timeout_ms)
}

#[async_trait]
impl BrokerConnection for RedisConnection {
    fn name(&self) -> &str {
        RedisConnection::name(self)
    }

    fn is_cluster(&self) -> bool {
        RedisConnection::is_cluster(self)
    }

    fn open_queue(&self, wire_name: &str, defaults: &QueueDefaults) -> Arc<dyn BrokerQueue> {
        Arc::new(RedisQueue::new(self, wire_name, defaults.clone()))
    }

    async fn close(&self) -> QueueResult<()> {
        RedisConnection::close(self).await?;
        Ok(())
    }
}

/// A queue stored in Redis.
///
/// Holds its own clone of the connection's multiplexed handle; closing the
/// queue drops that clone.
pub struct RedisQueue {
    handle: RwLock<Option<RedisHandle>>,
    command_timeout: Duration,
    name: String,
    prefix: String,
    defaults: QueueDefaults,
}

impl RedisQueue {
    fn new(conn: &RedisConnection, wire_name: &str, defaults: QueueDefaults) -> Self {
        debug!("Opening Redis queue '{}' on connection '{}'", wire_name, conn.name());
        Self {
            handle: RwLock::new(conn.handle().ok()),
            command_timeout: conn.config().command_timeout,
            name: wire_name.to_string(),
            prefix: format!("{}:{}", KEY_PREFIX, wire_name),
            defaults,
        }
    }

    /// Build Redis key.
    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn job_key(&self, id: &str) -> String {
        self.key(&format!("job:{}", id))
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> QueueResult<T> {
        let mut handle = self
            .handle
            .read()
            .clone()
            .ok_or_else(|| QueueError::Closed(self.name.clone()))?;

        tokio::time::timeout(self.command_timeout, handle.query(cmd))
            .await
            .map_err(|_| QueueError::Connection(RedisError::Timeout))?
            .map_err(QueueError::from)
    }

    async fn get_job(&self, id: &str) -> QueueResult<Option<Job>> {
        let json: Option<String> = self.query(redis::cmd("GET").arg(self.job_key(id))).await?;
        json.map(|json| serde_json::from_str(&json).map_err(QueueError::from))
            .transpose()
    }

    /// Store a job record. A plain `SET` clears any earlier expiry.
    async fn save_job(&self, job: &Job) -> QueueResult<()> {
        let json = serde_json::to_string(job).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.job_key(&job.id)).arg(json);
        if let Some(ttl) = record_ttl(job, &self.defaults) {
            cmd.arg("EX").arg(ttl);
        }
        let _: () = self.query(&cmd).await?;
        Ok(())
    }

    async fn zadd(&self, suffix: &str, member: &str, score: f64) -> QueueResult<()> {
        let _: i64 = self
            .query(redis::cmd("ZADD").arg(self.key(suffix)).arg(score).arg(member))
            .await?;
        Ok(())
    }

    async fn zrem(&self, suffix: &str, member: &str) -> QueueResult<bool> {
        let removed: i64 = self
            .query(redis::cmd("ZREM").arg(self.key(suffix)).arg(member))
            .await?;
        Ok(removed > 0)
    }

    async fn zrange_all(&self, suffix: &str) -> QueueResult<Vec<String>> {
        self.query(redis::cmd("ZRANGE").arg(self.key(suffix)).arg(0).arg(-1))
            .await
    }

    async fn due(&self, suffix: &str, now_ms: i64) -> QueueResult<Vec<String>> {
        self.query(
            redis::cmd("ZRANGEBYSCORE")
                .arg(self.key(suffix))
                .arg("-inf")
                .arg(now_ms),
        )
        .await
    }

    /// Put a job where its state says it belongs.
    async fn place(&self, job: &Job) -> QueueResult<()> {
        match job.state {
            JobState::Delayed => {
                self.zadd("delayed", &job.id, job.run_at.timestamp_millis() as f64)
                    .await
            }
            _ => {
                let seq: i64 = self.query(redis::cmd("INCR").arg(self.key("seq"))).await?;
                let score = job.options.effective_priority() as f64 * PRIORITY_STRIDE + seq as f64;
                self.zadd("waiting", &job.id, score).await
            }
        }
    }

    /// Return jobs whose lease outlived the lease timeout to waiting.
    async fn release_stalled(&self, now_ms: i64) -> QueueResult<()> {
        for id in self.due("active", stalled_cutoff(now_ms, &self.defaults)).await? {
            // ZREM decides which worker releases the job
            if !self.zrem("active", &id).await? {
                continue;
            }
            match self.get_job(&id).await? {
                Some(job) if job.is_finished() => {}
                Some(mut job) => {
                    warn!("Lease on job '{}' in '{}' expired, returning it to waiting", id, self.name);
                    job.release_stalled();
                    self.save_job(&job).await?;
                    self.place(&job).await?;
                }
                None => warn!("Stalled job '{}' on '{}' has no record", id, self.name),
            }
        }
        Ok(())
    }

    /// Release stalled leases, move due delayed jobs to waiting and
    /// materialize due schedules.
    async fn promote_due(&self) -> QueueResult<()> {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();

        self.release_stalled(now_ms).await?;

        for id in self.due("delayed", now_ms).await? {
            // ZREM decides which worker promotes the job
            if !self.zrem("delayed", &id).await? {
                continue;
            }
            if let Some(mut job) = self.get_job(&id).await? {
                job.state = JobState::Waiting;
                self.save_job(&job).await?;
                self.place(&job).await?;
            }
        }

        for schedule_id in self.due("schedule-next", now_ms).await? {
            let json: Option<String> = self
                .query(redis::cmd("HGET").arg(self.key("schedules")).arg(&schedule_id))
                .await?;
            let Some(json) = json else {
                self.zrem("schedule-next", &schedule_id).await?;
                continue;
            };
            let run_at: Option<f64> = self
                .query(redis::cmd("ZSCORE").arg(self.key("schedule-next")).arg(&schedule_id))
                .await?;
            if !self.zrem("schedule-next", &schedule_id).await? {
                continue;
            }

            let spec: ScheduleSpec = serde_json::from_str(&json)?;
            let mut options = spec.options.clone();
            options.job_id = Some(format!(
                "repeat:{}:{}",
                schedule_id,
                run_at.map(|ms| ms as i64).unwrap_or(now_ms)
            ));
            options.repeat = None;
            self.add(&spec.envelope, &options).await?;

            match spec.cron()?.next_after(now) {
                Some(next) => {
                    self.zadd("schedule-next", &schedule_id, next.timestamp_millis() as f64)
                        .await?
                }
                None => warn!("Schedule '{}' has no future runs", schedule_id),
            }
        }

        Ok(())
    }

    async fn leased(&self, job: &Job, token: &str) -> QueueResult<Job> {
        match self.get_job(&job.id).await? {
            Some(stored)
                if stored.state == JobState::Active && stored.lock_token.as_deref() == Some(token) =>
            {
                Ok(stored)
            }
            _ => Err(QueueError::LeaseLost(job.id.clone())),
        }
    }

    async fn delete_jobs(&self, suffix: &str, ids: &[String]) -> QueueResult<()> {
        for id in ids {
            let _: i64 = self.query(redis::cmd("DEL").arg(self.job_key(id))).await?;
            self.zrem(suffix, id).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerQueue for RedisQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, envelope: &JobEnvelope, options: &EnqueueOptions) -> QueueResult<JobId> {
        let job = Job::new(&self.name, envelope.clone(), options.clone(), self.defaults.attempts);
        let json = serde_json::to_string(&job).map_err(|e| QueueError::Serialization(e.to_string()))?;

        // SET NX makes an explicit job id idempotent
        let created: Option<String> = self
            .query(
                redis::cmd("SET")
                    .arg(self.job_key(&job.id))
                    .arg(json)
                    .arg("NX"),
            )
            .await?;

        if created.is_none() {
            debug!("Job '{}' already exists on '{}'", job.id, self.name);
            return Ok(job.id);
        }

        self.place(&job).await?;
        debug!("Added {} '{}' to '{}'", job.name, job.id, self.name);
        Ok(job.id)
    }

    async fn upsert_schedule(&self, schedule: &ScheduleSpec) -> QueueResult<()> {
        let next = schedule.cron()?.next().ok_or_else(|| {
            QueueError::InvalidCronPattern(format!("{}: no future runs", schedule.pattern))
        })?;
        let json = serde_json::to_string(schedule).map_err(|e| QueueError::Serialization(e.to_string()))?;

        let _: i64 = self
            .query(
                redis::cmd("HSET")
                    .arg(self.key("schedules"))
                    .arg(&schedule.id)
                    .arg(json),
            )
            .await?;
        self.zadd("schedule-next", &schedule.id, next.timestamp_millis() as f64)
            .await?;

        info!("Scheduled '{}' on '{}' with pattern '{}'", schedule.id, self.name, schedule.pattern);
        Ok(())
    }

    async fn lease_next(&self, token: &str) -> QueueResult<Option<Job>> {
        self.promote_due().await?;

        let leased: Option<String> = self
            .query(
                redis::cmd("EVAL")
                    .arg(LEASE_SCRIPT)
                    .arg(2)
                    .arg(self.key("waiting"))
                    .arg(self.key("active"))
                    .arg(Utc::now().timestamp_millis()),
            )
            .await?;
        let Some(id) = leased else {
            return Ok(None);
        };

        // A failure from here on leaves the id in `active`, where
        // release_stalled picks it up after the lease timeout.
        let Some(mut job) = self.get_job(&id).await? else {
            warn!("Job '{}' on '{}' has no record, dropping it", id, self.name);
            self.zrem("active", &id).await?;
            return Ok(None);
        };

        job.start_processing(token);
        self.save_job(&job).await?;

        Ok(Some(job))
    }

    async fn ack(&self, job: &Job, token: &str) -> QueueResult<()> {
        let mut stored = self.leased(job, token).await?;
        stored.complete();
        self.save_job(&stored).await?;
        self.zrem("active", &stored.id).await?;
        self.zadd("completed", &stored.id, Utc::now().timestamp_millis() as f64)
            .await
    }

    async fn fail(&self, job: &Job, token: &str, error: &str) -> QueueResult<()> {
        let mut stored = self.leased(job, token).await?;
        let retry = stored.fail(error, self.defaults.backoff.as_ref());
        self.save_job(&stored).await?;
        self.zrem("active", &stored.id).await?;

        if retry {
            self.place(&stored).await
        } else {
            self.zadd("failed", &stored.id, Utc::now().timestamp_millis() as f64)
                .await
        }
    }

    async fn delayed(&self) -> QueueResult<Vec<Job>> {
        let mut jobs = Vec::new();
        for id in self.zrange_all("delayed").await? {
            if let Some(job) = self.get_job(&id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn schedules(&self) -> QueueResult<Vec<ScheduleSpec>> {
        let values: Vec<String> = self.query(redis::cmd("HVALS").arg(self.key("schedules"))).await?;
        values
            .iter()
            .map(|json| serde_json::from_str(json).map_err(QueueError::from))
            .collect()
    }

    async fn drain(&self) -> QueueResult<()> {
        for suffix in ["waiting", "delayed"] {
            let ids = self.zrange_all(suffix).await?;
            self.delete_jobs(suffix, &ids).await?;
        }
        Ok(())
    }

    async fn clean(&self, grace: Duration, limit: usize, state: CleanState) -> QueueResult<usize> {
        let suffix = match state {
            CleanState::Completed => "completed",
            CleanState::Failed => "failed",
        };
        let cutoff = Utc::now().timestamp_millis() - grace.as_millis() as i64;

        let ids: Vec<String> = self
            .query(
                redis::cmd("ZRANGEBYSCORE")
                    .arg(self.key(suffix))
                    .arg("-inf")
                    .arg(cutoff)
                    .arg("LIMIT")
                    .arg(0)
                    .arg(limit),
            )
            .await?;

        self.delete_jobs(suffix, &ids).await?;
        Ok(ids.len())
    }

    async fn remove_schedules(&self) -> QueueResult<usize> {
        let removed: usize = self.query(redis::cmd("HLEN").arg(self.key("schedules"))).await?;
        let _: i64 = self
            .query(
                redis::cmd("DEL")
                    .arg(self.key("schedules"))
                    .arg(self.key("schedule-next")),
            )
            .await?;
        Ok(removed)
    }

    async fn close(&self) -> QueueResult<()> {
        if self.handle.write().take().is_some() {
            debug!("Closed Redis queue '{}'", self.name);
        }
        Ok(())
    }
}
