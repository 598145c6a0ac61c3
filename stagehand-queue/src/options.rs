//! Per-call job options and their broker encoding.

use crate::priority::Priority;
use serde::{Deserialize, Serialize};

/// Where a job goes.
///
/// A job targets exactly one of: the default queue, a named workstream
/// (whose name doubles as group id), or a named queue with an optional
/// group id.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Routing {
    #[default]
    Default,
    Workstream {
        name: String,
    },
    Queue {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<String>,
    },
}

impl Routing {
    /// Group id the broker should serialize this job under, if any.
    pub fn group_id(&self) -> Option<&str> {
        match self {
            Routing::Default => None,
            Routing::Workstream { name } => Some(name),
            Routing::Queue { group_id, .. } => group_id.as_deref(),
        }
    }
}

/// Priority and routing for a backgrounded call.
///
/// Services and models usually return one of these from their
/// `job_config`, so every call they background shares it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub routing: Routing,
}

impl JobConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Route to the named workstream.
    pub fn with_workstream(mut self, name: impl Into<String>) -> Self {
        self.routing = Routing::Workstream { name: name.into() };
        self
    }

    /// Route to the named queue.
    pub fn with_queue(mut self, name: impl Into<String>) -> Self {
        self.routing = Routing::Queue {
            name: name.into(),
            group_id: None,
        };
        self
    }

    /// Route to the named queue, grouped under `group_id`.
    pub fn with_queue_group(mut self, name: impl Into<String>, group_id: impl Into<String>) -> Self {
        self.routing = Routing::Queue {
            name: name.into(),
            group_id: Some(group_id.into()),
        };
        self
    }
}

/// Options for one dispatch call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JobOptions {
    pub config: JobConfig,
    /// Run no sooner than this many seconds from now. Zero means immediately.
    pub delay_seconds: Option<u64>,
    /// Explicit job id; the broker ignores a second job with the same id.
    pub job_id: Option<String>,
}

impl JobOptions {
    pub fn new(config: JobConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn with_delay_seconds(mut self, seconds: u64) -> Self {
        self.delay_seconds = Some(seconds);
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Apply a [`Delay`], including its job id when set.
    pub fn with_delay(mut self, delay: &Delay) -> Self {
        self.delay_seconds = Some(delay.to_seconds());
        if let Some(job_id) = &delay.job_id {
            self.job_id = Some(job_id.clone());
        }
        self
    }
}

/// A delay expressed in mixed units.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Delay {
    pub seconds: u64,
    pub minutes: u64,
    pub hours: u64,
    pub days: u64,
    pub job_id: Option<String>,
}

impl Delay {
    pub fn seconds(seconds: u64) -> Self {
        Self {
            seconds,
            ..Default::default()
        }
    }

    pub fn minutes(minutes: u64) -> Self {
        Self {
            minutes,
            ..Default::default()
        }
    }

    pub fn hours(hours: u64) -> Self {
        Self {
            hours,
            ..Default::default()
        }
    }

    pub fn days(days: u64) -> Self {
        Self {
            days,
            ..Default::default()
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Total delay in seconds, saturating at `u64::MAX`.
    pub fn to_seconds(&self) -> u64 {
        self.seconds
            .saturating_add(self.minutes.saturating_mul(60))
            .saturating_add(self.hours.saturating_mul(3600))
            .saturating_add(self.days.saturating_mul(86_400))
    }
}

/// Group placement sent to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupOptions {
    pub id: String,
    pub priority: u8,
}

/// Repeat placement for scheduled jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatOptions {
    pub pattern: String,
}

/// Options passed to the broker with each job.
///
/// Priority travels either as the top-level `priority` or inside `group`,
/// never both.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueOptions {
    /// Delay in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatOptions>,
}

impl EnqueueOptions {
    /// Broker options for a one-off job.
    pub fn for_job(
        priority: Priority,
        group_id: Option<&str>,
        delay_seconds: Option<u64>,
        job_id: Option<String>,
    ) -> Self {
        let delay = delay_seconds.filter(|s| *s > 0).map(|s| s.saturating_mul(1000));
        let broker_priority = priority.broker_priority();

        match group_id {
            Some(id) => Self {
                delay,
                job_id,
                priority: None,
                group: Some(GroupOptions {
                    id: id.to_string(),
                    priority: broker_priority,
                }),
                repeat: None,
            },
            None => Self {
                delay,
                job_id,
                priority: Some(broker_priority),
                group: None,
                repeat: None,
            },
        }
    }

    /// Broker options for a repeatable job.
    pub fn for_schedule(
        priority: Priority,
        group_id: Option<&str>,
        schedule_id: &str,
        pattern: &str,
    ) -> Self {
        Self {
            repeat: Some(RepeatOptions {
                pattern: pattern.to_string(),
            }),
            ..Self::for_job(priority, group_id, None, Some(schedule_id.to_string()))
        }
    }

    /// Effective broker priority, wherever it travels.
    pub fn effective_priority(&self) -> u8 {
        self.group
            .as_ref()
            .map(|g| g.priority)
            .or(self.priority)
            .unwrap_or_else(|| Priority::Default.broker_priority())
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay.unwrap_or(0)
    }
}
