//! Workers configuration.
//!
//! A [`WorkersConfig`] names the application, picks one of two background
//! styles and says how tests run jobs:
//!
//! - [`SimpleOptions`]: one default workstream plus named workstreams, each a
//!   queue with its own workers. Named workstreams double as group ids, so
//!   jobs in a workstream can be rate limited together.
//! - [`NativeOptions`]: queues and workers declared directly, for setups that
//!   need per-queue broker options or worker groups that do not match queue
//!   names.
//!
//! # Examples
//!
//! ```
//! use stagehand_queue::backend::memory::MemoryBroker;
//! use stagehand_queue::config::*;
//! use std::time::Duration;
//!
//! let broker = MemoryBroker::new();
//!
//! let config = WorkersConfig::new(
//!     "billing_api",
//!     SimpleOptions::new(broker.connection("queue"))
//!         .with_worker_connection(broker.connection("worker"))
//!         .with_default_workstream(2, 5)
//!         .with_named_workstream(
//!             WorkstreamOptions::new("snazzy")
//!                 .with_workers(1, 10)
//!                 .with_rate_limit(RateLimit::new(100, Duration::from_secs(1))),
//!         ),
//! )
//! .with_test_invocation(TestInvocation::Manual);
//!
//! assert_eq!(config.default_queue_name(), "BillingApiBackgroundJobQueue");
//! ```

use crate::broker::{ConnectionRef, QueueDefaults};
use crate::naming;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// How test runs execute backgrounded calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestInvocation {
    /// Run every call inline, without the broker.
    #[default]
    Automatic,
    /// Enqueue like production; tests work jobs off with
    /// [`testing::work`](crate::testing::work).
    Manual,
}

/// Facts about the running process that change dispatch behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeEnv {
    /// Running under tests
    pub is_test: bool,
    /// Use the broker even when tests would run jobs inline
    pub really_test_queue: bool,
    /// Parallel test pool this process belongs to
    pub test_pool_id: Option<u32>,
}

impl RuntimeEnv {
    /// Read the environment.
    ///
    /// - `STAGEHAND_ENV` (or `APP_ENV`) equal to `test` marks a test run
    /// - `REALLY_TEST_BACKGROUND_QUEUE` truthy forces the broker in tests
    /// - `TEST_POOL_ID` is the parallel test pool id
    pub fn from_env() -> Self {
        let env_name = std::env::var("STAGEHAND_ENV")
            .or_else(|_| std::env::var("APP_ENV"))
            .unwrap_or_default();

        Self {
            is_test: env_name.eq_ignore_ascii_case("test"),
            really_test_queue: std::env::var("REALLY_TEST_BACKGROUND_QUEUE")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false),
            test_pool_id: std::env::var("TEST_POOL_ID")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
        }
    }

    /// A non-test process.
    pub fn production() -> Self {
        Self::default()
    }

    /// A test process outside any parallel pool.
    pub fn test() -> Self {
        Self {
            is_test: true,
            ..Self::default()
        }
    }

    pub fn with_really_test_queue(mut self, really: bool) -> Self {
        self.really_test_queue = really;
        self
    }

    pub fn with_test_pool_id(mut self, pool: u32) -> Self {
        self.test_pool_id = Some(pool);
        self
    }

    /// Whether calls run inline instead of being enqueued.
    pub fn runs_inline(&self, invocation: TestInvocation) -> bool {
        self.is_test && invocation == TestInvocation::Automatic && !self.really_test_queue
    }
}

/// At most `max` jobs per `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max: u32,
    #[serde(with = "millis")]
    pub duration: Duration,
}

impl RateLimit {
    pub fn new(max: u32, duration: Duration) -> Self {
        Self { max, duration }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Worker group: jobs sharing a group id are serialized by the broker and
/// may be rate limited together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<RateLimit>,
}

impl GroupConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: RateLimit) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Worker count and concurrency of a workstream. Unset values mean 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkstreamSizing {
    pub worker_count: Option<usize>,
    pub concurrency: Option<usize>,
}

impl WorkstreamSizing {
    pub fn worker_count(&self) -> usize {
        self.worker_count.unwrap_or(1)
    }

    /// Zero counts as unset.
    pub fn concurrency(&self) -> usize {
        self.concurrency.filter(|c| *c > 0).unwrap_or(1)
    }
}

/// A named workstream.
#[derive(Clone)]
pub struct WorkstreamOptions {
    pub name: String,
    pub sizing: WorkstreamSizing,
    pub rate_limit: Option<RateLimit>,
    /// Enqueue through this connection instead of the default one
    pub queue_connection: Option<ConnectionRef>,
    /// Lease through this connection instead of the default one
    pub worker_connection: Option<ConnectionRef>,
}

impl WorkstreamOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sizing: WorkstreamSizing::default(),
            rate_limit: None,
            queue_connection: None,
            worker_connection: None,
        }
    }

    pub fn with_workers(mut self, worker_count: usize, concurrency: usize) -> Self {
        self.sizing = WorkstreamSizing {
            worker_count: Some(worker_count),
            concurrency: Some(concurrency),
        };
        self
    }

    pub fn with_rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    pub fn with_queue_connection(mut self, conn: ConnectionRef) -> Self {
        self.queue_connection = Some(conn);
        self
    }

    pub fn with_worker_connection(mut self, conn: ConnectionRef) -> Self {
        self.worker_connection = Some(conn);
        self
    }
}

/// Queues being migrated to other connections.
///
/// Same shape as [`SimpleOptions`] minus its own transitional section. The
/// queues keep their names so workers drain whatever is left on the old
/// connection while new jobs go to the new one.
#[derive(Clone)]
pub struct TransitionalOptions {
    pub default_queue_connection: ConnectionRef,
    pub default_worker_connection: Option<ConnectionRef>,
    pub default_workstream: WorkstreamSizing,
    pub named_workstreams: Vec<WorkstreamOptions>,
}

impl TransitionalOptions {
    pub fn new(default_queue_connection: ConnectionRef) -> Self {
        Self {
            default_queue_connection,
            default_worker_connection: None,
            default_workstream: WorkstreamSizing::default(),
            named_workstreams: Vec::new(),
        }
    }

    pub fn with_worker_connection(mut self, conn: ConnectionRef) -> Self {
        self.default_worker_connection = Some(conn);
        self
    }

    pub fn with_default_workstream(mut self, worker_count: usize, concurrency: usize) -> Self {
        self.default_workstream = WorkstreamSizing {
            worker_count: Some(worker_count),
            concurrency: Some(concurrency),
        };
        self
    }

    pub fn with_named_workstream(mut self, workstream: WorkstreamOptions) -> Self {
        self.named_workstreams.push(workstream);
        self
    }
}

/// Workstream-style configuration.
#[derive(Clone)]
pub struct SimpleOptions {
    pub default_queue_connection: ConnectionRef,
    /// Required only when workers are activated
    pub default_worker_connection: Option<ConnectionRef>,
    pub default_workstream: WorkstreamSizing,
    pub named_workstreams: Vec<WorkstreamOptions>,
    pub transitional: Option<TransitionalOptions>,
    /// Broker options shared by every queue
    pub queue_defaults: QueueDefaults,
}

impl SimpleOptions {
    pub fn new(default_queue_connection: ConnectionRef) -> Self {
        Self {
            default_queue_connection,
            default_worker_connection: None,
            default_workstream: WorkstreamSizing::default(),
            named_workstreams: Vec::new(),
            transitional: None,
            queue_defaults: QueueDefaults::default(),
        }
    }

    pub fn with_worker_connection(mut self, conn: ConnectionRef) -> Self {
        self.default_worker_connection = Some(conn);
        self
    }

    pub fn with_default_workstream(mut self, worker_count: usize, concurrency: usize) -> Self {
        self.default_workstream = WorkstreamSizing {
            worker_count: Some(worker_count),
            concurrency: Some(concurrency),
        };
        self
    }

    pub fn with_named_workstream(mut self, workstream: WorkstreamOptions) -> Self {
        self.named_workstreams.push(workstream);
        self
    }

    pub fn with_transitional(mut self, transitional: TransitionalOptions) -> Self {
        self.transitional = Some(transitional);
        self
    }

    pub fn with_queue_defaults(mut self, defaults: QueueDefaults) -> Self {
        self.queue_defaults = defaults;
        self
    }
}

/// Per-queue settings in [`NativeOptions`].
#[derive(Clone, Default)]
pub struct NativeQueueOptions {
    pub queue_connection: Option<ConnectionRef>,
    pub worker_connection: Option<ConnectionRef>,
    /// Replaces the shared queue defaults for this queue
    pub defaults: Option<QueueDefaults>,
}

impl NativeQueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue_connection(mut self, conn: ConnectionRef) -> Self {
        self.queue_connection = Some(conn);
        self
    }

    pub fn with_worker_connection(mut self, conn: ConnectionRef) -> Self {
        self.worker_connection = Some(conn);
        self
    }

    pub fn with_defaults(mut self, defaults: QueueDefaults) -> Self {
        self.defaults = Some(defaults);
        self
    }
}

/// Worker settings in [`NativeOptions`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeWorkerOptions {
    /// Workers to create; unset means 1
    pub worker_count: Option<usize>,
    /// Concurrent jobs per worker; unset means 1
    pub concurrency: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupConfig>,
}

impl NativeWorkerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, worker_count: usize, concurrency: usize) -> Self {
        self.worker_count = Some(worker_count);
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_group(mut self, group: GroupConfig) -> Self {
        self.group = Some(group);
        self
    }
}

/// Queue-style configuration.
#[derive(Clone, Default)]
pub struct NativeOptions {
    pub default_queue_connection: Option<ConnectionRef>,
    pub default_worker_connection: Option<ConnectionRef>,
    /// Overrides for the default queue; its connections win over the two above
    pub default_queue_options: NativeQueueOptions,
    /// Named queues in declaration order
    pub named_queues: Vec<(String, NativeQueueOptions)>,
    pub default_worker_options: NativeWorkerOptions,
    /// Workers on the default queue; unset means 1
    pub default_worker_count: Option<usize>,
    /// Workers per named queue; a named queue without an entry gets none
    pub named_queue_workers: HashMap<String, NativeWorkerOptions>,
    /// Broker options shared by every queue
    pub queue_defaults: QueueDefaults,
}

impl NativeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue_connection(mut self, conn: ConnectionRef) -> Self {
        self.default_queue_connection = Some(conn);
        self
    }

    pub fn with_worker_connection(mut self, conn: ConnectionRef) -> Self {
        self.default_worker_connection = Some(conn);
        self
    }

    pub fn with_default_queue_options(mut self, options: NativeQueueOptions) -> Self {
        self.default_queue_options = options;
        self
    }

    pub fn with_named_queue(mut self, name: impl Into<String>, options: NativeQueueOptions) -> Self {
        self.named_queues.push((name.into(), options));
        self
    }

    pub fn with_default_workers(mut self, count: usize, options: NativeWorkerOptions) -> Self {
        self.default_worker_count = Some(count);
        self.default_worker_options = options;
        self
    }

    pub fn with_named_queue_workers(
        mut self,
        queue: impl Into<String>,
        options: NativeWorkerOptions,
    ) -> Self {
        self.named_queue_workers.insert(queue.into(), options);
        self
    }

    pub fn with_queue_defaults(mut self, defaults: QueueDefaults) -> Self {
        self.queue_defaults = defaults;
        self
    }
}

/// Background style.
#[derive(Clone)]
pub enum BackgroundOptions {
    Simple(SimpleOptions),
    Native(NativeOptions),
}

impl From<SimpleOptions> for BackgroundOptions {
    fn from(options: SimpleOptions) -> Self {
        BackgroundOptions::Simple(options)
    }
}

impl From<NativeOptions> for BackgroundOptions {
    fn from(options: NativeOptions) -> Self {
        BackgroundOptions::Native(options)
    }
}

/// Everything needed to build the queue topology.
#[derive(Clone)]
pub struct WorkersConfig {
    pub app_name: String,
    pub background: BackgroundOptions,
    pub test_invocation: TestInvocation,
    pub env: RuntimeEnv,
}

impl WorkersConfig {
    /// Configuration for `app_name`, reading the runtime environment from
    /// the process.
    pub fn new(app_name: impl Into<String>, background: impl Into<BackgroundOptions>) -> Self {
        Self {
            app_name: app_name.into(),
            background: background.into(),
            test_invocation: TestInvocation::default(),
            env: RuntimeEnv::from_env(),
        }
    }

    pub fn with_test_invocation(mut self, invocation: TestInvocation) -> Self {
        self.test_invocation = invocation;
        self
    }

    pub fn with_env(mut self, env: RuntimeEnv) -> Self {
        self.env = env;
        self
    }

    /// Logical name of the default queue.
    pub fn default_queue_name(&self) -> String {
        naming::default_queue_name(&self.app_name)
    }

    /// Whether calls run inline instead of being enqueued.
    pub fn runs_inline(&self) -> bool {
        self.env.runs_inline(self.test_invocation)
    }
}
