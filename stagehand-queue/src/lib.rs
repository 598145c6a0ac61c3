//! Background jobs for Stagehand applications.
//!
//! Provides the dispatch layer between application code and a job broker:
//! - Queue topology built from simple (workstream) or native (queue) config
//! - Static, model-instance and scheduled (cron) method dispatch
//! - Priorities, delays and per-workstream groups on the wire
//! - Inline execution in tests, or manual work-off with [`testing`]
//! - Workers with graceful shutdown and cleanup hooks
//! - Redis and in-memory brokers
//! - TOML/JSON settings files
//!
//! ## Quick Start
//!
//! ```
//! use stagehand_queue::prelude::*;
//!
//! let config = JobConfig::new()
//!     .with_workstream("snazzy")
//!     .with_priority(Priority::Urgent);
//!
//! let options = JobOptions::new(config).with_delay(&Delay::minutes(5));
//! assert_eq!(options.delay_seconds, Some(300));
//! ```
//!
//! ## Connecting to Redis
//!
//! ```no_run
//! use stagehand_queue::prelude::*;
//! use stagehand_queue::settings::WorkersSettings;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> QueueResult<()> {
//!     let settings = WorkersSettings::load()?;
//!     let config = settings.connect().await?;
//!
//!     let registry = Registry::new().service("services/Invoices", |s| {
//!         s.method("sendReminders", |_args, _job| async { anyhow::Ok(()) })
//!     });
//!
//!     let background = Arc::new(Background::new(config, registry));
//!     background.work().await?.wait().await;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod background;
pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod job;
pub mod lifecycle;
pub mod naming;
pub mod options;
pub mod priority;
pub mod registry;
pub mod runner;
pub mod schedule;
pub mod service;
pub mod settings;
pub mod testing;
pub mod topology;
pub mod worker;

pub use background::{Background, ConnectOptions};
pub use broker::{BrokerConnection, BrokerQueue, CleanState, ConnectionRef, QueueDefaults};
pub use config::{
    GroupConfig, NativeOptions, NativeQueueOptions, NativeWorkerOptions, RateLimit, RuntimeEnv,
    SimpleOptions, TestInvocation, TransitionalOptions, WorkersConfig, WorkstreamOptions,
};
pub use envelope::{JobEnvelope, JobType, RecordId, Target};
pub use error::{QueueError, QueueResult};
pub use executor::Dispatched;
pub use job::{Backoff, Job, JobId, JobState};
pub use lifecycle::{HostEvent, ShutdownHook, ShutdownHooks, WorkHandle};
pub use options::{Delay, JobConfig, JobOptions, Routing};
pub use priority::Priority;
pub use registry::{Args, Registry};
pub use runner::{JobRunner, Outcome};
pub use schedule::{CronExpression, ScheduleSpec};
pub use service::{BackgroundModel, BackgroundedService};
pub use settings::WorkersSettings;
pub use topology::{QueueSpec, RoutingManifest, Topology};
pub use worker::{Worker, WorkerSettings};

#[doc(hidden)]
pub mod __private {
    pub use serde_json;
}

/// Re-export commonly used types
pub mod prelude {
    pub use crate::background::{Background, ConnectOptions};
    pub use crate::config::{
        NativeOptions, NativeQueueOptions, NativeWorkerOptions, RuntimeEnv, SimpleOptions,
        TestInvocation, TransitionalOptions, WorkersConfig, WorkstreamOptions,
    };
    pub use crate::envelope::RecordId;
    pub use crate::error::{QueueError, QueueResult};
    pub use crate::executor::Dispatched;
    pub use crate::job::Job;
    pub use crate::lifecycle::HostEvent;
    pub use crate::options::{Delay, JobConfig, JobOptions};
    pub use crate::priority::Priority;
    pub use crate::registry::{Args, Registry};
    pub use crate::runner::Outcome;
    pub use crate::service::{BackgroundModel, BackgroundedService};
}
