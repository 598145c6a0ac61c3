//! Dispatch: turning a method call into a job.
//!
//! Every dispatch connects enqueue-only, resolves the target queue from the
//! call's routing, then hands the envelope to the topology's executor. Queue
//! resolution happens before the executor runs, so an unknown workstream or
//! queue name is an error even when jobs run inline.

use crate::background::{Background, ConnectOptions};
use crate::envelope::{JobEnvelope, RecordId};
use crate::error::QueueResult;
use crate::executor::Dispatched;
use crate::options::{EnqueueOptions, JobConfig, JobOptions};
use crate::schedule::{schedule_id, CronExpression, ScheduleSpec};
use serde_json::Value;
use stagehand_log::debug;

impl Background {
    /// Background a static method.
    ///
    /// `class_name` is used for logging and schedule ids; `global_name` is
    /// the name the class is registered under.
    pub async fn static_method(
        &self,
        class_name: &str,
        method: &str,
        global_name: &str,
        args: Vec<Value>,
        options: &JobOptions,
    ) -> QueueResult<Dispatched> {
        debug!("Backgrounding {}.{} ({})", class_name, method, global_name);
        let envelope = JobEnvelope::for_static(global_name, method, args);
        self.dispatch(envelope, options).await
    }

    /// Background a method on a stored record, identified by its class's
    /// global name and primary key.
    pub async fn record_method(
        &self,
        global_name: &str,
        record_id: impl Into<RecordId>,
        method: &str,
        args: Vec<Value>,
        options: &JobOptions,
    ) -> QueueResult<Dispatched> {
        let record_id = record_id.into();
        debug!("Backgrounding {}.{} for record {}", global_name, method, record_id);
        let envelope = JobEnvelope::for_record(global_name, record_id, method, args);
        self.dispatch(envelope, options).await
    }

    /// Register (or replace) a repeatable static method call.
    ///
    /// The schedule id is `"{class_name}:{method}"`, so scheduling the same
    /// method again with another pattern replaces the earlier schedule.
    pub async fn scheduled_method(
        &self,
        class_name: &str,
        pattern: &str,
        method: &str,
        global_name: &str,
        args: Vec<Value>,
        config: &JobConfig,
    ) -> QueueResult<Dispatched> {
        CronExpression::parse(pattern)?;

        let topology = self.connect(ConnectOptions::enqueue_only()).await?;
        let queue = topology.resolve_queue(&config.routing)?;

        let id = schedule_id(class_name, method);
        let schedule = ScheduleSpec {
            options: EnqueueOptions::for_schedule(
                config.priority,
                config.routing.group_id(),
                &id,
                pattern,
            ),
            id,
            pattern: pattern.to_string(),
            envelope: JobEnvelope::for_static(global_name, method, args),
        };

        debug!(
            "Scheduling {} with '{}' on '{}'",
            schedule.id, pattern, queue.wire_name
        );
        topology.executor().schedule(queue, schedule).await
    }

    async fn dispatch(&self, envelope: JobEnvelope, options: &JobOptions) -> QueueResult<Dispatched> {
        let topology = self.connect(ConnectOptions::enqueue_only()).await?;
        let queue = topology.resolve_queue(&options.config.routing)?;

        let enqueue_options = EnqueueOptions::for_job(
            options.config.priority,
            options.config.routing.group_id(),
            options.delay_seconds,
            options.job_id.clone(),
        );

        topology.executor().enqueue(queue, envelope, enqueue_options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBroker;
    use crate::config::{RuntimeEnv, SimpleOptions, WorkersConfig, WorkstreamOptions};
    use crate::error::QueueError;
    use crate::priority::Priority;
    use crate::registry::Registry;
    use serde_json::json;

    fn background(broker: &MemoryBroker, env: RuntimeEnv) -> Background {
        let options = SimpleOptions::new(broker.connection("queue"))
            .with_named_workstream(WorkstreamOptions::new("snazzy"));
        let config = WorkersConfig::new("my_app", options).with_env(env);
        let registry = Registry::new().service("services/Reports", |s| {
            s.method("build", |_args, _job| async { anyhow::Ok(()) })
        });
        Background::new(config, registry)
    }

    #[tokio::test]
    async fn test_static_method_enqueues_on_default_queue() {
        let broker = MemoryBroker::new();
        let background = background(&broker, RuntimeEnv::production());

        let dispatched = background
            .static_method("Reports", "build", "services/Reports", vec![json!(7)], &JobOptions::default())
            .await
            .unwrap();

        assert!(dispatched.job_id().is_some());
        let added = broker.added_to("MyAppBackgroundJobQueue");
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].envelope.args(), &[json!(7)]);
        assert_eq!(
            serde_json::to_value(&added[0].options).unwrap(),
            json!({"priority": 2})
        );
    }

    #[tokio::test]
    async fn test_workstream_priority_goes_in_group() {
        let broker = MemoryBroker::new();
        let background = background(&broker, RuntimeEnv::production());
        let options = JobOptions::new(
            JobConfig::new()
                .with_workstream("snazzy")
                .with_priority(Priority::Urgent),
        );

        background
            .static_method("Reports", "build", "services/Reports", vec![], &options)
            .await
            .unwrap();

        let added = broker.added_to("snazzy");
        assert_eq!(
            serde_json::to_value(&added[0].options).unwrap(),
            json!({"group": {"id": "snazzy", "priority": 1}})
        );
    }

    #[tokio::test]
    async fn test_unknown_workstream_fails_even_inline() {
        let broker = MemoryBroker::new();
        let background = background(&broker, RuntimeEnv::test());
        let options = JobOptions::new(JobConfig::new().with_workstream("nope"));

        let err = background
            .static_method("Reports", "build", "services/Reports", vec![], &options)
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::NoQueueForWorkstream(name) if name == "nope"));
    }

    #[tokio::test]
    async fn test_invalid_cron_pattern_is_rejected_before_connecting() {
        let broker = MemoryBroker::new();
        let background = background(&broker, RuntimeEnv::production());

        let err = background
            .scheduled_method("Reports", "whenever", "build", "services/Reports", vec![], &JobConfig::new())
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::InvalidCronPattern(_)));
        assert!(!background.is_connected());
    }

    #[tokio::test]
    async fn test_scheduled_method_registers_schedule() {
        let broker = MemoryBroker::new();
        let background = background(&broker, RuntimeEnv::production());

        let dispatched = background
            .scheduled_method("Reports", "0 3 * * *", "build", "services/Reports", vec![], &JobConfig::new())
            .await
            .unwrap();

        assert_eq!(dispatched, Dispatched::Scheduled("Reports:build".into()));
        let schedules = broker.schedules("MyAppBackgroundJobQueue");
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].pattern, "0 3 * * *");
    }
}
