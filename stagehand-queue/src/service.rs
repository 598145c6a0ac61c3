//! Call-site traits for backgroundable services and models.
//!
//! Implementing [`BackgroundedService`] or [`BackgroundModel`] lets callers
//! background methods without repeating global names and job configs:
//!
//! ```
//! use stagehand_queue::prelude::*;
//! use stagehand_queue::args;
//!
//! struct Mailer;
//!
//! impl BackgroundedService for Mailer {
//!     const GLOBAL_NAME: &'static str = "services/Mailer";
//!
//!     fn job_config() -> JobConfig {
//!         JobConfig::new().with_priority(Priority::Urgent)
//!     }
//! }
//!
//! async fn welcome(background: &Background, email: &str) -> QueueResult<Dispatched> {
//!     background.background::<Mailer>("deliver", args![email, "welcome"]).await
//! }
//! ```

use crate::background::Background;
use crate::envelope::RecordId;
use crate::error::QueueResult;
use crate::executor::Dispatched;
use crate::options::{Delay, JobConfig, JobOptions};
use serde_json::Value;

/// A class whose static methods can be backgrounded.
pub trait BackgroundedService {
    /// Name the class is registered under in the
    /// [`Registry`](crate::registry::Registry).
    const GLOBAL_NAME: &'static str;

    /// Short class name used in logs and schedule ids: the last path segment
    /// of the global name.
    fn class_name() -> &'static str {
        Self::GLOBAL_NAME
            .rsplit('/')
            .next()
            .unwrap_or(Self::GLOBAL_NAME)
    }

    /// Priority and routing shared by every backgrounded call.
    fn job_config() -> JobConfig {
        JobConfig::default()
    }
}

/// A stored record whose instance methods can be backgrounded.
///
/// Only the global name and primary key travel with the job; the worker
/// fetches the record again through the registered finder.
pub trait BackgroundModel: Send + Sync {
    fn global_name(&self) -> &str;

    fn primary_key(&self) -> RecordId;

    fn job_config(&self) -> JobConfig {
        JobConfig::default()
    }
}

impl Background {
    /// Background an instance method of `record`.
    pub async fn model_instance_method(
        &self,
        record: &dyn BackgroundModel,
        method: &str,
        args: Vec<Value>,
        options: &JobOptions,
    ) -> QueueResult<Dispatched> {
        self.record_method(record.global_name(), record.primary_key(), method, args, options)
            .await
    }

    /// Background a static method of `S` with its job config.
    pub async fn background<S: BackgroundedService>(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> QueueResult<Dispatched> {
        let options = JobOptions::new(S::job_config());
        self.static_method(S::class_name(), method, S::GLOBAL_NAME, args, &options)
            .await
    }

    /// Background a static method of `S` to run after `delay`.
    pub async fn background_with_delay<S: BackgroundedService>(
        &self,
        delay: &Delay,
        method: &str,
        args: Vec<Value>,
    ) -> QueueResult<Dispatched> {
        let options = JobOptions::new(S::job_config()).with_delay(delay);
        self.static_method(S::class_name(), method, S::GLOBAL_NAME, args, &options)
            .await
    }

    /// Run a static method of `S` on the cron `pattern`.
    pub async fn schedule<S: BackgroundedService>(
        &self,
        pattern: &str,
        method: &str,
        args: Vec<Value>,
    ) -> QueueResult<Dispatched> {
        self.scheduled_method(
            S::class_name(),
            pattern,
            method,
            S::GLOBAL_NAME,
            args,
            &S::job_config(),
        )
        .await
    }

    /// Background an instance method of `record` with its job config.
    pub async fn background_model<M: BackgroundModel>(
        &self,
        record: &M,
        method: &str,
        args: Vec<Value>,
    ) -> QueueResult<Dispatched> {
        let options = JobOptions::new(record.job_config());
        self.model_instance_method(record, method, args, &options)
            .await
    }

    /// Background an instance method of `record` to run after `delay`.
    pub async fn background_model_with_delay<M: BackgroundModel>(
        &self,
        record: &M,
        delay: &Delay,
        method: &str,
        args: Vec<Value>,
    ) -> QueueResult<Dispatched> {
        let options = JobOptions::new(record.job_config()).with_delay(delay);
        self.model_instance_method(record, method, args, &options)
            .await
    }
}

/// Build a job argument vector, serializing each expression to JSON.
///
/// ```
/// use stagehand_queue::args;
///
/// let args = args![42, "hello", vec![1, 2]];
/// assert_eq!(args.len(), 3);
/// assert_eq!(args[1], "hello");
/// assert!(args![].is_empty());
/// ```
#[macro_export]
macro_rules! args {
    () => {
        ::std::vec::Vec::<$crate::__private::serde_json::Value>::new()
    };
    ($($arg:expr),+ $(,)?) => {
        ::std::vec![$($crate::__private::serde_json::json!($arg)),+]
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBroker;
    use crate::config::{RuntimeEnv, SimpleOptions, WorkersConfig, WorkstreamOptions};
    use crate::envelope::Target;
    use crate::priority::Priority;
    use crate::registry::Registry;
    use serde_json::json;

    struct Exporter;

    impl BackgroundedService for Exporter {
        const GLOBAL_NAME: &'static str = "services/reports/Exporter";

        fn job_config() -> JobConfig {
            JobConfig::new()
                .with_workstream("snazzy")
                .with_priority(Priority::NotUrgent)
        }
    }

    struct Invoice {
        id: i64,
    }

    impl BackgroundModel for Invoice {
        fn global_name(&self) -> &str {
            "Invoice"
        }

        fn primary_key(&self) -> RecordId {
            RecordId::from(self.id)
        }
    }

    fn background(broker: &MemoryBroker) -> Background {
        let options = SimpleOptions::new(broker.connection("queue"))
            .with_named_workstream(WorkstreamOptions::new("snazzy"));
        let config = WorkersConfig::new("my_app", options).with_env(RuntimeEnv::production());
        Background::new(config, Registry::new())
    }

    #[test]
    fn test_class_name_is_last_segment() {
        assert_eq!(Exporter::class_name(), "Exporter");
    }

    #[test]
    fn test_args_macro() {
        let name = String::from("q3");
        assert_eq!(args![1, name, true], vec![json!(1), json!("q3"), json!(true)]);
    }

    #[tokio::test]
    async fn test_background_uses_service_config() {
        let broker = MemoryBroker::new();
        let background = background(&broker);

        background
            .background_with_delay::<Exporter>(&Delay::minutes(2), "export", args!["csv"])
            .await
            .unwrap();

        let added = broker.added_to("snazzy");
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].envelope.global_name(), "services/reports/Exporter");
        assert_eq!(
            serde_json::to_value(&added[0].options).unwrap(),
            json!({"delay": 120000, "group": {"id": "snazzy", "priority": 3}})
        );
    }

    #[tokio::test]
    async fn test_schedule_uses_class_name_for_id() {
        let broker = MemoryBroker::new();
        let background = background(&broker);

        let dispatched = background
            .schedule::<Exporter>("*/5 * * * *", "export", args![])
            .await
            .unwrap();

        assert_eq!(dispatched, Dispatched::Scheduled("Exporter:export".into()));
        assert_eq!(broker.schedules("snazzy").len(), 1);
    }

    #[tokio::test]
    async fn test_background_model_sends_primary_key() {
        let broker = MemoryBroker::new();
        let background = background(&broker);

        background
            .background_model(&Invoice { id: 12 }, "remind", args![])
            .await
            .unwrap();

        let added = broker.added_to("MyAppBackgroundJobQueue");
        assert_eq!(
            added[0].envelope.target(),
            &Target::ModelInstance {
                global_name: "Invoice".into(),
                record_id: RecordId::from(12_i64),
            }
        );
    }
}
