//! Job execution.

use crate::envelope::Target;
use crate::error::{QueueError, QueueResult};
use crate::job::Job;
use crate::registry::{Args, ModelCall, Registry};
use stagehand_log::{debug, warn};
use std::sync::Arc;

/// What running a job did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The target method ran to completion.
    Executed,
    /// No class is registered under the job's global name; nothing ran.
    TargetMissing,
    /// The record no longer exists; nothing ran.
    RecordMissing,
}

/// Runs jobs against a [`Registry`].
///
/// A job whose class or record cannot be found is skipped, not failed: the
/// target went away after the job was enqueued and retrying will not bring
/// it back.
#[derive(Clone, Debug)]
pub struct JobRunner {
    registry: Arc<Registry>,
}

impl JobRunner {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run `job`.
    ///
    /// Errors returned by the target method come back as
    /// [`QueueError::Execution`] carrying the method's own error.
    pub async fn execute(&self, job: &Job) -> QueueResult<Outcome> {
        let envelope = job.envelope();
        let global_name = envelope.global_name();
        let method = envelope.method();

        let Some(class) = self.registry.lookup(global_name) else {
            warn!(
                "Skipping job {}: no class registered as '{}'",
                job.id, global_name
            );
            return Ok(Outcome::TargetMissing);
        };

        let args = Args::new(envelope.args().to_vec());

        match envelope.target() {
            Target::Static { .. } => {
                let invoke =
                    class
                        .static_method(method)
                        .ok_or_else(|| QueueError::UnknownMethod {
                            global_name: global_name.to_string(),
                            method: method.to_string(),
                        })?;

                debug!("Running {}.{} for job {}", global_name, method, job.id);
                invoke(args, job.clone())
                    .await
                    .map_err(QueueError::Execution)?;
                Ok(Outcome::Executed)
            }
            Target::ModelInstance { record_id, .. } => {
                if !class.is_model() {
                    return Err(QueueError::NotAModel(global_name.to_string()));
                }
                if !class.has_instance(method) {
                    return Err(QueueError::UnknownMethod {
                        global_name: global_name.to_string(),
                        method: method.to_string(),
                    });
                }

                debug!(
                    "Running {}#{} on record {} for job {}",
                    global_name, method, record_id, job.id
                );
                let call = class
                    .call_instance(record_id, method, args, job.clone())
                    .await
                    .ok_or_else(|| QueueError::NotAModel(global_name.to_string()))?
                    .map_err(QueueError::Execution)?;

                match call {
                    ModelCall::Invoked => Ok(Outcome::Executed),
                    ModelCall::RecordMissing => {
                        warn!(
                            "Skipping job {}: {} {} no longer exists",
                            job.id, global_name, record_id
                        );
                        Ok(Outcome::RecordMissing)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{JobEnvelope, RecordId};
    use parking_lot::Mutex;
    use serde_json::json;

    fn runner(log: Arc<Mutex<Vec<String>>>) -> JobRunner {
        let static_log = log.clone();
        let model_log = log;

        let registry = Registry::new()
            .service("services/Greeter", move |s| {
                s.method("greet", move |args, job| {
                    let log = static_log.clone();
                    async move {
                        let name: String = args.get(0)?;
                        log.lock().push(format!("hello {} from {}", name, job.queue));
                        anyhow::Ok(())
                    }
                })
                .method("explode", |_args, _job| async {
                    Err(anyhow::anyhow!("kaboom"))
                })
            })
            .model::<i64, _, _>(
                "Post",
                |id| async move {
                    Ok(match id {
                        RecordId::Int(id) if id < 100 => Some(id),
                        _ => None,
                    })
                },
                move |m| {
                    m.method("publish", move |post, _args, _job| {
                        let log = model_log.clone();
                        async move {
                            log.lock().push(format!("published {}", post));
                            Ok(())
                        }
                    })
                },
            );

        JobRunner::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn test_static_job_receives_args_and_job() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = runner(log.clone());
        let job = Job::synthetic(JobEnvelope::for_static(
            "services/Greeter",
            "greet",
            vec![json!("ada")],
        ));

        assert_eq!(runner.execute(&job).await.unwrap(), Outcome::Executed);
        assert_eq!(*log.lock(), vec!["hello ada from TestQueue"]);
    }

    #[tokio::test]
    async fn test_model_job_fetches_record() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = runner(log.clone());
        let job = Job::synthetic(JobEnvelope::for_record("Post", 7, "publish", vec![]));

        assert_eq!(runner.execute(&job).await.unwrap(), Outcome::Executed);
        assert_eq!(*log.lock(), vec!["published 7"]);
    }

    #[tokio::test]
    async fn test_missing_targets_are_skipped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = runner(log.clone());

        let gone = Job::synthetic(JobEnvelope::for_static("services/Gone", "run", vec![]));
        assert_eq!(runner.execute(&gone).await.unwrap(), Outcome::TargetMissing);

        let deleted = Job::synthetic(JobEnvelope::for_record("Post", 500, "publish", vec![]));
        assert_eq!(runner.execute(&deleted).await.unwrap(), Outcome::RecordMissing);

        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_method_errors_propagate() {
        let runner = runner(Arc::new(Mutex::new(Vec::new())));
        let job = Job::synthetic(JobEnvelope::for_static("services/Greeter", "explode", vec![]));

        let err = runner.execute(&job).await.unwrap_err();
        assert!(matches!(&err, QueueError::Execution(inner) if inner.to_string() == "kaboom"));
    }

    #[tokio::test]
    async fn test_unknown_method_and_non_model_are_errors() {
        let runner = runner(Arc::new(Mutex::new(Vec::new())));

        let unknown = Job::synthetic(JobEnvelope::for_static("services/Greeter", "wave", vec![]));
        assert!(matches!(
            runner.execute(&unknown).await,
            Err(QueueError::UnknownMethod { method, .. }) if method == "wave"
        ));

        let not_model = Job::synthetic(JobEnvelope::for_record("services/Greeter", 1, "greet", vec![]));
        assert!(matches!(
            runner.execute(&not_model).await,
            Err(QueueError::NotAModel(name)) if name == "services/Greeter"
        ));
    }
}
