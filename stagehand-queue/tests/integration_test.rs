//! Integration tests for stagehand-queue

use parking_lot::Mutex;
use serde_json::json;
use stagehand_queue::backend::memory::MemoryBroker;
use stagehand_queue::prelude::*;
use stagehand_queue::{args, testing, JobState, WorkerSettings};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

type Calls = Arc<Mutex<Vec<String>>>;

#[derive(Clone)]
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

struct Reports;

impl BackgroundedService for Reports {
    const GLOBAL_NAME: &'static str = "services/Reports";
}

/// Invoices 1..=9 exist; everything else was deleted.
fn registry(calls: Calls) -> Registry {
    let static_calls = calls.clone();
    let model_calls = calls;

    Registry::new()
        .service("services/Reports", move |s| {
            s.method("build", move |args, _job| {
                let calls = static_calls.clone();
                async move {
                    let label: String = args.get(0)?;
                    calls.lock().push(format!("build:{}", label));
                    anyhow::Ok(())
                }
            })
        })
        .model::<Invoice, _, _>(
            "Invoice",
            |id| async move {
                let id: i64 = id.to_string().parse()?;
                anyhow::Ok((1..=9).contains(&id).then_some(Invoice { id }))
            },
            move |m| {
                m.method("remind", move |invoice, _args, _job| {
                    let calls = model_calls.clone();
                    async move {
                        calls.lock().push(format!("remind:{}", invoice.id));
                        anyhow::Ok(())
                    }
                })
            },
        )
}

fn simple(broker: &MemoryBroker) -> SimpleOptions {
    SimpleOptions::new(broker.connection("queue"))
        .with_worker_connection(broker.connection("worker"))
        .with_named_workstream(WorkstreamOptions::new("snazzy"))
}

fn background(broker: &MemoryBroker, env: RuntimeEnv, invocation: TestInvocation) -> (Background, Calls) {
    let calls = Calls::default();
    let config = WorkersConfig::new("my_app", simple(broker))
        .with_env(env)
        .with_test_invocation(invocation);
    (Background::new(config, registry(calls.clone())), calls)
}

fn wire_options(broker: &MemoryBroker, queue: &str) -> Vec<serde_json::Value> {
    broker
        .added_to(queue)
        .iter()
        .map(|added| serde_json::to_value(&added.options).unwrap())
        .collect()
}

#[tokio::test]
async fn test_workstream_urgent_job_wire_options() {
    let broker = MemoryBroker::new();
    let (background, _) = background(&broker, RuntimeEnv::production(), TestInvocation::Automatic);
    let options = JobOptions::new(
        JobConfig::new()
            .with_workstream("snazzy")
            .with_priority(Priority::Urgent),
    );

    background
        .static_method("Reports", "build", "services/Reports", args!["q1"], &options)
        .await
        .unwrap();

    assert_eq!(
        wire_options(&broker, "snazzy"),
        vec![json!({"group": {"id": "snazzy", "priority": 1}})]
    );
}

#[tokio::test]
async fn test_delay_with_job_id_wire_options() {
    let broker = MemoryBroker::new();
    let (background, _) = background(&broker, RuntimeEnv::production(), TestInvocation::Automatic);
    let options = JobOptions::default().with_delay(&Delay::seconds(15).with_job_id("myjob"));

    let dispatched = background
        .static_method("Reports", "build", "services/Reports", args!["q1"], &options)
        .await
        .unwrap();

    assert_eq!(dispatched.job_id(), Some("myjob"));
    assert_eq!(
        wire_options(&broker, "MyAppBackgroundJobQueue"),
        vec![json!({"delay": 15000, "jobId": "myjob", "priority": 2})]
    );
}

#[tokio::test]
async fn test_unknown_workstream_fails_in_every_mode() {
    let modes = [
        (RuntimeEnv::production(), TestInvocation::Automatic),
        (RuntimeEnv::test(), TestInvocation::Automatic),
        (RuntimeEnv::test(), TestInvocation::Manual),
    ];

    for (env, invocation) in modes {
        let broker = MemoryBroker::new();
        let (background, calls) = background(&broker, env, invocation);
        let options = JobOptions::new(JobConfig::new().with_workstream("missing"));

        let err = background
            .static_method("Reports", "build", "services/Reports", args!["q1"], &options)
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::NoQueueForWorkstream(ref name) if name == "missing"));
        assert!(broker.added().is_empty());
        assert!(calls.lock().is_empty());
    }
}

#[tokio::test]
async fn test_inline_mode_runs_calls_immediately() {
    let broker = MemoryBroker::new();
    let (background, calls) = background(&broker, RuntimeEnv::test(), TestInvocation::Automatic);

    let ran = background
        .background::<Reports>("build", args!["now"])
        .await
        .unwrap();
    assert_eq!(ran, Dispatched::Ran(Outcome::Executed));

    let ran = background
        .background_model(&Invoice { id: 4 }, "remind", args![])
        .await
        .unwrap();
    assert_eq!(ran, Dispatched::Ran(Outcome::Executed));

    let ran = background
        .schedule::<Reports>("0 3 * * *", "build", args!["nightly"])
        .await
        .unwrap();
    assert!(ran.is_inline());

    assert_eq!(*calls.lock(), vec!["build:now", "remind:4", "build:nightly"]);
    assert!(broker.added().is_empty());
    assert!(broker.schedules("MyAppBackgroundJobQueue").is_empty());
}

#[tokio::test]
async fn test_inline_deleted_record_is_skipped() {
    let broker = MemoryBroker::new();
    let (background, calls) = background(&broker, RuntimeEnv::test(), TestInvocation::Automatic);

    let ran = background
        .background_model(&Invoice { id: 42 }, "remind", args![])
        .await
        .unwrap();

    assert_eq!(ran, Dispatched::Ran(Outcome::RecordMissing));
    assert!(calls.lock().is_empty());
}

#[tokio::test]
async fn test_really_test_queue_enqueues_under_tests() {
    let broker = MemoryBroker::new();
    let env = RuntimeEnv::test().with_really_test_queue(true);
    let (background, calls) = background(&broker, env, TestInvocation::Automatic);

    background
        .background::<Reports>("build", args!["queued"])
        .await
        .unwrap();

    assert_eq!(broker.added_to("MyAppBackgroundJobQueue").len(), 1);
    assert!(calls.lock().is_empty());
}

#[tokio::test]
async fn test_manual_mode_jobs_run_once_when_worked() {
    let broker = MemoryBroker::new();
    let (background, calls) = background(&broker, RuntimeEnv::test(), TestInvocation::Manual);
    testing::clean(&background).await.unwrap();

    background
        .background::<Reports>("build", args!["one"])
        .await
        .unwrap();
    background
        .background_model(&Invoice { id: 2 }, "remind", args![])
        .await
        .unwrap();
    background
        .background_model(&Invoice { id: 77 }, "remind", args![])
        .await
        .unwrap();
    assert!(calls.lock().is_empty());

    let summary = testing::work(&background).await.unwrap();
    assert_eq!(summary.completed, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(*calls.lock(), vec!["build:one", "remind:2"]);

    assert_eq!(testing::work(&background).await.unwrap().total(), 0);
    assert_eq!(calls.lock().len(), 2);
}

#[tokio::test]
async fn test_rescheduling_replaces_the_schedule() {
    let broker = MemoryBroker::new();
    let (background, _) = background(&broker, RuntimeEnv::production(), TestInvocation::Automatic);

    background
        .schedule::<Reports>("0 3 * * *", "build", args!["nightly"])
        .await
        .unwrap();
    background
        .schedule::<Reports>("30 4 * * *", "build", args!["nightly"])
        .await
        .unwrap();

    let schedules = broker.schedules("MyAppBackgroundJobQueue");
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0].id, "Reports:build");
    assert_eq!(schedules[0].pattern, "30 4 * * *");
}

#[tokio::test]
async fn test_native_queue_routing() {
    let broker = MemoryBroker::new();
    let options = NativeOptions::new()
        .with_queue_connection(broker.connection("queue"))
        .with_named_queue("Exports", NativeQueueOptions::new())
        .with_named_queue("Payments", NativeQueueOptions::new());
    let config = WorkersConfig::new("my_app", options).with_env(RuntimeEnv::production());
    let background = Background::new(config, registry(Calls::default()));

    let grouped = JobOptions::new(JobConfig::new().with_queue_group("Payments", "stripe"));
    background
        .static_method("Reports", "build", "services/Reports", args!["p"], &grouped)
        .await
        .unwrap();

    let plain = JobOptions::new(
        JobConfig::new()
            .with_queue("Exports")
            .with_priority(Priority::Last),
    );
    background
        .static_method("Reports", "build", "services/Reports", args!["e"], &plain)
        .await
        .unwrap();

    assert_eq!(
        wire_options(&broker, "Payments"),
        vec![json!({"group": {"id": "stripe", "priority": 2}})]
    );
    assert_eq!(wire_options(&broker, "Exports"), vec![json!({"priority": 4})]);

    let err = background
        .static_method(
            "Reports",
            "build",
            "services/Reports",
            args!["x"],
            &JobOptions::new(JobConfig::new().with_queue("Refunds")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::NoQueueForQueueName(ref name) if name == "Refunds"));
}

#[tokio::test]
async fn test_transitional_queues_never_receive_new_jobs() {
    let new_redis = MemoryBroker::new();
    let old_redis = MemoryBroker::new();
    let options = SimpleOptions::new(new_redis.connection("queue"))
        .with_named_workstream(WorkstreamOptions::new("snazzy"))
        .with_transitional(
            TransitionalOptions::new(old_redis.connection("old-queue"))
                .with_named_workstream(WorkstreamOptions::new("snazzy")),
        );
    let config = WorkersConfig::new("my_app", options).with_env(RuntimeEnv::production());
    let background = Background::new(config, registry(Calls::default()));

    background
        .background::<Reports>("build", args!["a"])
        .await
        .unwrap();

    let queues = background.queues().await.unwrap();
    let layout: Vec<(&str, bool)> = queues
        .iter()
        .map(|queue| (queue.name.as_str(), queue.transitional))
        .collect();
    assert_eq!(
        layout,
        vec![
            ("MyAppBackgroundJobQueue", false),
            ("snazzy", false),
            ("MyAppBackgroundJobQueue", true),
            ("snazzy", true),
        ]
    );

    assert_eq!(new_redis.added().len(), 1);
    assert!(old_redis.added().is_empty());
}

#[tokio::test]
async fn test_cluster_and_pool_wire_names() {
    let broker = MemoryBroker::new();
    let config = WorkersConfig::new("my_app", SimpleOptions::new(broker.cluster_connection("queue")))
        .with_env(RuntimeEnv::production());
    let background = Background::new(config, registry(Calls::default()));
    background
        .background::<Reports>("build", args!["c"])
        .await
        .unwrap();
    assert_eq!(broker.added_to("{MyAppBackgroundJobQueue}").len(), 1);

    let broker = MemoryBroker::new();
    let env = RuntimeEnv::test()
        .with_really_test_queue(true)
        .with_test_pool_id(3);
    let config = WorkersConfig::new("my_app", SimpleOptions::new(broker.connection("queue"))).with_env(env);
    let background = Background::new(config, registry(Calls::default()));
    background
        .background::<Reports>("build", args!["p"])
        .await
        .unwrap();
    assert_eq!(broker.added_to("MyAppBackgroundJobQueue-3").len(), 1);
}

#[tokio::test]
async fn test_workers_run_jobs_then_shut_down_in_order() {
    let broker = MemoryBroker::new();
    let queue_conn = broker.connection("queue");
    let worker_conn = broker.connection("worker");
    let options = SimpleOptions::new(queue_conn.clone()).with_worker_connection(worker_conn.clone());
    let config = WorkersConfig::new("my_app", options).with_env(RuntimeEnv::production());
    let calls = Calls::default();
    let background = Arc::new(
        Background::new(config, registry(calls.clone())).with_worker_settings(WorkerSettings {
            poll_interval: Duration::from_millis(10),
        }),
    );

    let hook_runs = Arc::new(AtomicUsize::new(0));
    let counter = hook_runs.clone();
    let conn_at_hook = queue_conn.clone();
    background
        .on_worker_shutdown(Box::new(move || {
            let counter = counter.clone();
            let conn = conn_at_hook.clone();
            Box::pin(async move {
                // connections are still open while hooks run
                assert!(!conn.is_closed());
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }))
        .await;

    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let handle = background
        .work_until(async move {
            let _ = stopped.await;
        })
        .await
        .unwrap();

    background
        .background::<Reports>("build", args!["worked"])
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while broker
            .jobs_in_state("MyAppBackgroundJobQueue", JobState::Completed)
            .is_empty()
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job should complete");
    assert_eq!(*calls.lock(), vec!["build:worked"]);

    stop.send(()).unwrap();
    handle.wait().await;

    assert_eq!(hook_runs.load(Ordering::SeqCst), 1);
    assert!(queue_conn.is_closed());
    assert!(worker_conn.is_closed());
    assert!(!background.is_connected());

    // a second close is a no-op
    background.close_all_connections().await;
}

#[tokio::test]
async fn test_inline_jobs_run_nested_dispatches_depth_first() {
    let broker = MemoryBroker::new();
    let calls = Calls::default();
    let slot: Arc<std::sync::OnceLock<std::sync::Weak<Background>>> = Arc::default();

    let outer_calls = calls.clone();
    let inner_calls = calls.clone();
    let outer_slot = slot.clone();
    let registry = Registry::new()
        .service("services/Pipeline", move |s| {
            s.method("outer", move |_args, _job| {
                let calls = outer_calls.clone();
                let slot = outer_slot.clone();
                async move {
                    calls.lock().push("outer-start".to_string());
                    let background = slot
                        .get()
                        .and_then(std::sync::Weak::upgrade)
                        .ok_or_else(|| anyhow::anyhow!("background dropped"))?;
                    background
                        .static_method("Pipeline", "inner", "services/Pipeline", vec![], &JobOptions::default())
                        .await?;
                    calls.lock().push("outer-end".to_string());
                    anyhow::Ok(())
                }
            })
            .method("inner", move |_args, _job| {
                let calls = inner_calls.clone();
                async move {
                    calls.lock().push("inner".to_string());
                    anyhow::Ok(())
                }
            })
        });

    let config = WorkersConfig::new("my_app", simple(&broker)).with_env(RuntimeEnv::test());
    let background = Arc::new(Background::new(config, registry));
    slot.set(Arc::downgrade(&background)).unwrap();

    background
        .static_method("Pipeline", "outer", "services/Pipeline", vec![], &JobOptions::default())
        .await
        .unwrap();

    assert_eq!(*calls.lock(), vec!["outer-start", "inner", "outer-end"]);
    assert!(broker.added().is_empty());
}
