//! Integration tests for common Stagehand workflows.
//!
//! Settings files are parsed for real; connections come from an in-memory
//! broker so no Redis server is needed.

use parking_lot::Mutex;
use stagehand::backend::memory::MemoryBroker;
use stagehand::prelude::*;
use stagehand::settings::FileFormat;
use stagehand::{testing, ConnectionRef};
use std::collections::HashMap;
use std::sync::Arc;

const SETTINGS: &str = r#"
    app_name = "billing_api"
    test_invocation = "manual"

    [connections.main]
    url = "redis://localhost:6379"

    [background]
    mode = "simple"
    queue_connection = "main"
    worker_connection = "main"

    [[background.named_workstreams]]
    name = "exports"
"#;

fn connect(settings: &WorkersSettings, broker: &MemoryBroker, env: RuntimeEnv) -> WorkersConfig {
    let connections: HashMap<String, ConnectionRef> = settings
        .referenced_connections()
        .into_iter()
        .map(|name| (name.to_string(), broker.connection(name) as ConnectionRef))
        .collect();
    settings.to_workers_config(&connections, env).unwrap()
}

fn registry(calls: Arc<Mutex<Vec<String>>>) -> Registry {
    Registry::new().service("services/Exports", move |s| {
        s.method("run", move |args, job| {
            let calls = calls.clone();
            async move {
                let format: String = args.get(0)?;
                calls.lock().push(format!("{}@{}", format, job.queue));
                anyhow::Ok(())
            }
        })
    })
}

// =============================================================================
// Settings to dispatch
// =============================================================================

#[tokio::test]
async fn test_settings_file_to_worked_jobs() {
    let settings = WorkersSettings::parse(SETTINGS, FileFormat::Toml).unwrap();
    let broker = MemoryBroker::new();
    let config = connect(&settings, &broker, RuntimeEnv::test());
    let calls = Arc::new(Mutex::new(Vec::new()));
    let background = Background::new(config, registry(calls.clone()));

    testing::clean(&background).await.unwrap();

    let exports = JobOptions::new(JobConfig::new().with_workstream("exports"));
    background
        .static_method("Exports", "run", "services/Exports", args!["csv"], &exports)
        .await
        .unwrap();
    background
        .static_method("Exports", "run", "services/Exports", args!["pdf"], &JobOptions::default())
        .await
        .unwrap();

    let summary = testing::work(&background).await.unwrap();
    assert_eq!(summary.completed, 2);

    let mut seen = calls.lock().clone();
    seen.sort();
    assert_eq!(seen, vec!["csv@exports", "pdf@BillingApiBackgroundJobQueue"]);

    background.close_all_connections().await;
}

#[tokio::test]
async fn test_manifest_lists_workstreams() {
    let settings = WorkersSettings::parse(SETTINGS, FileFormat::Toml).unwrap();
    let broker = MemoryBroker::new();
    let background = Background::new(
        connect(&settings, &broker, RuntimeEnv::production()),
        Registry::new(),
    );

    let manifest = background.manifest().await.unwrap();
    assert_eq!(manifest.workstream_names, vec!["exports"]);
    assert!(background.workers().is_empty());
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_host_shutdown_closes_connections_once() {
    let settings = WorkersSettings::parse(SETTINGS, FileFormat::Toml).unwrap();
    let broker = MemoryBroker::new();
    let background = Background::new(
        connect(&settings, &broker, RuntimeEnv::production()),
        Registry::new(),
    );

    background
        .handle_host_event(HostEvent::AfterRoutesLoaded)
        .await
        .unwrap();
    assert!(background.is_connected());

    background
        .handle_host_event(HostEvent::ServerShutdown)
        .await
        .unwrap();
    background
        .handle_host_event(HostEvent::ServerShutdown)
        .await
        .unwrap();
    assert!(!background.is_connected());
}
