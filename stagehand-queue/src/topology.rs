//! Queue topology: which queues exist, on which connections, with which
//! workers.
//!
//! Built once from a [`WorkersConfig`]. Queues are listed in a fixed order:
//! the default queue, named queues in declaration order, then the
//! transitional default and transitional named queues.

use crate::broker::{push_unique, BrokerQueue, ConnectionRef, QueueDefaults};
use crate::config::{
    BackgroundOptions, GroupConfig, NativeOptions, SimpleOptions, WorkersConfig,
    WorkstreamOptions, WorkstreamSizing,
};
use crate::error::{QueueError, QueueResult};
use crate::executor::{BrokerExecutor, InlineExecutor, JobExecutor};
use crate::naming;
use crate::options::Routing;
use crate::runner::JobRunner;
use crate::worker::{Worker, WorkerSettings, WorkerSpec};
use serde::{Deserialize, Serialize};
use stagehand_log::{error, info};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One queue of the topology.
pub struct QueueSpec {
    /// Logical name: the workstream or queue name used when dispatching
    pub name: String,
    /// Name on the broker
    pub wire_name: String,
    /// Old half of a connection migration; never receives new jobs
    pub transitional: bool,
    pub defaults: QueueDefaults,
    queue: Arc<dyn BrokerQueue>,
    connection: ConnectionRef,
    worker_connection: Option<ConnectionRef>,
}

impl QueueSpec {
    /// Queue handle on the enqueue connection.
    pub fn queue(&self) -> &Arc<dyn BrokerQueue> {
        &self.queue
    }

    /// Connection jobs are enqueued through.
    pub fn connection(&self) -> &ConnectionRef {
        &self.connection
    }

    /// Connection workers lease through, when one is configured.
    pub fn worker_connection(&self) -> Option<&ConnectionRef> {
        self.worker_connection.as_ref()
    }
}

impl std::fmt::Debug for QueueSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueSpec")
            .field("name", &self.name)
            .field("wire_name", &self.wire_name)
            .field("transitional", &self.transitional)
            .field("connection", &self.connection.name())
            .field(
                "worker_connection",
                &self.worker_connection.as_ref().map(|c| c.name()),
            )
            .finish()
    }
}

/// Names jobs may be routed by.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingManifest {
    /// Named workstreams, in declaration order
    pub workstream_names: Vec<String>,
    /// Group ids known per named queue
    pub queue_group_map: BTreeMap<String, Vec<String>>,
}

/// The built topology.
pub struct Topology {
    default_queue: Arc<QueueSpec>,
    named_queues: Vec<Arc<QueueSpec>>,
    transitional_default: Option<Arc<QueueSpec>>,
    transitional_named: Vec<Arc<QueueSpec>>,
    workers: Vec<Arc<Worker>>,
    manifest: RoutingManifest,
    connections: Vec<ConnectionRef>,
    executor: Arc<dyn JobExecutor>,
}

impl Topology {
    /// Build the topology described by `config`.
    ///
    /// With `activate_workers`, workers are created (stopped) for every
    /// queue; see [`start_workers`](Self::start_workers).
    pub fn build(
        config: &WorkersConfig,
        activate_workers: bool,
        runner: JobRunner,
        worker_settings: WorkerSettings,
    ) -> QueueResult<Self> {
        let mut builder = Builder {
            config,
            activate_workers,
            runner: runner.clone(),
            worker_settings,
            parts: Parts::default(),
        };

        match &config.background {
            BackgroundOptions::Simple(options) => builder.simple(options)?,
            BackgroundOptions::Native(options) => builder.native(options)?,
        }

        let executor: Arc<dyn JobExecutor> = if config.runs_inline() {
            Arc::new(InlineExecutor::new(runner))
        } else {
            Arc::new(BrokerExecutor)
        };

        let parts = builder.parts;
        let default_queue = parts.default_queue.ok_or(QueueError::DefaultQueueMissingConnection)?;

        let topology = Self {
            default_queue,
            named_queues: parts.named_queues,
            transitional_default: parts.transitional_default,
            transitional_named: parts.transitional_named,
            workers: parts.workers,
            manifest: RoutingManifest {
                workstream_names: parts.workstream_names,
                queue_group_map: parts.queue_groups,
            },
            connections: parts.connections,
            executor,
        };

        info!(
            "Queue topology built: {} queues, {} workers, {} executor",
            topology.queues().len(),
            topology.workers.len(),
            if topology.executor.is_inline() { "inline" } else { "broker" }
        );

        Ok(topology)
    }

    pub fn default_queue(&self) -> &Arc<QueueSpec> {
        &self.default_queue
    }

    /// Named (non-transitional) queue with logical `name`.
    pub fn named_queue(&self, name: &str) -> Option<&Arc<QueueSpec>> {
        self.named_queues.iter().find(|queue| queue.name == name)
    }

    /// Every queue: default, named, transitional default, transitional named.
    pub fn queues(&self) -> Vec<Arc<QueueSpec>> {
        std::iter::once(&self.default_queue)
            .chain(&self.named_queues)
            .chain(&self.transitional_default)
            .chain(&self.transitional_named)
            .cloned()
            .collect()
    }

    /// Every worker, in creation order.
    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    /// Distinct connections, each listed once.
    pub fn connections(&self) -> &[ConnectionRef] {
        &self.connections
    }

    pub fn executor(&self) -> &Arc<dyn JobExecutor> {
        &self.executor
    }

    pub fn manifest(&self) -> &RoutingManifest {
        &self.manifest
    }

    /// Queue a job with `routing` goes to.
    pub fn resolve_queue(&self, routing: &Routing) -> QueueResult<&Arc<QueueSpec>> {
        match routing {
            Routing::Default => Ok(&self.default_queue),
            Routing::Workstream { name } => self
                .named_queue(name)
                .ok_or_else(|| QueueError::NoQueueForWorkstream(name.clone())),
            Routing::Queue { name, .. } => self
                .named_queue(name)
                .ok_or_else(|| QueueError::NoQueueForQueueName(name.clone())),
        }
    }

    /// Start every worker.
    pub async fn start_workers(&self) -> QueueResult<()> {
        for worker in &self.workers {
            if !worker.is_running() {
                worker.start().await?;
            }
        }
        Ok(())
    }

    /// Stop every worker, waiting for in-flight jobs.
    pub async fn close_workers(&self) {
        for worker in &self.workers {
            if let Err(e) = worker.close().await {
                error!("Failed to close worker on '{}': {}", worker.spec().wire_name, e);
            }
        }
    }

    /// Close every queue handle, then every distinct connection once.
    ///
    /// Failures are logged and do not stop the remaining closes.
    pub async fn close_all_connections(&self) {
        for queue in self.queues() {
            if let Err(e) = queue.queue.close().await {
                error!("Failed to close queue '{}': {}", queue.wire_name, e);
            }
        }

        self.close_workers().await;
        for worker in &self.workers {
            if let Err(e) = worker.close_queue().await {
                error!("Failed to close worker queue '{}': {}", worker.spec().wire_name, e);
            }
        }

        for connection in &self.connections {
            if let Err(e) = connection.close().await {
                error!("Failed to close connection '{}': {}", connection.name(), e);
            }
        }
    }
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("queues", &self.queues())
            .field("workers", &self.workers)
            .field("manifest", &self.manifest)
            .finish()
    }
}

/// The override when set, else the fallback, else `missing()`.
fn resolve_connection<'c>(
    preferred: Option<&'c ConnectionRef>,
    fallback: Option<&'c ConnectionRef>,
    missing: impl FnOnce() -> QueueError,
) -> QueueResult<&'c ConnectionRef> {
    preferred.or(fallback).ok_or_else(missing)
}

#[derive(Default)]
struct Parts {
    default_queue: Option<Arc<QueueSpec>>,
    named_queues: Vec<Arc<QueueSpec>>,
    transitional_default: Option<Arc<QueueSpec>>,
    transitional_named: Vec<Arc<QueueSpec>>,
    workers: Vec<Arc<Worker>>,
    workstream_names: Vec<String>,
    queue_groups: BTreeMap<String, Vec<String>>,
    connections: Vec<ConnectionRef>,
}

/// One level of simple options: the main config or its transitional half.
struct SimpleLayer<'a> {
    queue_connection: &'a ConnectionRef,
    worker_connection: Option<&'a ConnectionRef>,
    default_workstream: &'a WorkstreamSizing,
    named_workstreams: &'a [WorkstreamOptions],
    transitional: bool,
}

struct Builder<'a> {
    config: &'a WorkersConfig,
    activate_workers: bool,
    runner: JobRunner,
    worker_settings: WorkerSettings,
    parts: Parts,
}

impl Builder<'_> {
    fn track(&mut self, connection: Option<&ConnectionRef>) {
        if let Some(connection) = connection {
            push_unique(&mut self.parts.connections, connection);
        }
    }

    fn queue_spec(
        &self,
        name: &str,
        connection: &ConnectionRef,
        worker_connection: Option<&ConnectionRef>,
        defaults: &QueueDefaults,
        transitional: bool,
    ) -> Arc<QueueSpec> {
        let wire_name = naming::wire_name(name, connection.is_cluster(), &self.config.env);
        Arc::new(QueueSpec {
            name: name.to_string(),
            queue: connection.open_queue(&wire_name, defaults),
            wire_name,
            transitional,
            defaults: defaults.clone(),
            connection: connection.clone(),
            worker_connection: worker_connection.cloned(),
        })
    }

    fn add_workers(
        &mut self,
        queue: &QueueSpec,
        worker_connection: &ConnectionRef,
        count: usize,
        concurrency: usize,
        group: Option<GroupConfig>,
    ) {
        for _ in 0..count {
            let spec = WorkerSpec {
                queue_name: queue.name.clone(),
                wire_name: queue.wire_name.clone(),
                concurrency,
                group: group.clone(),
            };
            let lease_queue = worker_connection.open_queue(&queue.wire_name, &queue.defaults);
            self.parts.workers.push(Arc::new(Worker::new(
                spec,
                lease_queue,
                self.runner.clone(),
                self.worker_settings,
            )));
        }
    }

    fn simple(&mut self, options: &SimpleOptions) -> QueueResult<()> {
        self.simple_layer(
            SimpleLayer {
                queue_connection: &options.default_queue_connection,
                worker_connection: options.default_worker_connection.as_ref(),
                default_workstream: &options.default_workstream,
                named_workstreams: &options.named_workstreams,
                transitional: false,
            },
            &options.queue_defaults,
        )?;

        if let Some(transitional) = &options.transitional {
            self.simple_layer(
                SimpleLayer {
                    queue_connection: &transitional.default_queue_connection,
                    worker_connection: transitional.default_worker_connection.as_ref(),
                    default_workstream: &transitional.default_workstream,
                    named_workstreams: &transitional.named_workstreams,
                    transitional: true,
                },
                &options.queue_defaults,
            )?;
        }

        Ok(())
    }

    fn simple_layer(&mut self, layer: SimpleLayer<'_>, defaults: &QueueDefaults) -> QueueResult<()> {
        self.track(Some(layer.queue_connection));
        self.track(layer.worker_connection);

        let default_name = self.config.default_queue_name();
        let default_queue = self.queue_spec(
            &default_name,
            layer.queue_connection,
            layer.worker_connection,
            defaults,
            layer.transitional,
        );

        if self.activate_workers {
            let worker_connection = layer
                .worker_connection
                .ok_or(QueueError::WorkersWithoutDefaultWorkerConnection)?;
            self.add_workers(
                &default_queue,
                worker_connection,
                layer.default_workstream.worker_count(),
                layer.default_workstream.concurrency(),
                None,
            );
        }

        if layer.transitional {
            self.parts.transitional_default = Some(default_queue);
        } else {
            self.parts.default_queue = Some(default_queue);
        }

        for workstream in layer.named_workstreams {
            self.track(workstream.queue_connection.as_ref());
            self.track(workstream.worker_connection.as_ref());

            let queue_connection = workstream
                .queue_connection
                .as_ref()
                .unwrap_or(layer.queue_connection);
            let worker_connection = workstream
                .worker_connection
                .as_ref()
                .or(layer.worker_connection);

            let queue = self.queue_spec(
                &workstream.name,
                queue_connection,
                worker_connection,
                defaults,
                layer.transitional,
            );

            if self.activate_workers {
                let worker_connection = worker_connection.ok_or_else(|| {
                    QueueError::NamedWorkersWithoutWorkerConnection(workstream.name.clone())
                })?;
                let group = GroupConfig {
                    id: workstream.name.clone(),
                    limit: workstream.rate_limit,
                };
                self.add_workers(
                    &queue,
                    worker_connection,
                    workstream.sizing.worker_count(),
                    workstream.sizing.concurrency(),
                    Some(group),
                );
            }

            if layer.transitional {
                self.parts.transitional_named.push(queue);
            } else {
                self.parts.named_queues.push(queue);
                self.parts.workstream_names.push(workstream.name.clone());
            }
        }

        Ok(())
    }

    fn native(&mut self, options: &NativeOptions) -> QueueResult<()> {
        let default_options = &options.default_queue_options;
        let worker_connection = default_options
            .worker_connection
            .as_ref()
            .or(options.default_worker_connection.as_ref());

        self.track(
            default_options
                .queue_connection
                .as_ref()
                .or(options.default_queue_connection.as_ref()),
        );
        self.track(worker_connection);

        let queue_connection = resolve_connection(
            default_options.queue_connection.as_ref(),
            options.default_queue_connection.as_ref(),
            || QueueError::DefaultQueueMissingConnection,
        )?;
        let default_defaults = options
            .default_queue_options
            .defaults
            .as_ref()
            .unwrap_or(&options.queue_defaults);

        let default_queue = self.queue_spec(
            &self.config.default_queue_name(),
            queue_connection,
            worker_connection,
            default_defaults,
            false,
        );

        if self.activate_workers {
            let worker_connection =
                worker_connection.ok_or(QueueError::WorkersWithoutDefaultWorkerConnection)?;
            let worker_options = &options.default_worker_options;
            self.add_workers(
                &default_queue,
                worker_connection,
                options.default_worker_count.unwrap_or(1),
                worker_options.concurrency.filter(|c| *c > 0).unwrap_or(1),
                worker_options.group.clone(),
            );
        }
        self.parts.default_queue = Some(default_queue);

        for (name, queue_options) in &options.named_queues {
            self.track(queue_options.queue_connection.as_ref());
            self.track(queue_options.worker_connection.as_ref());

            let named_connection = resolve_connection(
                queue_options.queue_connection.as_ref(),
                Some(queue_connection),
                || QueueError::NamedQueueMissingConnection(name.clone()),
            )?;
            let named_worker_connection = queue_options
                .worker_connection
                .as_ref()
                .or(worker_connection);
            let defaults = queue_options
                .defaults
                .as_ref()
                .unwrap_or(&options.queue_defaults);

            let queue = self.queue_spec(
                name,
                named_connection,
                named_worker_connection,
                defaults,
                false,
            );

            let worker_options = options.named_queue_workers.get(name);
            let groups = self.parts.queue_groups.entry(name.clone()).or_default();
            if let Some(group) = worker_options.and_then(|o| o.group.as_ref()) {
                groups.push(group.id.clone());
            }

            if self.activate_workers {
                let named_worker_connection = named_worker_connection
                    .ok_or_else(|| QueueError::NamedWorkersWithoutWorkerConnection(name.clone()))?;
                if let Some(worker_options) = worker_options {
                    self.add_workers(
                        &queue,
                        named_worker_connection,
                        worker_options.worker_count.unwrap_or(1),
                        worker_options.concurrency.filter(|c| *c > 0).unwrap_or(1),
                        worker_options.group.clone(),
                    );
                }
            }

            self.parts.named_queues.push(queue);
        }

        Ok(())
    }
}
