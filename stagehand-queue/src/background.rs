//! The background-job facility of one application.
//!
//! A [`Background`] owns the workers config, the class registry and, once
//! connected, the [`Topology`]. The composition root creates one and shares
//! it as `Arc<Background>`; dispatch methods live in
//! [`dispatcher`](crate::dispatcher) and [`service`](crate::service).
//!
//! # Examples
//!
//! ```
//! use stagehand_queue::prelude::*;
//! use stagehand_queue::backend::memory::MemoryBroker;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> QueueResult<()> {
//! let broker = MemoryBroker::new();
//! let config = WorkersConfig::new("billing_api", SimpleOptions::new(broker.connection("queue")))
//!     .with_env(RuntimeEnv::production());
//!
//! let registry = Registry::new().service("services/Invoices", |s| {
//!     s.method("sendReminders", |_args, _job| async { anyhow::Ok(()) })
//! });
//!
//! let background = Background::new(config, registry);
//! background
//!     .static_method("Invoices", "sendReminders", "services/Invoices", vec![], &JobOptions::default())
//!     .await?;
//!
//! assert_eq!(broker.added_to("BillingApiBackgroundJobQueue").len(), 1);
//! background.close_all_connections().await;
//! # Ok(())
//! # }
//! ```

use crate::config::WorkersConfig;
use crate::error::{QueueError, QueueResult};
use crate::lifecycle::{HostEvent, ShutdownHook, ShutdownHooks, ShutdownSignal, WorkHandle};
use crate::registry::Registry;
use crate::runner::JobRunner;
use crate::topology::{QueueSpec, RoutingManifest, Topology};
use crate::worker::{Worker, WorkerSettings};
use parking_lot::Mutex;
use stagehand_log::{debug, info};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// How [`Background::connect`] builds the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectOptions {
    /// Create and start workers for every queue
    pub activate_workers: bool,
}

impl ConnectOptions {
    /// Queues only: the process enqueues but never runs jobs.
    pub fn enqueue_only() -> Self {
        Self {
            activate_workers: false,
        }
    }

    /// Queues plus running workers.
    pub fn with_workers() -> Self {
        Self {
            activate_workers: true,
        }
    }
}

/// Background jobs for one application.
pub struct Background {
    config: WorkersConfig,
    runner: JobRunner,
    worker_settings: WorkerSettings,
    hooks: ShutdownHooks,
    topology: Mutex<Option<Arc<Topology>>>,
    // Set under the topology lock once a built topology's connections close
    closed: AtomicBool,
}

impl Background {
    pub fn new(config: WorkersConfig, registry: Registry) -> Self {
        Self {
            config,
            runner: JobRunner::new(Arc::new(registry)),
            worker_settings: WorkerSettings::default(),
            hooks: ShutdownHooks::new(),
            topology: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Tune the workers created by [`connect`](Self::connect).
    pub fn with_worker_settings(mut self, settings: WorkerSettings) -> Self {
        self.worker_settings = settings;
        self
    }

    pub fn config(&self) -> &WorkersConfig {
        &self.config
    }

    pub fn runner(&self) -> &JobRunner {
        &self.runner
    }

    /// Build the topology, or return the one already built.
    ///
    /// Only the first call decides whether workers exist; later calls
    /// return the same topology whatever their options. Fails with
    /// [`QueueError::ShutDown`] once [`close_all_connections`](Self::close_all_connections)
    /// has closed the connections.
    pub async fn connect(&self, options: ConnectOptions) -> QueueResult<Arc<Topology>> {
        let (topology, built) = {
            let mut cell = self.topology.lock();
            if self.closed.load(Ordering::SeqCst) {
                return Err(QueueError::ShutDown(self.config.app_name.clone()));
            }
            match cell.as_ref() {
                Some(existing) => (existing.clone(), false),
                None => {
                    let topology = Arc::new(Topology::build(
                        &self.config,
                        options.activate_workers,
                        self.runner.clone(),
                        self.worker_settings,
                    )?);
                    *cell = Some(topology.clone());
                    (topology, true)
                }
            }
        };

        if built && options.activate_workers {
            topology.start_workers().await?;
        }

        Ok(topology)
    }

    /// The topology, when connected.
    pub fn topology(&self) -> Option<Arc<Topology>> {
        self.topology.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.topology.lock().is_some()
    }

    /// Whether the connections were closed. Every later dispatch fails.
    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Every queue, connecting enqueue-only when needed.
    pub async fn queues(&self) -> QueueResult<Vec<Arc<QueueSpec>>> {
        Ok(self.connect(ConnectOptions::enqueue_only()).await?.queues())
    }

    /// Every worker. Empty unless connected with workers.
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.topology()
            .map(|topology| topology.workers().to_vec())
            .unwrap_or_default()
    }

    /// Workstream names and queue groups known to the topology.
    pub async fn manifest(&self) -> QueueResult<RoutingManifest> {
        Ok(self
            .connect(ConnectOptions::enqueue_only())
            .await?
            .manifest()
            .clone())
    }

    /// Register cleanup to run after workers stop and before connections
    /// close.
    pub async fn on_worker_shutdown(&self, hook: ShutdownHook) {
        self.hooks.add(hook).await;
    }

    /// Start workers and shut down gracefully on SIGINT or SIGTERM.
    pub async fn work(self: &Arc<Self>) -> QueueResult<WorkHandle> {
        let signal = ShutdownSignal::install()?;
        self.work_until(signal.recv()).await
    }

    /// Start workers and shut down gracefully once `stop` resolves.
    pub async fn work_until<F>(self: &Arc<Self>, stop: F) -> QueueResult<WorkHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let topology = self.connect(ConnectOptions::with_workers()).await?;
        info!(
            "Working {} queues with {} workers",
            topology.queues().len(),
            topology.workers().len()
        );

        let background = Arc::clone(self);
        let task = tokio::spawn(async move {
            stop.await;
            background.shutdown().await;
        });
        Ok(WorkHandle::new(task))
    }

    /// Close workers, run the worker shutdown hooks, then close every
    /// connection.
    pub async fn shutdown(&self) {
        info!("Shutting down background workers");
        if let Some(topology) = self.topology() {
            topology.close_workers().await;
        }
        self.hooks.run().await;
        self.close_all_connections().await;
        info!("Background workers shut down");
    }

    /// Close every queue and connection. Does nothing when not connected.
    ///
    /// Workers still running are closed first. The connections belong to the
    /// config and cannot be reopened, so connecting or dispatching afterwards
    /// fails with [`QueueError::ShutDown`].
    pub async fn close_all_connections(&self) {
        let taken = {
            let mut cell = self.topology.lock();
            let taken = cell.take();
            if taken.is_some() {
                self.closed.store(true, Ordering::SeqCst);
            }
            taken
        };
        let Some(topology) = taken else {
            debug!("No background connections to close");
            return;
        };
        topology.close_all_connections().await;
    }

    /// React to a host framework lifecycle event.
    pub async fn handle_host_event(&self, event: HostEvent) -> QueueResult<()> {
        match event {
            HostEvent::AfterRoutesLoaded => {
                self.connect(ConnectOptions::enqueue_only()).await?;
            }
            HostEvent::ServerShutdown => self.close_all_connections().await,
        }
        Ok(())
    }
}

impl std::fmt::Debug for Background {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Background")
            .field("app_name", &self.config.app_name)
            .field("connected", &self.is_connected())
            .finish()
    }
}
