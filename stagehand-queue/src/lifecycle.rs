//! Worker shutdown hooks, host events and signal handling.

use crate::error::{QueueError, QueueResult};
use stagehand_log::{error, info, warn};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Async cleanup run when workers shut down.
pub type ShutdownHook =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Hooks run between closing the workers and closing the connections.
pub struct ShutdownHooks {
    hooks: RwLock<Vec<ShutdownHook>>,
    hook_timeout: Duration,
}

impl ShutdownHooks {
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
            hook_timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }

    /// Limit each hook to `hook_timeout`.
    pub fn with_timeout(mut self, hook_timeout: Duration) -> Self {
        self.hook_timeout = hook_timeout;
        self
    }

    /// Register a hook. Hooks run in registration order.
    pub async fn add(&self, hook: ShutdownHook) {
        self.hooks.write().await.push(hook);
    }

    pub async fn len(&self) -> usize {
        self.hooks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.hooks.read().await.is_empty()
    }

    /// Run every hook, returning how many completed.
    ///
    /// A failing or slow hook is logged and does not stop the others.
    pub async fn run(&self) -> usize {
        let hooks = self.hooks.read().await;
        if hooks.is_empty() {
            return 0;
        }

        info!("Running {} worker shutdown hooks", hooks.len());
        let mut completed = 0;
        for (i, hook) in hooks.iter().enumerate() {
            match timeout(self.hook_timeout, hook()).await {
                Ok(Ok(())) => {
                    completed += 1;
                    info!("Worker shutdown hook {} completed", i + 1);
                }
                Ok(Err(e)) => error!("Worker shutdown hook {} failed: {}", i + 1, e),
                Err(_) => error!("Worker shutdown hook {} timed out", i + 1),
            }
        }
        completed
    }
}

impl Default for ShutdownHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ShutdownHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHooks")
            .field("hook_timeout", &self.hook_timeout)
            .finish_non_exhaustive()
    }
}

/// Lifecycle events from the host framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// Routes are loaded; queues are built for enqueueing only.
    AfterRoutesLoaded,
    /// The server is stopping; every connection is closed.
    ServerShutdown,
}

/// Process signals that start a graceful shutdown.
///
/// Handlers are installed up front so a failure surfaces before any worker
/// starts.
#[derive(Debug)]
pub struct ShutdownSignal {
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
}

impl ShutdownSignal {
    /// Install SIGINT and SIGTERM handlers.
    #[cfg(unix)]
    pub fn install() -> QueueResult<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            sigterm: signal(SignalKind::terminate()).map_err(QueueError::Signal)?,
            sigint: signal(SignalKind::interrupt()).map_err(QueueError::Signal)?,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> QueueResult<Self> {
        Ok(Self {})
    }

    /// Wait for the first signal.
    #[cfg(unix)]
    pub async fn recv(mut self) {
        tokio::select! {
            _ = self.sigterm.recv() => {
                info!("Received SIGTERM, shutting down workers");
            }
            _ = self.sigint.recv() => {
                info!("Received SIGINT, shutting down workers");
            }
        }
    }

    #[cfg(not(unix))]
    pub async fn recv(self) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down workers"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    }
}

/// Handle to a running `work()` session.
///
/// The session ends after a shutdown signal once workers, hooks and
/// connections are closed.
#[derive(Debug)]
pub struct WorkHandle {
    task: JoinHandle<()>,
}

impl WorkHandle {
    pub(crate) fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    /// Wait until shutdown has finished.
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            if e.is_cancelled() {
                warn!("Work session was cancelled before shutdown finished");
            } else {
                error!("Work session panicked: {}", e);
            }
        }
    }

    /// Stop watching for signals without shutting down.
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_hook(counter: Arc<AtomicUsize>) -> ShutdownHook {
        Box::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_hooks_run_in_order_and_count() {
        let hooks = ShutdownHooks::new();
        let counter = Arc::new(AtomicUsize::new(0));

        hooks.add(counting_hook(counter.clone())).await;
        hooks.add(counting_hook(counter.clone())).await;

        assert_eq!(hooks.len().await, 2);
        assert_eq!(hooks.run().await, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failing_hook_does_not_stop_others() {
        let hooks = ShutdownHooks::new();
        let counter = Arc::new(AtomicUsize::new(0));

        hooks
            .add(Box::new(|| Box::pin(async { Err(anyhow::anyhow!("flush failed")) })))
            .await;
        hooks.add(counting_hook(counter.clone())).await;

        assert_eq!(hooks.run().await, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_hook_times_out() {
        let hooks = ShutdownHooks::new().with_timeout(Duration::from_millis(50));
        hooks
            .add(Box::new(|| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                })
            }))
            .await;

        assert_eq!(hooks.run().await, 0);
    }

    #[tokio::test]
    async fn test_empty_hooks() {
        let hooks = ShutdownHooks::default();
        assert!(hooks.is_empty().await);
        assert_eq!(hooks.run().await, 0);
    }
}
