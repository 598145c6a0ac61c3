//! Workers settings files.
//!
//! A settings file names Redis connections and refers to them by name from
//! the background section, whose `mode` picks the simple or native style:
//!
//! ```toml
//! app_name = "billing_api"
//! test_invocation = "manual"
//!
//! [connections.queue]
//! url = "redis://localhost:6379"
//! url_env = "BG_QUEUE_REDIS_URL"
//!
//! [connections.worker]
//! url = "redis://localhost:6379"
//!
//! [queue_defaults]
//! attempts = 3
//! backoff = { type = "exponential", delay_ms = 1000 }
//!
//! [background]
//! mode = "simple"
//! queue_connection = "queue"
//! worker_connection = "worker"
//! default_workstream = { worker_count = 2, concurrency = 5 }
//!
//! [[background.named_workstreams]]
//! name = "snazzy"
//! concurrency = 10
//! rate_limit = { max = 100, duration = 1000 }
//! ```
//!
//! TOML and JSON files are supported; the format follows the extension.

use crate::broker::{ConnectionRef, QueueDefaults};
use crate::config::{
    BackgroundOptions, NativeOptions, NativeQueueOptions, NativeWorkerOptions,
    RateLimit, RuntimeEnv, SimpleOptions, TestInvocation, TransitionalOptions, WorkersConfig,
    WorkstreamOptions, WorkstreamSizing,
};
use crate::error::{QueueError, QueueResult};
use serde::{Deserialize, Serialize};
use stagehand_log::{debug, info};
use stagehand_redis::{RedisConfig, RedisConnection};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Environment variable naming the settings file read by
/// [`WorkersSettings::load`].
pub const SETTINGS_PATH_ENV: &str = "STAGEHAND_WORKERS_CONFIG";

/// Settings file used when [`SETTINGS_PATH_ENV`] is unset.
pub const DEFAULT_SETTINGS_PATH: &str = "config/workers.toml";

/// Supported settings file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Toml,
}

impl FileFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "json" => Some(FileFormat::Json),
            "toml" => Some(FileFormat::Toml),
            _ => None,
        }
    }

    /// Detect the format from a file path's extension.
    pub fn from_path(path: &Path) -> QueueResult<Self> {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| QueueError::Config(format!("No file extension on '{}'", path.display())))?;

        Self::from_extension(ext)
            .ok_or_else(|| QueueError::Config(format!("Unsupported settings format: {}", ext)))
    }
}

/// A named Redis connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Environment variable whose value, when set, replaces `url`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_env: Option<String>,
    #[serde(flatten)]
    pub redis: RedisConfig,
}

impl ConnectionSettings {
    /// The Redis config with `url_env` applied.
    pub fn resolve(&self) -> RedisConfig {
        let mut config = self.redis.clone();
        if let Some(var) = &self.url_env
            && let Ok(url) = std::env::var(var)
        {
            config.url = url;
        }
        config
    }
}

/// A named workstream in simple mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkstreamSettings {
    pub name: String,
    #[serde(default)]
    pub worker_count: Option<usize>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    #[serde(default)]
    pub queue_connection: Option<String>,
    #[serde(default)]
    pub worker_connection: Option<String>,
}

/// The transitional half of simple mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionalSettings {
    pub queue_connection: String,
    #[serde(default)]
    pub worker_connection: Option<String>,
    #[serde(default)]
    pub default_workstream: WorkstreamSizing,
    #[serde(default)]
    pub named_workstreams: Vec<WorkstreamSettings>,
}

/// Simple mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleSettings {
    pub queue_connection: String,
    #[serde(default)]
    pub worker_connection: Option<String>,
    #[serde(default)]
    pub default_workstream: WorkstreamSizing,
    #[serde(default)]
    pub named_workstreams: Vec<WorkstreamSettings>,
    #[serde(default)]
    pub transitional: Option<TransitionalSettings>,
}

/// One queue in native mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NativeQueueSettings {
    #[serde(default)]
    pub queue_connection: Option<String>,
    #[serde(default)]
    pub worker_connection: Option<String>,
    #[serde(default)]
    pub defaults: Option<QueueDefaults>,
}

/// A named queue in native mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedQueueSettings {
    pub name: String,
    #[serde(flatten)]
    pub queue: NativeQueueSettings,
}

/// Native mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeSettings {
    pub queue_connection: Option<String>,
    pub worker_connection: Option<String>,
    pub default_queue: NativeQueueSettings,
    pub named_queues: Vec<NamedQueueSettings>,
    pub default_worker_count: Option<usize>,
    pub default_worker_options: NativeWorkerOptions,
    pub named_queue_workers: BTreeMap<String, NativeWorkerOptions>,
}

/// The background section, tagged by `mode`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BackgroundSettings {
    Simple(SimpleSettings),
    Native(NativeSettings),
}

/// Contents of a workers settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkersSettings {
    pub app_name: String,
    #[serde(default)]
    pub test_invocation: TestInvocation,
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionSettings>,
    /// Broker options shared by every queue
    #[serde(default)]
    pub queue_defaults: QueueDefaults,
    pub background: BackgroundSettings,
}

impl WorkersSettings {
    /// Parse settings from a string.
    pub fn parse(content: &str, format: FileFormat) -> QueueResult<Self> {
        let settings: Self = match format {
            FileFormat::Json => serde_json::from_str(content)
                .map_err(|e| QueueError::Config(format!("JSON parse error: {}", e)))?,
            FileFormat::Toml => toml::from_str(content)
                .map_err(|e| QueueError::Config(format!("TOML parse error: {}", e)))?,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Read a settings file, detecting the format from its extension.
    pub fn from_file(path: impl AsRef<Path>) -> QueueResult<Self> {
        let path = path.as_ref();
        let format = FileFormat::from_path(path)?;
        let content = fs::read_to_string(path).map_err(|e| {
            QueueError::Config(format!("Failed to read '{}': {}", path.display(), e))
        })?;
        debug!("Loading workers settings from {}", path.display());
        Self::parse(&content, format)
    }

    /// Load `.env`, then the settings file named by
    /// `STAGEHAND_WORKERS_CONFIG` (default `config/workers.toml`).
    pub fn load() -> QueueResult<Self> {
        match dotenvy::dotenv() {
            Ok(path) => debug!("Loaded environment from {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => return Err(QueueError::Config(format!("Failed to load .env: {}", e))),
        }

        let path = std::env::var(SETTINGS_PATH_ENV).unwrap_or_else(|_| DEFAULT_SETTINGS_PATH.to_string());
        Self::from_file(path)
    }

    /// Check names and connection references.
    pub fn validate(&self) -> QueueResult<()> {
        if self.app_name.trim().is_empty() {
            return Err(QueueError::Config("app_name must not be empty".into()));
        }

        for name in self.referenced_connections() {
            let connection = self
                .connections
                .get(name)
                .ok_or_else(|| QueueError::Config(format!("Unknown connection '{}'", name)))?;
            connection
                .resolve()
                .validate()
                .map_err(|e| QueueError::Config(format!("Connection '{}': {}", name, e)))?;
        }

        if let BackgroundSettings::Simple(simple) = &self.background {
            let mut seen = std::collections::HashSet::new();
            for workstream in &simple.named_workstreams {
                if !seen.insert(workstream.name.as_str()) {
                    return Err(QueueError::Config(format!(
                        "Duplicate workstream '{}'",
                        workstream.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Connection names the background section uses, each once, in order of
    /// first use.
    pub fn referenced_connections(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();

        match &self.background {
            BackgroundSettings::Simple(simple) => {
                push_name(&mut names, Some(&simple.queue_connection));
                push_name(&mut names, simple.worker_connection.as_ref());
                push_workstreams(&mut names, &simple.named_workstreams);
                if let Some(transitional) = &simple.transitional {
                    push_name(&mut names, Some(&transitional.queue_connection));
                    push_name(&mut names, transitional.worker_connection.as_ref());
                    push_workstreams(&mut names, &transitional.named_workstreams);
                }
            }
            BackgroundSettings::Native(native) => {
                push_name(&mut names, native.queue_connection.as_ref());
                push_name(&mut names, native.worker_connection.as_ref());
                push_name(&mut names, native.default_queue.queue_connection.as_ref());
                push_name(&mut names, native.default_queue.worker_connection.as_ref());
                for named in &native.named_queues {
                    push_name(&mut names, named.queue.queue_connection.as_ref());
                    push_name(&mut names, named.queue.worker_connection.as_ref());
                }
            }
        }

        names
    }

    /// Open every referenced Redis connection and build the workers config.
    pub async fn connect(&self) -> QueueResult<WorkersConfig> {
        self.validate()?;

        let mut connections: HashMap<String, ConnectionRef> = HashMap::new();
        for name in self.referenced_connections() {
            let Some(settings) = self.connections.get(name) else {
                continue;
            };
            let mut config = settings.resolve();
            if config.connection_name.is_none() {
                config.connection_name = Some(format!("{}-{}", self.app_name, name));
            }
            let connection: ConnectionRef = Arc::new(RedisConnection::connect(name, config).await?);
            connections.insert(name.to_string(), connection);
        }

        info!(
            "Opened {} background connections for '{}'",
            connections.len(),
            self.app_name
        );
        self.to_workers_config(&connections, RuntimeEnv::from_env())
    }

    /// Build the workers config from already open connections, keyed by
    /// connection name.
    pub fn to_workers_config(
        &self,
        connections: &HashMap<String, ConnectionRef>,
        env: RuntimeEnv,
    ) -> QueueResult<WorkersConfig> {
        let resolver = Resolver { connections };
        let background = match &self.background {
            BackgroundSettings::Simple(simple) => {
                BackgroundOptions::Simple(resolver.simple(simple, &self.queue_defaults)?)
            }
            BackgroundSettings::Native(native) => {
                BackgroundOptions::Native(resolver.native(native, &self.queue_defaults)?)
            }
        };

        Ok(WorkersConfig::new(self.app_name.clone(), background)
            .with_test_invocation(self.test_invocation)
            .with_env(env))
    }
}

fn push_name<'a>(names: &mut Vec<&'a str>, name: Option<&'a String>) {
    if let Some(name) = name
        && !names.contains(&name.as_str())
    {
        names.push(name.as_str());
    }
}

fn push_workstreams<'a>(names: &mut Vec<&'a str>, workstreams: &'a [WorkstreamSettings]) {
    for workstream in workstreams {
        push_name(names, workstream.queue_connection.as_ref());
        push_name(names, workstream.worker_connection.as_ref());
    }
}

struct Resolver<'a> {
    connections: &'a HashMap<String, ConnectionRef>,
}

impl Resolver<'_> {
    fn get(&self, name: &str) -> QueueResult<ConnectionRef> {
        self.connections
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::Config(format!("Unknown connection '{}'", name)))
    }

    fn get_opt(&self, name: Option<&String>) -> QueueResult<Option<ConnectionRef>> {
        name.map(|name| self.get(name)).transpose()
    }

    fn workstream(&self, settings: &WorkstreamSettings) -> QueueResult<WorkstreamOptions> {
        let mut options = WorkstreamOptions::new(settings.name.clone());
        options.sizing = WorkstreamSizing {
            worker_count: settings.worker_count,
            concurrency: settings.concurrency,
        };
        options.rate_limit = settings.rate_limit;
        options.queue_connection = self.get_opt(settings.queue_connection.as_ref())?;
        options.worker_connection = self.get_opt(settings.worker_connection.as_ref())?;
        Ok(options)
    }

    fn simple(&self, settings: &SimpleSettings, defaults: &QueueDefaults) -> QueueResult<SimpleOptions> {
        let mut options = SimpleOptions::new(self.get(&settings.queue_connection)?)
            .with_queue_defaults(defaults.clone());
        options.default_worker_connection = self.get_opt(settings.worker_connection.as_ref())?;
        options.default_workstream = settings.default_workstream;
        for workstream in &settings.named_workstreams {
            options = options.with_named_workstream(self.workstream(workstream)?);
        }

        if let Some(transitional) = &settings.transitional {
            let mut old = TransitionalOptions::new(self.get(&transitional.queue_connection)?);
            old.default_worker_connection = self.get_opt(transitional.worker_connection.as_ref())?;
            old.default_workstream = transitional.default_workstream;
            for workstream in &transitional.named_workstreams {
                old = old.with_named_workstream(self.workstream(workstream)?);
            }
            options = options.with_transitional(old);
        }

        Ok(options)
    }

    fn native_queue(&self, settings: &NativeQueueSettings) -> QueueResult<NativeQueueOptions> {
        Ok(NativeQueueOptions {
            queue_connection: self.get_opt(settings.queue_connection.as_ref())?,
            worker_connection: self.get_opt(settings.worker_connection.as_ref())?,
            defaults: settings.defaults.clone(),
        })
    }

    fn native(&self, settings: &NativeSettings, defaults: &QueueDefaults) -> QueueResult<NativeOptions> {
        let mut options = NativeOptions::new().with_queue_defaults(defaults.clone());
        options.default_queue_connection = self.get_opt(settings.queue_connection.as_ref())?;
        options.default_worker_connection = self.get_opt(settings.worker_connection.as_ref())?;
        options.default_queue_options = self.native_queue(&settings.default_queue)?;
        options.default_worker_count = settings.default_worker_count;
        options.default_worker_options = settings.default_worker_options.clone();

        for named in &settings.named_queues {
            options = options.with_named_queue(named.name.clone(), self.native_queue(&named.queue)?);
        }
        for (queue, workers) in &settings.named_queue_workers {
            options = options.with_named_queue_workers(queue.clone(), workers.clone());
        }

        Ok(options)
    }
}
