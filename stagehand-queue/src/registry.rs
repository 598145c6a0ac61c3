//! Registry of backgroundable classes.
//!
//! Jobs name their target by global name and method name. The registry maps
//! those names to closures registered at startup: static methods take the
//! job arguments, model methods take the record fetched by the registered
//! finder plus the job arguments. Every method also receives the [`Job`]
//! that triggered it as its trailing argument.
//!
//! # Examples
//!
//! ```
//! use stagehand_queue::registry::Registry;
//!
//! #[derive(Clone)]
//! struct User {
//!     id: i64,
//!     email: String,
//! }
//!
//! let registry = Registry::new()
//!     .service("services/Mailer", |s| {
//!         s.method("deliver", |args, _job| async move {
//!             let to: String = args.get(0)?;
//!             println!("mailing {}", to);
//!             anyhow::Ok(())
//!         })
//!     })
//!     .model::<User, _, _>(
//!         "User",
//!         |id| async move {
//!             let id: i64 = id.to_string().parse()?;
//!             anyhow::Ok(Some(User { id, email: "a@b.c".into() }))
//!         },
//!         |m| {
//!             m.method("sendWelcome", |user, _args, _job| async move {
//!                 println!("welcome {} <{}>", user.id, user.email);
//!                 Ok(())
//!             })
//!         },
//!     );
//!
//! assert!(registry.lookup("services/Mailer").is_some());
//! assert!(registry.lookup("User").is_some_and(|class| class.is_model()));
//! ```

use crate::envelope::RecordId;
use crate::job::Job;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by registered methods.
pub type MethodFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

type StaticMethod = Arc<dyn Fn(Args, Job) -> MethodFuture + Send + Sync>;

type ModelMethod<M> = Arc<dyn Fn(M, Args, Job) -> MethodFuture + Send + Sync>;

type Finder<M> = Arc<
    dyn Fn(RecordId) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<M>>> + Send>>
        + Send
        + Sync,
>;

/// Positional job arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Vec<Value>);

impl Args {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Raw argument at `index`.
    pub fn raw(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Deserialize the argument at `index`.
    ///
    /// A missing argument deserializes from `null`, so `Option<T>` targets
    /// accept omitted trailing arguments.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> anyhow::Result<T> {
        let value = self.0.get(index).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value)
            .map_err(|e| anyhow::anyhow!("argument {} could not be decoded: {}", index, e))
    }

    pub fn into_inner(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

/// Static methods of one class.
#[derive(Default)]
pub struct StaticMethods {
    methods: HashMap<String, StaticMethod>,
}

impl StaticMethods {
    /// Register a static method.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(Args, Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let wrapped: StaticMethod = Arc::new(move |args, job| -> MethodFuture {
            Box::pin(method(args, job))
        });
        self.methods.insert(name.into(), wrapped);
        self
    }
}

/// Instance methods of one model.
pub struct ModelMethods<M> {
    methods: HashMap<String, ModelMethod<M>>,
}

impl<M> Default for ModelMethods<M> {
    fn default() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }
}

impl<M: Send + 'static> ModelMethods<M> {
    /// Register an instance method.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(M, Args, Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let wrapped: ModelMethod<M> = Arc::new(move |record, args, job| -> MethodFuture {
            Box::pin(method(record, args, job))
        });
        self.methods.insert(name.into(), wrapped);
        self
    }
}

/// Result of running a model method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ModelCall {
    Invoked,
    RecordMissing,
}

#[async_trait]
trait ErasedModel: Send + Sync {
    fn has_method(&self, method: &str) -> bool;

    async fn call(
        &self,
        id: &RecordId,
        method: &str,
        args: Args,
        job: Job,
    ) -> anyhow::Result<ModelCall>;
}

struct TypedModel<M> {
    finder: Finder<M>,
    methods: HashMap<String, ModelMethod<M>>,
}

#[async_trait]
impl<M: Send + 'static> ErasedModel for TypedModel<M> {
    fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    async fn call(
        &self,
        id: &RecordId,
        method: &str,
        args: Args,
        job: Job,
    ) -> anyhow::Result<ModelCall> {
        let Some(invoke) = self.methods.get(method).cloned() else {
            anyhow::bail!("no model method '{}'", method);
        };

        match (self.finder)(id.clone()).await? {
            Some(record) => {
                invoke(record, args, job).await?;
                Ok(ModelCall::Invoked)
            }
            None => Ok(ModelCall::RecordMissing),
        }
    }
}

/// Everything registered under one global name.
#[derive(Default)]
pub struct ClassEntry {
    statics: HashMap<String, StaticMethod>,
    model: Option<Box<dyn ErasedModel>>,
}

impl ClassEntry {
    /// Whether a static method `method` is registered.
    pub fn has_static(&self, method: &str) -> bool {
        self.statics.contains_key(method)
    }

    /// Whether the class has a model finder.
    pub fn is_model(&self) -> bool {
        self.model.is_some()
    }

    /// Whether an instance method `method` is registered.
    pub fn has_instance(&self, method: &str) -> bool {
        self.model.as_ref().is_some_and(|m| m.has_method(method))
    }

    pub(crate) fn static_method(&self, method: &str) -> Option<StaticMethod> {
        self.statics.get(method).cloned()
    }

    pub(crate) async fn call_instance(
        &self,
        id: &RecordId,
        method: &str,
        args: Args,
        job: Job,
    ) -> Option<anyhow::Result<ModelCall>> {
        let model = self.model.as_ref()?;
        Some(model.call(id, method, args, job).await)
    }
}

impl fmt::Debug for ClassEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut statics: Vec<&String> = self.statics.keys().collect();
        statics.sort();
        f.debug_struct("ClassEntry")
            .field("statics", &statics)
            .field("model", &self.model.is_some())
            .finish()
    }
}

/// Maps global names to their registered methods.
#[derive(Default, Debug)]
pub struct Registry {
    classes: HashMap<String, ClassEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register static methods under `global_name`.
    ///
    /// Registering the same global name again adds to its methods.
    pub fn service(
        mut self,
        global_name: impl Into<String>,
        build: impl FnOnce(StaticMethods) -> StaticMethods,
    ) -> Self {
        let methods = build(StaticMethods::default()).methods;
        self.classes
            .entry(global_name.into())
            .or_default()
            .statics
            .extend(methods);
        self
    }

    /// Register a model: its finder and its instance methods.
    ///
    /// The finder returns `Ok(None)` when no record has the id; jobs for
    /// such records are skipped.
    pub fn model<M, F, Fut>(
        mut self,
        global_name: impl Into<String>,
        finder: F,
        build: impl FnOnce(ModelMethods<M>) -> ModelMethods<M>,
    ) -> Self
    where
        M: Send + 'static,
        F: Fn(RecordId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<M>>> + Send + 'static,
    {
        let finder: Finder<M> = Arc::new(move |id| Box::pin(finder(id)));
        let methods = build(ModelMethods::default()).methods;

        self.classes.entry(global_name.into()).or_default().model = Some(Box::new(TypedModel {
            finder,
            methods,
        }));
        self
    }

    /// Look up a class by global name.
    pub fn lookup(&self, global_name: &str) -> Option<&ClassEntry> {
        self.classes.get(global_name)
    }

    /// Registered global names, sorted.
    pub fn global_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.classes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::JobEnvelope;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn job() -> Job {
        Job::synthetic(JobEnvelope::for_static("services/Counter", "bump", vec![]))
    }

    #[test]
    fn test_args_get() {
        let args = Args::new(vec![json!("hi"), json!(3)]);

        assert_eq!(args.get::<String>(0).unwrap(), "hi");
        assert_eq!(args.get::<u32>(1).unwrap(), 3);
        assert_eq!(args.get::<Option<String>>(2).unwrap(), None);
        assert!(args.get::<u32>(0).is_err());
    }

    #[tokio::test]
    async fn test_static_methods_merge() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let registry = Registry::new()
            .service("services/Counter", |s| {
                s.method("bump", move |_args, _job| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
            })
            .service("services/Counter", |s| {
                s.method("reset", |_args, _job| async { Ok(()) })
            });

        let class = registry.lookup("services/Counter").unwrap();
        assert!(class.has_static("bump"));
        assert!(class.has_static("reset"));
        assert!(!class.is_model());

        let bump = class.static_method("bump").unwrap();
        bump(Args::default(), job()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_model_call_reports_missing_record() {
        let registry = Registry::new().model::<i64, _, _>(
            "Post",
            |id| async move {
                Ok(match id {
                    RecordId::Int(1) => Some(1),
                    _ => None,
                })
            },
            |m| m.method("publish", |_post, _args, _job| async { Ok(()) }),
        );

        let class = registry.lookup("Post").unwrap();
        assert!(class.has_instance("publish"));
        assert!(!class.has_instance("archive"));

        let found = class
            .call_instance(&RecordId::Int(1), "publish", Args::default(), job())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, ModelCall::Invoked);

        let missing = class
            .call_instance(&RecordId::Int(2), "publish", Args::default(), job())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(missing, ModelCall::RecordMissing);
    }

    #[test]
    fn test_static_method_error_passes_through() {
        let registry = Registry::new().service("services/Boom", |s| {
            s.method("go", |_args, _job| async { Err(anyhow::anyhow!("boom")) })
        });

        let go = registry
            .lookup("services/Boom")
            .and_then(|class| class.static_method("go"))
            .unwrap();
        let err = tokio_test::block_on(go(Args::default(), job())).unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_global_names_sorted() {
        let registry = Registry::new()
            .service("b", |s| s)
            .service("a", |s| s);
        assert_eq!(registry.global_names(), vec!["a", "b"]);
        assert_eq!(registry.len(), 2);
    }
}
