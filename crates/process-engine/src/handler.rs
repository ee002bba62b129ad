//! Service task handlers
//!
//! A service task names a handler; the engine looks it up in a
//! `HandlerRegistry` and awaits it with a `TaskContext`. Handlers read the
//! variables visible from the task's execution, write updates back, and can
//! raise a business fault that the engine turns into error propagation.
//!
//! # Usage
//!
//! ```ignore
//! let mut handlers = HandlerRegistry::new();
//! handlers.register_fn("approve", |mut ctx| async move {
//!     ctx.set("approved", serde_json::json!(true));
//!     Ok(ctx)
//! });
//! ```

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::runtime::ExecutionId;

/// Failure raised by a task handler
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TaskError {
    /// A business fault; caught by matching error boundary events
    #[error("business error '{code}': {message}")]
    Business { code: String, message: String },

    /// A technical failure; aborts the command
    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    pub fn business(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Business {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Data handed to a task handler
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub execution_id: ExecutionId,
    pub process_instance_id: ExecutionId,
    pub node_id: String,
    /// Snapshot of the variables visible from the execution
    pub variables: BTreeMap<String, Value>,
    /// Variables the handler wants written back
    updates: BTreeMap<String, Value>,
}

impl TaskContext {
    pub fn new(
        execution_id: ExecutionId,
        process_instance_id: ExecutionId,
        node_id: impl Into<String>,
        variables: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            execution_id,
            process_instance_id,
            node_id: node_id.into(),
            variables,
            updates: BTreeMap::new(),
        }
    }

    /// Read a variable, seeing the handler's own updates first
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.updates.get(name).or_else(|| self.variables.get(name))
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.updates.insert(name.into(), value);
    }

    pub fn updates(&self) -> &BTreeMap<String, Value> {
        &self.updates
    }

    pub fn into_updates(self) -> BTreeMap<String, Value> {
        self.updates
    }
}

/// Executes the work behind a service task
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, context: TaskContext) -> std::result::Result<TaskContext, TaskError>;
}

type HandlerFuture =
    Pin<Box<dyn Future<Output = std::result::Result<TaskContext, TaskError>> + Send>>;

/// Async closure wrapped as a `TaskHandler`
pub struct CallbackTaskHandler {
    callback: Box<dyn Fn(TaskContext) -> HandlerFuture + Send + Sync>,
}

impl CallbackTaskHandler {
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<TaskContext, TaskError>> + Send + 'static,
    {
        Self {
            callback: Box::new(move |ctx| Box::pin(callback(ctx))),
        }
    }
}

#[async_trait]
impl TaskHandler for CallbackTaskHandler {
    async fn execute(&self, context: TaskContext) -> std::result::Result<TaskContext, TaskError> {
        (self.callback)(context).await
    }
}

/// Registry of task handlers keyed by the name service tasks refer to
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one with the same name
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Register an async closure as a handler
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, callback: F)
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<TaskContext, TaskError>> + Send + 'static,
    {
        self.register(name, Arc::new(CallbackTaskHandler::new(callback)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Merge another registry into this one
    ///
    /// Entries from `other` win on name clashes.
    pub fn merge(&mut self, other: HandlerRegistry) {
        self.handlers.extend(other.handlers);
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}
