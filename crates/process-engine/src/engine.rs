//! Command driver
//!
//! Every public mutation on [`ProcessEngine`] is one command. A command
//! snapshots the arena, seeds the agenda, drains it until the instance
//! reaches wait states, and then either commits or rolls back:
//!
//! - **commit**: changed executions are flushed to the execution store,
//!   buffered timer requests go to the timer service and buffered history
//!   events to the history sink.
//! - **rollback**: the arena is restored from the checkpoint and buffered
//!   effects are dropped.
//!
//! [`SharedProcessEngine`] puts the engine behind an async mutex so timer
//! and signal deliveries arriving concurrently run one command at a time.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};

use crate::behavior::{self, operation};
use crate::config::EngineConfig;
use crate::error::{ProcessEngineError, Result};
use crate::events::{HistoryEvent, HistorySink, NullHistorySink};
use crate::expression::{ExpressionEvaluator, SimpleExpressionEvaluator};
use crate::handler::{HandlerRegistry, TaskHandler};
use crate::model::{ProcessDefinition, ProcessRepository};
use crate::runtime::{
    persistence, Checkpoint, CommandContext, CommandOutput, EventSubscription, Execution,
    ExecutionId, ExecutionStore, ExecutionTree, InMemoryStore, JobId, NoopTimerService,
    Operation, TimerJob, TimerRequest, TimerService,
};

/// Process variables passed into a command
pub type Variables = BTreeMap<String, Value>;

enum Command {
    Start {
        definition: Arc<ProcessDefinition>,
        variables: Variables,
    },
    Trigger {
        execution: ExecutionId,
        variables: Variables,
    },
    Signal {
        name: String,
        variables: Variables,
    },
    Message {
        execution: ExecutionId,
        name: String,
        variables: Variables,
    },
    FireJob(JobId),
    Delete {
        process_instance_id: ExecutionId,
        reason: String,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start-process-instance",
            Self::Trigger { .. } => "trigger",
            Self::Signal { .. } => "signal-event-received",
            Self::Message { .. } => "message-event-received",
            Self::FireJob(_) => "fire-job",
            Self::Delete { .. } => "delete-process-instance",
        }
    }
}

enum Outcome {
    Started(ExecutionId),
    Delivered(usize),
    Done,
}

/// Runs process instances of deployed definitions
pub struct ProcessEngine {
    config: EngineConfig,
    repository: ProcessRepository,
    tree: ExecutionTree,
    handlers: HandlerRegistry,
    evaluator: Arc<dyn ExpressionEvaluator>,
    timer_service: Arc<dyn TimerService>,
    history: Arc<dyn HistorySink>,
    store: Box<dyn ExecutionStore>,
}

impl Default for ProcessEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessEngine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            config,
            repository: ProcessRepository::new(),
            tree: ExecutionTree::new(),
            handlers: HandlerRegistry::new(),
            evaluator: Arc::new(SimpleExpressionEvaluator::new()),
            timer_service: Arc::new(NoopTimerService),
            history: Arc::new(NullHistorySink),
            store: Box::new(InMemoryStore::new()),
        }
    }

    pub fn with_repository(mut self, repository: ProcessRepository) -> Self {
        self.repository = repository;
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers.merge(handlers);
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_timer_service(mut self, timer_service: Arc<dyn TimerService>) -> Self {
        self.timer_service = timer_service;
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = history;
        self
    }

    pub fn with_store(mut self, store: Box<dyn ExecutionStore>) -> Self {
        self.store = store;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn repository(&self) -> &ProcessRepository {
        &self.repository
    }

    /// Validate and deploy a definition; returns its `key:version` id
    pub fn deploy(&mut self, definition: ProcessDefinition) -> Result<String> {
        self.repository.deploy(definition)
    }

    pub fn register_handler(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.register(name, handler);
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Start the latest version of a definition
    pub async fn start_process_instance_by_key(
        &mut self,
        key: &str,
        variables: Variables,
    ) -> Result<ExecutionId> {
        let definition = self.repository.latest_by_key(key)?;
        self.start(definition, variables).await
    }

    pub async fn start_process_instance_by_id(
        &mut self,
        definition_id: &str,
        variables: Variables,
    ) -> Result<ExecutionId> {
        let definition = self.repository.require(definition_id)?;
        self.start(definition, variables).await
    }

    async fn start(
        &mut self,
        definition: Arc<ProcessDefinition>,
        variables: Variables,
    ) -> Result<ExecutionId> {
        match self.run(Command::Start { definition, variables }).await? {
            Outcome::Started(id) => Ok(id),
            _ => Err(ProcessEngineError::invalid_state("start command did not start an instance")),
        }
    }

    /// Resume an execution waiting in a wait state
    pub async fn trigger(&mut self, execution: ExecutionId, variables: Variables) -> Result<()> {
        self.run(Command::Trigger { execution, variables }).await?;
        Ok(())
    }

    /// Broadcast a signal to every subscribed execution
    ///
    /// Returns how many subscriptions received it.
    pub async fn signal_event_received(&mut self, name: &str, variables: Variables) -> Result<usize> {
        let command = Command::Signal {
            name: name.to_string(),
            variables,
        };
        match self.run(command).await? {
            Outcome::Delivered(count) => Ok(count),
            _ => Ok(0),
        }
    }

    /// Deliver a message to one execution's message subscription
    pub async fn message_event_received(
        &mut self,
        execution: ExecutionId,
        name: &str,
        variables: Variables,
    ) -> Result<()> {
        let command = Command::Message {
            execution,
            name: name.to_string(),
            variables,
        };
        self.run(command).await?;
        Ok(())
    }

    /// Called by the timer service when a job is due
    pub async fn fire_job(&mut self, job_id: &JobId) -> Result<()> {
        self.run(Command::FireJob(job_id.clone())).await?;
        Ok(())
    }

    pub async fn delete_process_instance(
        &mut self,
        process_instance_id: ExecutionId,
        reason: &str,
    ) -> Result<()> {
        let command = Command::Delete {
            process_instance_id,
            reason: reason.to_string(),
        };
        self.run(command).await?;
        Ok(())
    }

    /// Write a variable outside a command; flushed with the next commit
    pub fn set_variable(&mut self, execution: ExecutionId, name: &str, value: Value) -> Result<()> {
        self.tree.set_variable(execution, name, value)
    }

    async fn run(&mut self, command: Command) -> Result<Outcome> {
        let label = command.name();
        let checkpoint = if self.config.rollback_on_error {
            Some(Checkpoint::capture(
                &self.tree,
                self.config.checkpoint_compression_level,
            )?)
        } else {
            None
        };

        let (result, output) = {
            let mut ctx = CommandContext::new(
                &mut self.tree,
                &self.repository,
                self.evaluator.as_ref(),
                &self.handlers,
                &self.config,
            );
            let result = match seed(&mut ctx, command) {
                Ok(outcome) => drain(&mut ctx).await.map(|_| outcome),
                Err(e) => Err(e),
            };
            (result, ctx.finish())
        };
        self.conclude(label, checkpoint, result, output)
    }

    fn conclude(
        &mut self,
        label: &str,
        checkpoint: Option<Checkpoint>,
        result: Result<Outcome>,
        output: CommandOutput,
    ) -> Result<Outcome> {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.rollback(label, checkpoint, &e)?;
                return Err(e);
            }
        };

        let changes = self.tree.take_changes();
        if let Err(e) = persistence::flush(self.store.as_mut(), &mut self.tree, &changes) {
            self.rollback(label, checkpoint, &e)?;
            return Err(e);
        }

        for request in output.timer_requests {
            match request {
                TimerRequest::Schedule(job) => self.timer_service.schedule(&job),
                TimerRequest::Cancel(job_id) => self.timer_service.cancel(&job_id),
            }
        }
        for event in output.history {
            if let Err(e) = self.history.record(event) {
                log::warn!("Dropped history event: {}", e);
            }
        }
        log::debug!(
            "Command '{}' committed after {} operations",
            label,
            output.operations
        );
        Ok(outcome)
    }

    fn rollback(
        &mut self,
        label: &str,
        checkpoint: Option<Checkpoint>,
        error: &ProcessEngineError,
    ) -> Result<()> {
        match checkpoint {
            Some(checkpoint) => {
                self.tree = checkpoint.restore()?;
                log::warn!("Command '{}' rolled back: {}", label, error);
            }
            None => {
                log::warn!("Command '{}' failed; state kept as is: {}", label, error);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn execution(&self, id: ExecutionId) -> Option<&Execution> {
        self.tree.find(id)
    }

    pub fn executions_of(&self, process_instance_id: ExecutionId) -> Vec<&Execution> {
        self.tree.instance_executions(process_instance_id)
    }

    /// Active executions of an instance positioned at a node
    pub fn active_executions_at(&self, process_instance_id: ExecutionId, node_id: &str) -> Vec<ExecutionId> {
        self.tree
            .instance_executions(process_instance_id)
            .into_iter()
            .filter(|e| e.is_active && e.node() == Some(node_id))
            .map(|e| e.id)
            .collect()
    }

    /// Nodes where the instance's active leaf executions sit, sorted
    pub fn active_node_ids(&self, process_instance_id: ExecutionId) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .tree
            .instance_executions(process_instance_id)
            .into_iter()
            .filter(|e| e.is_active && e.children.is_empty())
            .filter_map(|e| e.node_id.clone())
            .collect();
        nodes.sort();
        nodes
    }

    /// Variables visible from an execution
    pub fn variables(&self, execution: ExecutionId) -> Variables {
        self.tree.variables(execution)
    }

    pub fn get_variable(&self, execution: ExecutionId, name: &str) -> Option<&Value> {
        self.tree.get_variable(execution, name)
    }

    pub fn subscriptions(&self, process_instance_id: ExecutionId) -> Vec<&EventSubscription> {
        self.tree
            .subscriptions()
            .filter(|s| s.process_instance_id == process_instance_id)
            .collect()
    }

    pub fn jobs(&self, process_instance_id: ExecutionId) -> Vec<&TimerJob> {
        self.tree
            .jobs()
            .filter(|j| j.process_instance_id == process_instance_id)
            .collect()
    }

    pub fn is_ended(&self, process_instance_id: ExecutionId) -> bool {
        self.tree.is_ended(process_instance_id)
    }

    pub fn process_instances(&self) -> Vec<ExecutionId> {
        self.tree.process_instances()
    }

    pub fn tree(&self) -> &ExecutionTree {
        &self.tree
    }

    pub fn store(&self) -> &dyn ExecutionStore {
        self.store.as_ref()
    }

    pub fn store_mut(&mut self) -> &mut dyn ExecutionStore {
        self.store.as_mut()
    }
}

/// Plan the first operations of a command
fn seed(ctx: &mut CommandContext<'_>, command: Command) -> Result<Outcome> {
    match command {
        Command::Start {
            definition,
            variables,
        } => {
            let start = definition.start_event(None).ok_or_else(|| {
                ProcessEngineError::modeling(format!(
                    "process '{}' has no none start event",
                    definition.id
                ))
            })?;
            let root = ctx.tree.create_process_instance(&definition.id, &start.id);
            for (name, value) in variables {
                ctx.tree.set_variable_local(root, &name, value)?;
            }
            ctx.record(HistoryEvent::ProcessStarted {
                process_instance_id: root,
                definition_id: definition.id.clone(),
                super_execution_id: None,
            });
            log::info!("Started process instance {} of '{}'", root, definition.id);
            ctx.agenda.plan_continue(root);
            Ok(Outcome::Started(root))
        }
        Command::Trigger {
            execution,
            variables,
        } => {
            ctx.tree.get(execution)?;
            ctx.plan(Operation::Trigger {
                execution,
                subscription: None,
                variables,
            });
            Ok(Outcome::Done)
        }
        Command::Signal { name, variables } => {
            let deliveries = behavior::throw_signal(ctx, &name, variables)?;
            Ok(Outcome::Delivered(deliveries))
        }
        Command::Message {
            execution,
            name,
            variables,
        } => {
            let subscription = ctx
                .tree
                .message_subscription(execution, &name)
                .ok_or(ProcessEngineError::NoMessageSubscription {
                    execution_id: execution,
                    message: name,
                })?;
            ctx.plan(Operation::Trigger {
                execution,
                subscription: Some(subscription),
                variables,
            });
            Ok(Outcome::Done)
        }
        Command::FireJob(job_id) => {
            let subscription = ctx
                .tree
                .subscription_by_job(&job_id)
                .ok_or_else(|| ProcessEngineError::JobNotFound(job_id.0.clone()))?;
            let execution = ctx
                .tree
                .subscription(subscription)
                .map(|s| s.execution_id)
                .ok_or_else(|| ProcessEngineError::JobNotFound(job_id.0.clone()))?;
            ctx.tree.remove_job(&job_id);
            log::debug!("Job '{}' fired for execution {}", job_id, execution);
            ctx.plan(Operation::Trigger {
                execution,
                subscription: Some(subscription),
                variables: Variables::new(),
            });
            Ok(Outcome::Done)
        }
        Command::Delete {
            process_instance_id,
            reason,
        } => {
            if !ctx.tree.get(process_instance_id)?.is_process_instance() {
                return Err(ProcessEngineError::invalid_state(format!(
                    "execution {} is not a process instance",
                    process_instance_id
                )));
            }
            operation::delete_process_instance(ctx, process_instance_id, &reason)?;
            Ok(Outcome::Done)
        }
    }
}

/// Pop and run operations until the agenda is empty
async fn drain(ctx: &mut CommandContext<'_>) -> Result<()> {
    while let Some(op) = ctx.agenda.next() {
        ctx.count_operation()?;
        let execution = op.execution();
        if !ctx.tree.contains(execution) {
            log::debug!(
                "Skipping {} on removed execution {}",
                op.name(),
                execution
            );
            continue;
        }
        log::debug!("Running {} on execution {}", op.name(), execution);
        behavior::run_operation(ctx, op).await?;
    }
    Ok(())
}

/// A `ProcessEngine` shared between tasks
///
/// Each call takes the engine lock for the whole command, so deliveries
/// for the same instance never interleave.
#[derive(Clone)]
pub struct SharedProcessEngine {
    inner: Arc<Mutex<ProcessEngine>>,
}

impl SharedProcessEngine {
    pub fn new(engine: ProcessEngine) -> Self {
        Self {
            inner: Arc::new(Mutex::new(engine)),
        }
    }

    /// Lock the engine for queries or several commands in a row
    pub async fn lock(&self) -> MutexGuard<'_, ProcessEngine> {
        self.inner.lock().await
    }

    pub async fn deploy(&self, definition: ProcessDefinition) -> Result<String> {
        self.inner.lock().await.deploy(definition)
    }

    pub async fn start_process_instance_by_key(
        &self,
        key: &str,
        variables: Variables,
    ) -> Result<ExecutionId> {
        self.inner
            .lock()
            .await
            .start_process_instance_by_key(key, variables)
            .await
    }

    pub async fn trigger(&self, execution: ExecutionId, variables: Variables) -> Result<()> {
        self.inner.lock().await.trigger(execution, variables).await
    }

    pub async fn signal_event_received(&self, name: &str, variables: Variables) -> Result<usize> {
        self.inner
            .lock()
            .await
            .signal_event_received(name, variables)
            .await
    }

    pub async fn message_event_received(
        &self,
        execution: ExecutionId,
        name: &str,
        variables: Variables,
    ) -> Result<()> {
        self.inner
            .lock()
            .await
            .message_event_received(execution, name, variables)
            .await
    }

    pub async fn fire_job(&self, job_id: &JobId) -> Result<()> {
        self.inner.lock().await.fire_job(job_id).await
    }

    pub async fn delete_process_instance(
        &self,
        process_instance_id: ExecutionId,
        reason: &str,
    ) -> Result<()> {
        self.inner
            .lock()
            .await
            .delete_process_instance(process_instance_id, reason)
            .await
    }
}
