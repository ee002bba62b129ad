//! Per-command working state
//!
//! A `CommandContext` lives for exactly one engine command. It borrows the
//! arena and the engine's collaborators, owns the agenda, and buffers every
//! outward effect (timer requests, history events) until the command
//! commits. Signal markers for the command live here too, never in global
//! state.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use super::agenda::{Agenda, Operation};
use super::execution::ExecutionId;
use super::subscription::{SubscriptionId, SubscriptionKind};
use super::timer::{JobId, TimerJob, TimerRequest};
use super::tree::{ExecutionTree, Removed};
use crate::config::EngineConfig;
use crate::error::{ProcessEngineError, Result};
use crate::events::HistoryEvent;
use crate::expression::{ExpressionEvaluator, VariableScope};
use crate::handler::HandlerRegistry;
use crate::model::{EventDefinition, ProcessDefinition, ProcessRepository};

/// Variables visible from one execution, resolved lazily
pub struct ExecutionVariables<'t> {
    tree: &'t ExecutionTree,
    execution: ExecutionId,
}

impl<'t> ExecutionVariables<'t> {
    pub fn new(tree: &'t ExecutionTree, execution: ExecutionId) -> Self {
        Self { tree, execution }
    }
}

impl VariableScope for ExecutionVariables<'_> {
    fn variable(&self, name: &str) -> Option<Value> {
        self.tree.get_variable(self.execution, name).cloned()
    }
}

/// Effects released when a command commits
#[derive(Debug, Default)]
pub struct CommandOutput {
    pub timer_requests: Vec<TimerRequest>,
    pub history: Vec<HistoryEvent>,
    pub operations: u32,
}

pub struct CommandContext<'a> {
    pub tree: &'a mut ExecutionTree,
    pub repository: &'a ProcessRepository,
    pub evaluator: &'a dyn ExpressionEvaluator,
    pub handlers: &'a HandlerRegistry,
    pub config: &'a EngineConfig,
    pub agenda: Agenda,
    /// Signals thrown during this command
    fired_signals: HashSet<String>,
    /// (execution, catching node) pairs that already consumed a signal
    delivered: HashSet<(ExecutionId, String)>,
    timer_requests: Vec<TimerRequest>,
    history: Vec<HistoryEvent>,
    operations: u32,
}

impl<'a> CommandContext<'a> {
    pub fn new(
        tree: &'a mut ExecutionTree,
        repository: &'a ProcessRepository,
        evaluator: &'a dyn ExpressionEvaluator,
        handlers: &'a HandlerRegistry,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            tree,
            repository,
            evaluator,
            handlers,
            config,
            agenda: Agenda::new(),
            fired_signals: HashSet::new(),
            delivered: HashSet::new(),
            timer_requests: Vec::new(),
            history: Vec::new(),
            operations: 0,
        }
    }

    pub fn plan(&mut self, operation: Operation) {
        self.agenda.plan(operation);
    }

    /// Count one driver step against the configured limit
    pub fn count_operation(&mut self) -> Result<()> {
        self.operations += 1;
        if self.operations > self.config.max_operations_per_command {
            return Err(ProcessEngineError::OperationLimitExceeded(
                self.config.max_operations_per_command,
            ));
        }
        Ok(())
    }

    /// Definition the execution's instance runs
    pub fn definition_of(&self, execution: ExecutionId) -> Result<Arc<ProcessDefinition>> {
        let definition_id = &self.tree.get(execution)?.definition_id;
        self.repository.require(definition_id)
    }

    /// Current node id of an execution
    pub fn node_of(&self, execution: ExecutionId) -> Result<String> {
        self.tree.get(execution)?.node_id.clone().ok_or_else(|| {
            ProcessEngineError::invalid_state(format!(
                "execution {} is not positioned at a node",
                execution
            ))
        })
    }

    pub fn record(&mut self, event: HistoryEvent) {
        if self.config.history_enabled {
            self.history.push(event);
        }
    }

    pub fn record_activity_started(&mut self, execution: ExecutionId, node_id: &str, node_type: &str) {
        if let Some(process_instance_id) = self.tree.find(execution).map(|e| e.process_instance_id) {
            self.record(HistoryEvent::ActivityStarted {
                process_instance_id,
                execution_id: execution,
                node_id: node_id.to_string(),
                node_type: node_type.to_string(),
            });
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    pub fn evaluate(&self, execution: ExecutionId, expression: &str) -> Result<Value> {
        let scope = ExecutionVariables::new(&*self.tree, execution);
        self.evaluator.evaluate(expression, &scope)
    }

    pub fn evaluate_condition(&self, execution: ExecutionId, expression: &str) -> Result<bool> {
        let scope = ExecutionVariables::new(&*self.tree, execution);
        self.evaluator.evaluate_condition(expression, &scope)
    }

    /// Whether skip expressions are switched on for this execution
    pub fn skip_expressions_enabled(&self, execution: ExecutionId) -> bool {
        self.tree
            .get_variable(execution, &self.config.skip_expressions_variable)
            .map(crate::expression::is_truthy)
            .unwrap_or(false)
    }

    pub fn set_variables(
        &mut self,
        execution: ExecutionId,
        variables: BTreeMap<String, Value>,
    ) -> Result<()> {
        for (name, value) in variables {
            self.tree.set_variable(execution, &name, value)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Subscriptions and timers
    // ------------------------------------------------------------------

    /// Create the subscription a catching node waits on
    ///
    /// Returns `None` for event kinds that need no subscription. A signal
    /// subscription created after the signal was thrown in this command is
    /// triggered right away, once per execution and node.
    pub fn subscribe(
        &mut self,
        execution: ExecutionId,
        node_id: &str,
        event: &EventDefinition,
    ) -> Result<Option<SubscriptionId>> {
        let id = match event {
            EventDefinition::Signal { name } => {
                let id = self.tree.add_subscription(
                    SubscriptionKind::Signal,
                    name,
                    execution,
                    node_id,
                    None,
                )?;
                if self.fired_signals.contains(name)
                    && !self.delivered.contains(&(execution, node_id.to_string()))
                {
                    log::debug!(
                        "Signal '{}' already fired in this command; triggering {}",
                        name,
                        execution
                    );
                    self.plan(Operation::Trigger {
                        execution,
                        subscription: Some(id),
                        variables: BTreeMap::new(),
                    });
                }
                id
            }
            EventDefinition::Message { name } => self.tree.add_subscription(
                SubscriptionKind::Message,
                name,
                execution,
                node_id,
                None,
            )?,
            EventDefinition::Timer(timer) => {
                let process_instance_id = self.tree.get(execution)?.process_instance_id;
                let job = TimerJob {
                    id: JobId::generate(),
                    execution_id: execution,
                    process_instance_id,
                    node_id: node_id.to_string(),
                    timer: timer.clone(),
                };
                let job_id = job.id.clone();
                self.tree.add_job(job.clone());
                self.timer_requests.push(TimerRequest::Schedule(job));
                self.tree.add_subscription(
                    SubscriptionKind::Timer,
                    node_id,
                    execution,
                    node_id,
                    Some(job_id.0),
                )?
            }
            _ => return Ok(None),
        };
        log::debug!(
            "Created subscription {} for node '{}' on execution {}",
            id,
            node_id,
            execution
        );
        Ok(Some(id))
    }

    /// Delete a subscription and the job behind it
    pub fn cancel_subscription(&mut self, id: SubscriptionId) {
        if let Some(sub) = self.tree.remove_subscription(id) {
            log::debug!("Deleted subscription {} ({})", id, sub.event_name);
            if sub.kind == SubscriptionKind::Timer {
                if let Some(job_id) = sub.configuration.map(JobId) {
                    self.cancel_job(&job_id);
                }
            }
        }
    }

    fn cancel_job(&mut self, job_id: &JobId) {
        if self.tree.remove_job(job_id).is_some() {
            self.timer_requests.push(TimerRequest::Cancel(job_id.clone()));
        }
    }

    /// Cancel the event subscriptions and jobs of an execution
    ///
    /// Compensation subscriptions survive; they belong to completed work.
    pub fn cancel_event_subscriptions(&mut self, execution: ExecutionId) {
        let ids: Vec<SubscriptionId> = self
            .tree
            .subscriptions_of(execution)
            .into_iter()
            .filter(|s| !s.is_compensation())
            .map(|s| s.id)
            .collect();
        for id in ids {
            self.cancel_subscription(id);
        }
        let jobs: Vec<JobId> = self
            .tree
            .jobs_of(execution)
            .into_iter()
            .map(|j| j.id.clone())
            .collect();
        for job in jobs {
            self.cancel_job(&job);
        }
    }

    pub fn mark_signal_fired(&mut self, name: &str) {
        self.fired_signals.insert(name.to_string());
    }

    pub fn mark_signal_delivered(&mut self, execution: ExecutionId, node_id: &str) {
        self.delivered.insert((execution, node_id.to_string()));
    }

    // ------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------

    /// Remove an execution subtree, cancelling its jobs and recording the deletion
    pub fn remove_execution(&mut self, execution: ExecutionId, reason: Option<&str>) -> Result<Removed> {
        let removed = self.tree.remove(execution)?;
        for job in &removed.jobs {
            self.timer_requests.push(TimerRequest::Cancel(job.clone()));
        }
        if let Some(reason) = reason {
            for exec in &removed.executions {
                self.record(HistoryEvent::ExecutionDeleted {
                    process_instance_id: exec.process_instance_id,
                    execution_id: exec.id,
                    node_id: exec.node_id.clone(),
                    reason: reason.to_string(),
                });
            }
        }
        Ok(removed)
    }

    pub fn finish(self) -> CommandOutput {
        CommandOutput {
            timer_requests: self.timer_requests,
            history: self.history,
            operations: self.operations,
        }
    }
}
