//! Pending operations of a command
//!
//! Behaviors never call each other directly. They plan operations on the
//! agenda and the engine's driver loop pops them in FIFO order until the
//! command reaches a wait state.

use std::collections::{BTreeMap, VecDeque};

use serde_json::Value;

use super::execution::ExecutionId;
use super::subscription::SubscriptionId;

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Enter the node the execution was moved to
    Continue { execution: ExecutionId },
    /// Run the wrapped behavior of a multi-instance iteration
    ExecuteInner { execution: ExecutionId },
    /// Leave the current node through its behavior
    Leave { execution: ExecutionId },
    /// Move along the given sequence flows, reusing `recyclable` executions
    TakeFlows {
        execution: ExecutionId,
        flows: Vec<String>,
        recyclable: Vec<ExecutionId>,
    },
    /// Wake a waiting execution, optionally through one of its subscriptions
    Trigger {
        execution: ExecutionId,
        subscription: Option<SubscriptionId>,
        variables: BTreeMap<String, Value>,
    },
    /// Delete everything below a scope execution
    DestroyScope {
        execution: ExecutionId,
        reason: String,
    },
    /// A path reached a node with nowhere to go
    End { execution: ExecutionId },
    /// All paths inside a scope are done
    CompleteScope { execution: ExecutionId },
    /// Run compensation handlers registered on a scope
    Compensate {
        thrower: ExecutionId,
        scope_execution: ExecutionId,
        activity_ref: Option<String>,
    },
}

impl Operation {
    /// Execution the operation acts on; skipped once it no longer exists
    pub fn execution(&self) -> ExecutionId {
        match self {
            Self::Continue { execution }
            | Self::ExecuteInner { execution }
            | Self::Leave { execution }
            | Self::TakeFlows { execution, .. }
            | Self::Trigger { execution, .. }
            | Self::DestroyScope { execution, .. }
            | Self::End { execution }
            | Self::CompleteScope { execution } => *execution,
            Self::Compensate { thrower, .. } => *thrower,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Continue { .. } => "continue",
            Self::ExecuteInner { .. } => "execute-inner",
            Self::Leave { .. } => "leave",
            Self::TakeFlows { .. } => "take-flows",
            Self::Trigger { .. } => "trigger",
            Self::DestroyScope { .. } => "destroy-scope",
            Self::End { .. } => "end",
            Self::CompleteScope { .. } => "complete-scope",
            Self::Compensate { .. } => "compensate",
        }
    }
}

/// FIFO queue of planned operations
#[derive(Debug, Default)]
pub struct Agenda {
    queue: VecDeque<Operation>,
}

impl Agenda {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(&mut self, operation: Operation) {
        log::debug!(
            "Planning {} on execution {}",
            operation.name(),
            operation.execution()
        );
        self.queue.push_back(operation);
    }

    pub fn next(&mut self) -> Option<Operation> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn plan_continue(&mut self, execution: ExecutionId) {
        self.plan(Operation::Continue { execution });
    }

    pub fn plan_leave(&mut self, execution: ExecutionId) {
        self.plan(Operation::Leave { execution });
    }

    pub fn plan_end(&mut self, execution: ExecutionId) {
        self.plan(Operation::End { execution });
    }

    pub fn plan_take_flows(
        &mut self,
        execution: ExecutionId,
        flows: Vec<String>,
        recyclable: Vec<ExecutionId>,
    ) {
        self.plan(Operation::TakeFlows {
            execution,
            flows,
            recyclable,
        });
    }

    pub fn plan_destroy_scope(&mut self, execution: ExecutionId, reason: impl Into<String>) {
        self.plan(Operation::DestroyScope {
            execution,
            reason: reason.into(),
        });
    }
}
