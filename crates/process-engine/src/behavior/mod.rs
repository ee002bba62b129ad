//! Node behaviors
//!
//! Every flow node maps to one [`Behavior`]. The driver loop in the engine
//! pops agenda operations and hands them to [`run_operation`], which
//! dispatches to the behavior family modules:
//!
//! - `router`: default leave, evaluating outgoing sequence flows
//! - `gateway`: exclusive, parallel, inclusive and event-based gateways
//! - `multi_instance`: sequential and parallel loops around an inner behavior
//! - `event`: catching, boundary triggering, signals and error propagation
//! - `compensation`: compensate throws, cancel and terminate end events
//! - `activity`: tasks and end events
//! - `subprocess`: embedded sub-processes, transactions and call activities
//! - `operation`: the structural operations shaping the execution tree

mod activity;
mod compensation;
mod event;
mod gateway;
mod multi_instance;
pub(crate) mod operation;
mod router;
mod subprocess;

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{ProcessEngineError, Result};
use crate::model::{FlowNode, NodeKind, ProcessDefinition};
use crate::runtime::{
    CommandContext, EventSubscription, ExecutionId, LoopRole, Operation, SubscriptionId,
    SubscriptionKind,
};

pub(crate) use event::throw_signal;

/// Runtime behavior attached to a flow node
#[derive(Debug, Clone, PartialEq)]
pub enum Behavior {
    /// Start events, none tasks and none throw events
    PassThrough,
    /// User and receive tasks; resumed by a trigger
    WaitState,
    ServiceTask,
    ExclusiveGateway,
    ParallelGateway,
    InclusiveGateway,
    EventBasedGateway,
    IntermediateCatch,
    IntermediateThrow,
    End,
    Boundary,
    /// Embedded sub-processes and transactions
    SubProcess,
    CallActivity,
    /// Loop wrapper around the node's own behavior
    MultiInstance(Box<Behavior>),
}

impl Behavior {
    pub fn of(node: &FlowNode) -> Self {
        let base = match &node.kind {
            NodeKind::StartEvent | NodeKind::Task => Self::PassThrough,
            NodeKind::UserTask | NodeKind::ReceiveTask => Self::WaitState,
            NodeKind::ServiceTask { .. } => Self::ServiceTask,
            NodeKind::ExclusiveGateway => Self::ExclusiveGateway,
            NodeKind::ParallelGateway => Self::ParallelGateway,
            NodeKind::InclusiveGateway => Self::InclusiveGateway,
            NodeKind::EventBasedGateway => Self::EventBasedGateway,
            NodeKind::IntermediateCatchEvent { .. } => Self::IntermediateCatch,
            NodeKind::IntermediateThrowEvent { event: None } => Self::PassThrough,
            NodeKind::IntermediateThrowEvent { .. } => Self::IntermediateThrow,
            NodeKind::EndEvent { .. } => Self::End,
            NodeKind::BoundaryEvent { .. } => Self::Boundary,
            NodeKind::SubProcess | NodeKind::Transaction => Self::SubProcess,
            NodeKind::CallActivity { .. } => Self::CallActivity,
        };
        if node.loop_characteristics.is_some() {
            Self::MultiInstance(Box::new(base))
        } else {
            base
        }
    }

    /// The behavior a single iteration runs
    pub fn inner(self) -> Self {
        match self {
            Self::MultiInstance(inner) => *inner,
            other => other,
        }
    }
}

/// Run the behavior of the node an execution just entered
pub(crate) async fn execute(ctx: &mut CommandContext<'_>, execution: ExecutionId) -> Result<()> {
    let definition = ctx.definition_of(execution)?;
    let node_id = ctx.node_of(execution)?;
    let node = definition.require_node(&node_id)?;
    let behavior = Behavior::of(node);
    let is_loop_root = ctx.tree.get(execution)?.loop_role == Some(LoopRole::Root);

    match behavior {
        Behavior::MultiInstance(_) if is_loop_root => multi_instance::execute(ctx, execution, node),
        behavior => execute_activity(ctx, &definition, execution, node, behavior.inner()).await,
    }
}

/// Run the inner behavior of a multi-instance iteration
async fn execute_inner(ctx: &mut CommandContext<'_>, execution: ExecutionId) -> Result<()> {
    let definition = ctx.definition_of(execution)?;
    let node_id = ctx.node_of(execution)?;
    let node = definition.require_node(&node_id)?;
    let behavior = Behavior::of(node).inner();
    execute_activity(ctx, &definition, execution, node, behavior).await
}

async fn execute_activity(
    ctx: &mut CommandContext<'_>,
    definition: &ProcessDefinition,
    execution: ExecutionId,
    node: &FlowNode,
    behavior: Behavior,
) -> Result<()> {
    match behavior {
        Behavior::PassThrough | Behavior::ExclusiveGateway | Behavior::Boundary => {
            ctx.agenda.plan_leave(execution);
            Ok(())
        }
        Behavior::WaitState => {
            log::debug!("Execution {} waits at '{}'", execution, node.id);
            Ok(())
        }
        Behavior::ServiceTask => activity::execute_service_task(ctx, execution, node).await,
        Behavior::ParallelGateway => gateway::execute_parallel(ctx, execution),
        Behavior::InclusiveGateway => gateway::execute_inclusive(ctx, execution),
        Behavior::EventBasedGateway => gateway::execute_event_based(ctx, execution),
        Behavior::IntermediateCatch => event::execute_catch(ctx, execution, node),
        Behavior::IntermediateThrow => event::execute_throw(ctx, execution, node),
        Behavior::End => activity::execute_end_event(ctx, definition, execution, node),
        Behavior::SubProcess => subprocess::execute_sub_process(ctx, definition, execution, node),
        Behavior::CallActivity => subprocess::execute_call_activity(ctx, execution, node),
        Behavior::MultiInstance(_) => Err(ProcessEngineError::invalid_state(format!(
            "nested multi-instance behavior at '{}'",
            node.id
        ))),
    }
}

/// Leave the current node the way its behavior prescribes
pub(crate) fn leave(ctx: &mut CommandContext<'_>, execution: ExecutionId) -> Result<()> {
    let definition = ctx.definition_of(execution)?;
    let node_id = ctx.node_of(execution)?;
    let node = definition.require_node(&node_id)?;

    match Behavior::of(node) {
        Behavior::MultiInstance(_) => multi_instance::leave(ctx, execution),
        Behavior::ExclusiveGateway => gateway::leave_exclusive(ctx, execution),
        _ => router::leave(ctx, execution),
    }
}

fn trigger(
    ctx: &mut CommandContext<'_>,
    execution: ExecutionId,
    subscription: Option<EventSubscription>,
) -> Result<()> {
    let definition = ctx.definition_of(execution)?;
    let node_id = match &subscription {
        Some(sub) => sub.node_id.clone(),
        None => ctx.node_of(execution)?,
    };
    let node = definition.require_node(&node_id)?;

    match (Behavior::of(node).inner(), subscription) {
        (Behavior::WaitState, _) => {
            ctx.agenda.plan_leave(execution);
            Ok(())
        }
        (Behavior::IntermediateCatch, _) => event::trigger_catch(ctx, &definition, execution, node),
        (Behavior::Boundary, Some(sub)) => event::trigger_boundary(ctx, execution, &sub, node),
        _ => Err(ProcessEngineError::invalid_state(format!(
            "execution {} at '{}' cannot be triggered",
            execution, node_id
        ))),
    }
}

/// Deliver an external or planned trigger
///
/// A trigger whose subscription was consumed in the meantime is dropped.
fn run_trigger(
    ctx: &mut CommandContext<'_>,
    execution: ExecutionId,
    subscription: Option<SubscriptionId>,
    variables: BTreeMap<String, Value>,
) -> Result<()> {
    let subscription = match subscription {
        Some(id) => match ctx.tree.subscription(id).cloned() {
            Some(sub) => Some(sub),
            None => {
                log::debug!(
                    "Subscription {} of execution {} is gone; trigger dropped",
                    id,
                    execution
                );
                return Ok(());
            }
        },
        None => {
            let e = ctx.tree.get(execution)?;
            if !e.is_active || !e.children.is_empty() {
                return Err(ProcessEngineError::invalid_state(format!(
                    "execution {} is not waiting at '{}'",
                    execution,
                    e.node().unwrap_or_default()
                )));
            }
            None
        }
    };
    if let Some(sub) = &subscription {
        if sub.kind == SubscriptionKind::Signal {
            ctx.mark_signal_delivered(execution, &sub.node_id);
        }
    }
    ctx.set_variables(execution, variables)?;
    trigger(ctx, execution, subscription)
}

/// Execute one agenda operation
pub(crate) async fn run_operation(ctx: &mut CommandContext<'_>, op: Operation) -> Result<()> {
    match op {
        Operation::Continue { execution } => operation::continue_process(ctx, execution).await,
        Operation::ExecuteInner { execution } => execute_inner(ctx, execution).await,
        Operation::Leave { execution } => leave(ctx, execution),
        Operation::TakeFlows {
            execution,
            flows,
            recyclable,
        } => operation::take_flows(ctx, execution, &flows, recyclable),
        Operation::Trigger {
            execution,
            subscription,
            variables,
        } => run_trigger(ctx, execution, subscription, variables),
        Operation::DestroyScope { execution, reason } => {
            operation::destroy_scope(ctx, execution, &reason)
        }
        Operation::End { execution } => operation::end(ctx, execution),
        Operation::CompleteScope { execution } => operation::complete_scope(ctx, execution),
        Operation::Compensate {
            thrower,
            scope_execution,
            activity_ref,
        } => {
            if !ctx.tree.contains(scope_execution) {
                log::debug!(
                    "Compensation scope {} is gone; skipping compensation for {}",
                    scope_execution,
                    thrower
                );
                return Ok(());
            }
            compensation::compensate(ctx, thrower, scope_execution, activity_ref.as_deref())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::builder::ProcessBuilder;

    #[test]
    fn test_behavior_mapping() {
        let def = ProcessBuilder::new("kinds", "Kinds")
            .start_event("start")
            .user_task("approve")
            .service_task("charge", "payment")
            .sequential_multi_instance("3")
            .signal_throw_event("notify", "done")
            .throw_event("marker", None)
            .end_event("end")
            .flow("start", "approve")
            .flow("approve", "charge")
            .flow("charge", "notify")
            .flow("notify", "marker")
            .flow("marker", "end")
            .build();

        let of = |id: &str| Behavior::of(def.node(id).unwrap());
        assert_eq!(of("start"), Behavior::PassThrough);
        assert_eq!(of("approve"), Behavior::WaitState);
        assert_eq!(
            of("charge"),
            Behavior::MultiInstance(Box::new(Behavior::ServiceTask))
        );
        assert_eq!(of("charge").inner(), Behavior::ServiceTask);
        assert_eq!(of("notify"), Behavior::IntermediateThrow);
        assert_eq!(of("marker"), Behavior::PassThrough);
        assert_eq!(of("end"), Behavior::End);
    }
}
