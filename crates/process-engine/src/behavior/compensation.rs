//! Compensation, transaction cancellation and termination
//!
//! Completed activities with a compensation boundary leave a compensate
//! subscription on their flow scope execution. A compensate throw runs the
//! handlers of those subscriptions, newest first, as concurrent children of
//! the scope; the thrower waits until the last handler ends.

use super::operation::flow_scope_execution;
use crate::error::{ProcessEngineError, Result};
use crate::events::HistoryEvent;
use crate::model::{EventDefinition, FlowNode, NodeKind, ProcessDefinition};
use crate::runtime::{CommandContext, ExecutionId, Operation};

/// Compensate throw or end event
pub(crate) fn throw(
    ctx: &mut CommandContext<'_>,
    execution: ExecutionId,
    node: &FlowNode,
    activity_ref: Option<String>,
) -> Result<()> {
    let scope = flow_scope_execution(&*ctx.tree, execution, node.parent.as_deref())?;
    log::debug!(
        "Execution {} throws compensation on scope {} ({:?})",
        execution,
        scope,
        activity_ref
    );
    ctx.plan(Operation::Compensate {
        thrower: execution,
        scope_execution: scope,
        activity_ref,
    });
    Ok(())
}

/// Start the handlers registered on a scope
///
/// The process instance root compensates every registered activity of the
/// instance, including those of nested scopes that already completed.
pub(crate) fn compensate(
    ctx: &mut CommandContext<'_>,
    thrower: ExecutionId,
    scope: ExecutionId,
    activity_ref: Option<&str>,
) -> Result<()> {
    let scope_exec = ctx.tree.get(scope)?;
    let registered = if scope_exec.parent.is_none() {
        ctx.tree.instance_compensate_subscriptions(scope_exec.process_instance_id)
    } else {
        ctx.tree.compensate_subscriptions(scope)
    };
    let candidates: Vec<_> = registered
        .into_iter()
        .filter(|id| match (activity_ref, ctx.tree.subscription(*id)) {
            (Some(activity), Some(sub)) => sub.node_id == activity,
            (None, Some(_)) => true,
            (_, None) => false,
        })
        .collect();

    if candidates.is_empty() {
        log::debug!("Nothing to compensate on scope {}", scope);
        ctx.tree.get_mut(thrower)?.is_active = true;
        ctx.agenda.plan_leave(thrower);
        return Ok(());
    }

    ctx.tree.get_mut(thrower)?.is_active = false;
    let mut handlers = Vec::with_capacity(candidates.len());
    for id in candidates.into_iter().rev() {
        let Some(sub) = ctx.tree.remove_subscription(id) else {
            continue;
        };
        let handler = sub.configuration.clone().ok_or_else(|| {
            ProcessEngineError::modeling(format!(
                "compensation of '{}' has no handler",
                sub.node_id
            ))
        })?;
        let path = ctx.tree.create_concurrent_child(scope)?;
        {
            let e = ctx.tree.get_mut(path)?;
            e.node_id = Some(handler.clone());
            e.compensation_for = Some(thrower);
            e.is_active = true;
        }
        ctx.record(HistoryEvent::CompensationStarted {
            process_instance_id: sub.process_instance_id,
            activity_id: sub.node_id.clone(),
            handler_id: handler,
        });
        handlers.push(path);
    }
    log::debug!(
        "Execution {} waits on {} compensation handlers",
        thrower,
        handlers.len()
    );
    for path in handlers {
        ctx.agenda.plan_continue(path);
    }
    Ok(())
}

/// Cancel end event: leave the enclosing transaction through its cancel
/// boundary after compensating what completed inside it
pub(crate) fn cancel_end(
    ctx: &mut CommandContext<'_>,
    definition: &ProcessDefinition,
    execution: ExecutionId,
    node: &FlowNode,
) -> Result<()> {
    let transaction = enclosing_transaction(definition, node)?;
    let scope = flow_scope_execution(&*ctx.tree, execution, Some(&transaction))?;
    let boundary = definition
        .boundary_events(&transaction)
        .find(|b| {
            matches!(
                b.kind,
                NodeKind::BoundaryEvent {
                    event: EventDefinition::Cancel,
                    ..
                }
            )
        })
        .ok_or_else(|| ProcessEngineError::MissingBoundaryTarget {
            node_id: transaction.clone(),
        })?;

    log::debug!(
        "Transaction '{}' cancelled on scope {}; leaving through '{}'",
        transaction,
        scope,
        boundary.id
    );
    ctx.agenda.plan_destroy_scope(scope, "transaction cancelled");
    {
        let e = ctx.tree.get_mut(scope)?;
        e.node_id = Some(boundary.id.clone());
        e.is_active = true;
    }
    ctx.record_activity_started(scope, &boundary.id, boundary.kind.label());
    ctx.plan(Operation::Compensate {
        thrower: scope,
        scope_execution: scope,
        activity_ref: None,
    });
    Ok(())
}

fn enclosing_transaction(definition: &ProcessDefinition, node: &FlowNode) -> Result<String> {
    let mut current = node.parent.as_deref();
    while let Some(id) = current {
        let container = definition.require_node(id)?;
        if container.kind == NodeKind::Transaction {
            return Ok(container.id.clone());
        }
        current = container.parent.as_deref();
    }
    Err(ProcessEngineError::modeling(format!(
        "cancel end event '{}' is not inside a transaction",
        node.id
    )))
}

/// Terminate end event: end every path of the flow scope at once
pub(crate) fn terminate_end(
    ctx: &mut CommandContext<'_>,
    execution: ExecutionId,
    node: &FlowNode,
) -> Result<()> {
    let scope = flow_scope_execution(&*ctx.tree, execution, node.parent.as_deref())?;
    log::debug!("Terminate end event '{}' ends scope {}", node.id, scope);
    ctx.agenda.plan_destroy_scope(scope, "terminate end event");
    ctx.plan(Operation::CompleteScope { execution: scope });
    Ok(())
}
