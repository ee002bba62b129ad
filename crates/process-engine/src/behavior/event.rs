//! Intermediate events, boundary events, signals and error propagation

use std::collections::BTreeMap;

use serde_json::Value;

use super::compensation;
use crate::error::{ProcessEngineError, Result};
use crate::events::HistoryEvent;
use crate::model::{EventDefinition, FlowNode, NodeKind, ProcessDefinition};
use crate::runtime::{CommandContext, EventSubscription, ExecutionId, Operation};

/// Wait on the catch event's subscription
///
/// Definitions without a subscription (none events) pass straight through.
pub(crate) fn execute_catch(
    ctx: &mut CommandContext<'_>,
    execution: ExecutionId,
    node: &FlowNode,
) -> Result<()> {
    let NodeKind::IntermediateCatchEvent { event } = &node.kind else {
        return Err(ProcessEngineError::invalid_state(format!(
            "'{}' is not a catch event",
            node.id
        )));
    };
    if ctx.subscribe(execution, &node.id, event)?.is_none() {
        ctx.agenda.plan_leave(execution);
    }
    Ok(())
}

pub(crate) fn execute_throw(
    ctx: &mut CommandContext<'_>,
    execution: ExecutionId,
    node: &FlowNode,
) -> Result<()> {
    let NodeKind::IntermediateThrowEvent { event } = &node.kind else {
        return Err(ProcessEngineError::invalid_state(format!(
            "'{}' is not a throw event",
            node.id
        )));
    };
    match event {
        None => {
            ctx.agenda.plan_leave(execution);
            Ok(())
        }
        Some(EventDefinition::Signal { name }) => {
            throw_signal(ctx, name, BTreeMap::new())?;
            ctx.agenda.plan_leave(execution);
            Ok(())
        }
        Some(EventDefinition::Compensate { activity_ref }) => {
            compensation::throw(ctx, execution, node, activity_ref.clone())
        }
        Some(other) => Err(ProcessEngineError::modeling(format!(
            "intermediate throw event '{}' cannot throw {:?}",
            node.id, other
        ))),
    }
}

/// A catch event fired
///
/// An execution waiting at an event-based gateway moves onto the catch
/// event that won; the subscriptions of the losing events go away.
pub(crate) fn trigger_catch(
    ctx: &mut CommandContext<'_>,
    definition: &ProcessDefinition,
    execution: ExecutionId,
    node: &FlowNode,
) -> Result<()> {
    let current = ctx.node_of(execution)?;
    let at_gateway = matches!(
        definition.require_node(&current)?.kind,
        NodeKind::EventBasedGateway
    );

    if at_gateway {
        ctx.cancel_event_subscriptions(execution);
        ctx.tree.get_mut(execution)?.node_id = Some(node.id.clone());
        ctx.record_activity_started(execution, &node.id, node.kind.label());
        log::debug!(
            "Event-based gateway '{}' resolved to '{}' on execution {}",
            current,
            node.id,
            execution
        );
    } else {
        let consumed: Vec<_> = ctx
            .tree
            .subscriptions_of(execution)
            .into_iter()
            .filter(|s| s.node_id == node.id && !s.is_compensation())
            .map(|s| s.id)
            .collect();
        for id in consumed {
            ctx.cancel_subscription(id);
        }
    }
    ctx.agenda.plan_leave(execution);
    Ok(())
}

/// A boundary event fired on the scope execution that carries it
pub(crate) fn trigger_boundary(
    ctx: &mut CommandContext<'_>,
    scope: ExecutionId,
    subscription: &EventSubscription,
    boundary: &FlowNode,
) -> Result<()> {
    let NodeKind::BoundaryEvent {
        attached_to,
        cancel_activity,
        ..
    } = &boundary.kind
    else {
        return Err(ProcessEngineError::invalid_state(format!(
            "'{}' is not a boundary event",
            boundary.id
        )));
    };
    ctx.cancel_subscription(subscription.id);

    if *cancel_activity {
        log::debug!(
            "Boundary event '{}' interrupts '{}' on scope {}",
            boundary.id,
            attached_to,
            scope
        );
        ctx.agenda.plan_destroy_scope(
            scope,
            format!("boundary event '{}' interrupted '{}'", boundary.id, attached_to),
        );
        leave_through_boundary(ctx, scope, boundary)?;
        return Ok(());
    }

    let parent = ctx.tree.get(scope)?.parent.ok_or_else(|| {
        ProcessEngineError::invalid_state(format!("boundary scope {} has no parent", scope))
    })?;
    let parent_exec = ctx.tree.get(parent)?;
    let root = match parent_exec.parent {
        Some(grandparent) if parent_exec.is_concurrent => grandparent,
        _ => parent,
    };
    let path = ctx.tree.create_concurrent_child(root)?;
    log::debug!(
        "Boundary event '{}' on '{}' forks execution {} under {}",
        boundary.id,
        attached_to,
        path,
        root
    );
    leave_through_boundary(ctx, path, boundary)
}

fn leave_through_boundary(
    ctx: &mut CommandContext<'_>,
    execution: ExecutionId,
    boundary: &FlowNode,
) -> Result<()> {
    {
        let e = ctx.tree.get_mut(execution)?;
        e.node_id = Some(boundary.id.clone());
        e.is_active = true;
    }
    ctx.record_activity_started(execution, &boundary.id, boundary.kind.label());
    ctx.agenda.plan_leave(execution);
    Ok(())
}

/// Broadcast a signal to every subscribed execution
///
/// Returns the number of deliveries planned. Catch events that subscribe
/// later in the same command still receive the signal once.
pub(crate) fn throw_signal(
    ctx: &mut CommandContext<'_>,
    name: &str,
    variables: BTreeMap<String, Value>,
) -> Result<usize> {
    ctx.mark_signal_fired(name);
    let targets: Vec<(ExecutionId, _)> = ctx
        .tree
        .signal_subscriptions(name)
        .into_iter()
        .filter_map(|id| ctx.tree.subscription(id).map(|s| (s.execution_id, id)))
        .collect();
    let deliveries = targets.len();
    for (execution, id) in targets {
        ctx.plan(Operation::Trigger {
            execution,
            subscription: Some(id),
            variables: variables.clone(),
        });
    }
    log::debug!("Signal '{}' delivered to {} subscriptions", name, deliveries);
    ctx.record(HistoryEvent::SignalThrown {
        signal: name.to_string(),
        deliveries,
    });
    Ok(deliveries)
}

/// Route a business error to the nearest matching error boundary
///
/// Scopes are searched from the throwing execution outwards and across
/// call activity links. A boundary with the exact code wins over a
/// catch-all one on the same scope.
pub(crate) fn propagate_error(
    ctx: &mut CommandContext<'_>,
    execution: ExecutionId,
    code: &str,
    message: &str,
) -> Result<()> {
    let mut current = execution;
    loop {
        for id in ctx.tree.ancestors_or_self(current) {
            let e = ctx.tree.get(id)?;
            if !e.is_scope || e.is_loop_instance() {
                continue;
            }
            let Some(scope_node) = e.scope_node.clone() else {
                continue;
            };
            let definition = ctx.definition_of(id)?;
            let Some(boundary) = error_boundary(&definition, &scope_node, code) else {
                continue;
            };
            log::debug!(
                "Error '{}' thrown by {} caught by '{}' on scope {}",
                code,
                execution,
                boundary.id,
                id
            );
            ctx.agenda.plan_destroy_scope(
                id,
                format!("error '{}' caught by '{}'", code, boundary.id),
            );
            return leave_through_boundary(ctx, id, boundary);
        }

        let process_instance_id = ctx.tree.get(current)?.process_instance_id;
        match ctx.tree.get(process_instance_id)?.super_execution {
            Some(super_execution) if ctx.tree.contains(super_execution) => {
                current = super_execution;
            }
            _ => {
                return Err(ProcessEngineError::UnhandledError {
                    code: code.to_string(),
                    message: message.to_string(),
                })
            }
        }
    }
}

fn error_boundary<'d>(
    definition: &'d ProcessDefinition,
    activity: &str,
    code: &str,
) -> Option<&'d FlowNode> {
    let mut catch_all = None;
    for boundary in definition.boundary_events(activity) {
        if let NodeKind::BoundaryEvent {
            event: EventDefinition::Error { code: expected },
            ..
        } = &boundary.kind
        {
            match expected.as_deref() {
                Some(expected) if expected == code => return Some(boundary),
                None if catch_all.is_none() => catch_all = Some(boundary),
                _ => {}
            }
        }
    }
    catch_all
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::builder::ProcessBuilder;

    #[test]
    fn test_error_boundary_prefers_exact_code() {
        let def = ProcessBuilder::new("errors", "Errors")
            .start_event("start")
            .service_task("work", "worker")
            .error_boundary_event("any", "work", None)
            .error_boundary_event("declined", "work", Some("DECLINED"))
            .end_event("end")
            .flow("start", "work")
            .flow("work", "end")
            .build();

        assert_eq!(error_boundary(&def, "work", "DECLINED").unwrap().id, "declined");
        assert_eq!(error_boundary(&def, "work", "OTHER").unwrap().id, "any");
        assert!(error_boundary(&def, "end", "DECLINED").is_none());
    }
}
