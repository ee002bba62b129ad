//! Structural agenda operations
//!
//! Entering nodes, taking sequence flows, ending paths and completing or
//! destroying scopes. These shape the execution tree; node-specific logic
//! lives in the sibling behavior modules.

use std::collections::VecDeque;

use super::{execute, subprocess};
use crate::error::{ProcessEngineError, Result};
use crate::events::HistoryEvent;
use crate::model::{NodeKind, ProcessDefinition, SequenceFlow};
use crate::runtime::{CommandContext, ExecutionId, ExecutionTree, LoopRole, Operation};

/// Scope execution that owns the nodes of `container` (`None` = process level)
pub(crate) fn flow_scope_execution(
    tree: &ExecutionTree,
    execution: ExecutionId,
    container: Option<&str>,
) -> Result<ExecutionId> {
    for id in tree.ancestors_or_self(execution) {
        let candidate = tree.get(id)?;
        let matches = match container {
            None => candidate.parent.is_none(),
            Some(container) => {
                candidate.is_scope
                    && candidate.scope_node.as_deref() == Some(container)
                    && candidate.loop_role != Some(LoopRole::Root)
            }
        };
        if matches {
            return Ok(id);
        }
    }
    Err(ProcessEngineError::MissingBoundaryTarget {
        node_id: container.unwrap_or_default().to_string(),
    })
}

/// Enter the node an execution was moved to
///
/// Scope nodes get a fresh child execution carrying the node's boundary
/// subscriptions; everything else runs on the execution itself.
pub(crate) async fn continue_process(ctx: &mut CommandContext<'_>, execution: ExecutionId) -> Result<()> {
    let definition = ctx.definition_of(execution)?;
    let node_id = ctx.node_of(execution)?;
    let node = definition.require_node(&node_id)?;

    let target = if definition.is_scope(node) {
        let scope = ctx.tree.create_child(execution)?;
        {
            let s = ctx.tree.get_mut(scope)?;
            s.is_scope = true;
            s.scope_node = Some(node_id.clone());
            if node.loop_characteristics.is_some() {
                s.loop_role = Some(LoopRole::Root);
            }
        }
        ctx.tree.get_mut(execution)?.is_active = false;
        let process_instance_id = ctx.tree.get(scope)?.process_instance_id;
        ctx.record(HistoryEvent::ScopeStarted {
            process_instance_id,
            execution_id: scope,
            parent_id: execution,
            node_id: node_id.clone(),
        });

        for boundary in definition.boundary_events(&node_id) {
            if let NodeKind::BoundaryEvent { event, .. } = &boundary.kind {
                ctx.subscribe(scope, &boundary.id, event)?;
            }
        }
        scope
    } else {
        execution
    };

    ctx.record_activity_started(target, &node_id, node.kind.label());
    execute(ctx, target).await
}

/// Move an execution along sequence flows
pub(crate) fn take_flows(
    ctx: &mut CommandContext<'_>,
    execution: ExecutionId,
    flow_ids: &[String],
    recyclable: Vec<ExecutionId>,
) -> Result<()> {
    let definition = ctx.definition_of(execution)?;
    let current = exit_completed_scopes(ctx, &definition, execution)?;
    let recyclable: Vec<ExecutionId> = recyclable
        .into_iter()
        .map(|id| if id == execution { current } else { id })
        .collect();

    let source = ctx.node_of(current)?;
    let process_instance_id = ctx.tree.get(current)?.process_instance_id;
    ctx.record(HistoryEvent::ActivityEnded {
        process_instance_id,
        execution_id: current,
        node_id: source.clone(),
    });
    register_compensation(ctx, &definition, current, &source)?;

    let flows = flow_ids
        .iter()
        .map(|id| {
            definition.flow(id).cloned().ok_or_else(|| {
                ProcessEngineError::modeling(format!("unknown sequence flow '{}'", id))
            })
        })
        .collect::<Result<Vec<SequenceFlow>>>()?;

    match flows.as_slice() {
        [] => {
            ctx.agenda.plan_end(current);
            Ok(())
        }
        [flow] if recyclable.is_empty() => take_flow(ctx, current, flow),
        _ => take_all(ctx, current, &flows, recyclable),
    }
}

fn take_flow(ctx: &mut CommandContext<'_>, execution: ExecutionId, flow: &SequenceFlow) -> Result<()> {
    let process_instance_id = {
        let e = ctx.tree.get_mut(execution)?;
        e.node_id = Some(flow.target.clone());
        e.is_active = true;
        e.process_instance_id
    };
    ctx.record(HistoryEvent::SequenceFlowTaken {
        process_instance_id,
        flow_id: flow.id.clone(),
        source: flow.source.clone(),
        target: flow.target.clone(),
    });
    ctx.agenda.plan_continue(execution);
    Ok(())
}

/// Fork or join-then-continue under the concurrent root
///
/// When every child of the root is parked at the same node and a single
/// flow leaves it, the children are pruned and the root itself continues.
/// Otherwise recyclable executions are reused for the outgoing flows,
/// new concurrent children are created for the rest, and unused
/// recyclable executions are removed.
fn take_all(
    ctx: &mut CommandContext<'_>,
    execution: ExecutionId,
    flows: &[SequenceFlow],
    recyclable: Vec<ExecutionId>,
) -> Result<()> {
    let root = ctx.tree.concurrent_root(execution)?;
    let node = ctx.node_of(execution)?;
    let children = ctx.tree.children(root)?.to_vec();

    let mut any_active = false;
    let mut all_parked_here = true;
    for child in &children {
        let c = ctx.tree.get(*child)?;
        if c.is_active {
            any_active = true;
        } else if c.node() != Some(node.as_str()) || !c.children.is_empty() {
            all_parked_here = false;
        }
    }

    if flows.len() == 1 && !any_active && all_parked_here {
        for child in children {
            ctx.remove_execution(child, None)?;
        }
        {
            let r = ctx.tree.get_mut(root)?;
            r.is_active = true;
            r.node_id = Some(node);
        }
        return take_flow(ctx, root, &flows[0]);
    }

    if root == execution {
        ctx.tree.get_mut(root)?.is_active = false;
    }
    let mut recyclable: VecDeque<ExecutionId> = recyclable
        .into_iter()
        .filter(|id| *id != root && ctx.tree.contains(*id))
        .collect();

    let mut outgoing = Vec::with_capacity(flows.len());
    for flow in flows {
        let path = match recyclable.pop_front() {
            Some(id) => id,
            None => ctx.tree.create_concurrent_child(root)?,
        };
        outgoing.push((path, flow));
    }
    for pruned in recyclable {
        ctx.remove_execution(pruned, None)?;
    }
    log::debug!(
        "Execution {} forks into {} paths under {}",
        execution,
        outgoing.len(),
        root
    );
    for (path, flow) in outgoing {
        take_flow(ctx, path, flow)?;
    }
    Ok(())
}

/// Leave activity scopes whose node is no longer inside them
///
/// A scope sitting at its own activity completed normally and hands its
/// compensation subscriptions to the enclosing scope; one sitting at a
/// boundary event was interrupted and drops them.
fn exit_completed_scopes(
    ctx: &mut CommandContext<'_>,
    definition: &ProcessDefinition,
    execution: ExecutionId,
) -> Result<ExecutionId> {
    let mut current = execution;
    while let Some(parent) = scope_exit_target(ctx, definition, current)? {
        exit_scope(ctx, current, parent)?;
        current = parent;
    }
    Ok(current)
}

fn scope_exit_target(
    ctx: &CommandContext<'_>,
    definition: &ProcessDefinition,
    execution: ExecutionId,
) -> Result<Option<ExecutionId>> {
    let e = ctx.tree.get(execution)?;
    if !e.is_scope || e.is_loop_instance() {
        return Ok(None);
    }
    let (Some(scope_node), Some(node), Some(parent)) = (&e.scope_node, &e.node_id, e.parent) else {
        return Ok(None);
    };
    if definition.is_within(node, scope_node) {
        return Ok(None);
    }
    Ok(Some(parent))
}

fn exit_scope(ctx: &mut CommandContext<'_>, scope: ExecutionId, parent: ExecutionId) -> Result<()> {
    let exec = ctx.tree.get(scope)?.clone();
    let node = exec.node_id.clone();
    if node.is_some() && node == exec.scope_node {
        let target = ctx.tree.nearest_scope(parent)?;
        rehome_compensation(ctx, scope, target)?;
        ctx.record(HistoryEvent::ScopeEnded {
            process_instance_id: exec.process_instance_id,
            execution_id: scope,
            node_id: exec.scope_node.clone().unwrap_or_default(),
        });
    }
    ctx.remove_execution(scope, None)?;
    let p = ctx.tree.get_mut(parent)?;
    p.node_id = node;
    p.is_active = true;
    log::debug!("Execution {} left scope {}", parent, scope);
    Ok(())
}

/// Move compensation subscriptions to another scope execution
pub(crate) fn rehome_compensation(
    ctx: &mut CommandContext<'_>,
    from: ExecutionId,
    to: ExecutionId,
) -> Result<()> {
    for id in ctx.tree.compensate_subscriptions(from) {
        ctx.tree.move_subscription(id, to)?;
    }
    Ok(())
}

/// Completed activities with a compensation boundary become compensable
fn register_compensation(
    ctx: &mut CommandContext<'_>,
    definition: &ProcessDefinition,
    execution: ExecutionId,
    activity: &str,
) -> Result<()> {
    let Some(boundary) = definition.compensation_boundary(activity) else {
        return Ok(());
    };
    let Some(handler) = definition.compensation_handler(&boundary.id) else {
        return Err(ProcessEngineError::modeling(format!(
            "compensation boundary '{}' has no handler",
            boundary.id
        )));
    };
    let container = definition.node(activity).and_then(|n| n.parent.clone());
    let scope = flow_scope_execution(&*ctx.tree, execution, container.as_deref())?;
    ctx.tree.add_subscription(
        crate::runtime::SubscriptionKind::Compensate,
        activity,
        scope,
        activity,
        Some(handler.id.clone()),
    )?;
    log::debug!(
        "Activity '{}' compensable by '{}' on scope {}",
        activity,
        handler.id,
        scope
    );
    Ok(())
}

/// A path has nowhere left to go
pub(crate) fn end(ctx: &mut CommandContext<'_>, execution: ExecutionId) -> Result<()> {
    let exec = ctx.tree.get(execution)?.clone();

    if let Some(thrower) = exec.compensation_for {
        ctx.remove_execution(execution, None)?;
        let pending = ctx
            .tree
            .instance_executions(exec.process_instance_id)
            .iter()
            .any(|e| e.compensation_for == Some(thrower));
        if !pending && ctx.tree.contains(thrower) {
            log::debug!("Compensation for {} finished", thrower);
            ctx.tree.get_mut(thrower)?.is_active = true;
            ctx.agenda.plan_leave(thrower);
        }
        return Ok(());
    }

    if exec.is_concurrent {
        let parent = exec.parent.ok_or_else(|| {
            ProcessEngineError::invalid_state(format!("concurrent execution {} has no parent", execution))
        })?;
        ctx.remove_execution(execution, None)?;
        if ctx.tree.children(parent)?.is_empty() {
            ctx.plan(Operation::CompleteScope { execution: parent });
        }
        return Ok(());
    }

    let definition = ctx.definition_of(execution)?;
    if let Some(parent) = scope_exit_target(ctx, &definition, execution)? {
        exit_scope(ctx, execution, parent)?;
        ctx.agenda.plan_end(parent);
        return Ok(());
    }

    ctx.plan(Operation::CompleteScope { execution });
    Ok(())
}

/// Every path inside a scope finished
pub(crate) fn complete_scope(ctx: &mut CommandContext<'_>, execution: ExecutionId) -> Result<()> {
    let exec = ctx.tree.get(execution)?.clone();
    if exec.parent.is_none() {
        return complete_process_instance(ctx, execution);
    }
    let scope_node = exec.scope_node.ok_or_else(|| {
        ProcessEngineError::invalid_state(format!(
            "execution {} completed but is not an activity scope",
            execution
        ))
    })?;
    let e = ctx.tree.get_mut(execution)?;
    e.node_id = Some(scope_node);
    e.is_active = true;
    ctx.agenda.plan_leave(execution);
    Ok(())
}

fn complete_process_instance(ctx: &mut CommandContext<'_>, root: ExecutionId) -> Result<()> {
    let exec = ctx.tree.get(root)?.clone();
    if let Some(super_execution) = exec.super_execution {
        subprocess::apply_output_mappings(ctx, super_execution, root)?;
    }
    ctx.remove_execution(root, None)?;
    ctx.tree.mark_ended(root);
    ctx.record(HistoryEvent::ProcessEnded {
        process_instance_id: root,
        definition_id: exec.definition_id.clone(),
        end_node_id: exec.node_id.clone(),
        delete_reason: None,
    });
    log::info!("Process instance {} ({}) completed", root, exec.definition_id);

    if let Some(super_execution) = exec.super_execution {
        if ctx.tree.contains(super_execution) {
            ctx.tree.get_mut(super_execution)?.is_active = true;
            ctx.agenda.plan_leave(super_execution);
        }
    }
    Ok(())
}

/// Delete everything below a scope execution
///
/// The scope itself survives without its event subscriptions; a linked
/// sub-process instance goes with it.
pub(crate) fn destroy_scope(ctx: &mut CommandContext<'_>, execution: ExecutionId, reason: &str) -> Result<()> {
    let children = ctx.tree.children(execution)?.to_vec();
    log::debug!(
        "Destroying scope {} ({} children): {}",
        execution,
        children.len(),
        reason
    );
    for child in children {
        ctx.remove_execution(child, Some(reason))?;
    }
    if let Some(sub_instance) = ctx.tree.get(execution)?.sub_process_instance {
        delete_process_instance(ctx, sub_instance, reason)?;
    }
    ctx.cancel_event_subscriptions(execution);
    Ok(())
}

/// Remove a whole process instance
pub(crate) fn delete_process_instance(
    ctx: &mut CommandContext<'_>,
    root: ExecutionId,
    reason: &str,
) -> Result<()> {
    let definition_id = ctx.tree.get(root)?.definition_id.clone();
    let removed = ctx.remove_execution(root, Some(reason))?;
    for execution in &removed.executions {
        if execution.parent.is_none() {
            ctx.tree.mark_ended(execution.id);
        }
    }
    ctx.record(HistoryEvent::ProcessEnded {
        process_instance_id: root,
        definition_id,
        end_node_id: None,
        delete_reason: Some(reason.to_string()),
    });
    log::info!("Process instance {} deleted: {}", root, reason);
    Ok(())
}
