//! Gateways: exclusive choice, parallel and inclusive joins, event-based choice
//!
//! Joins count the inactive children of the concurrent root parked at the
//! gateway. Before counting, the concurrent root gets a forced revision bump
//! so two siblings joining at once conflict in the store instead of both
//! seeing themselves as the last arrival.

use super::router;
use crate::error::{ProcessEngineError, Result};
use crate::model::{NodeKind, ProcessDefinition};
use crate::runtime::{CommandContext, ExecutionId};

/// First non-default flow whose condition holds, else the default
pub(crate) fn leave_exclusive(ctx: &mut CommandContext<'_>, execution: ExecutionId) -> Result<()> {
    let definition = ctx.definition_of(execution)?;
    let node_id = ctx.node_of(execution)?;
    let node = definition.require_node(&node_id)?;
    let skip_enabled = ctx.skip_expressions_enabled(execution);

    let mut chosen = None;
    for flow in definition.outgoing(&node_id) {
        if skip_enabled {
            if let Some(skip) = &flow.skip_expression {
                if ctx.evaluate_condition(execution, skip)? {
                    chosen = Some(flow.id.clone());
                    break;
                }
                continue;
            }
        }
        if node.default_flow.as_deref() == Some(flow.id.as_str()) {
            continue;
        }
        let holds = match &flow.condition {
            Some(condition) => ctx.evaluate_condition(execution, condition)?,
            None => true,
        };
        if holds {
            chosen = Some(flow.id.clone());
            break;
        }
    }

    let flow = chosen
        .or_else(|| node.default_flow.clone())
        .ok_or(ProcessEngineError::NoOutgoingSequenceFlow { node_id: node_id.clone() })?;
    log::debug!("Exclusive gateway '{}' takes '{}'", node_id, flow);
    ctx.agenda.plan_take_flows(execution, vec![flow], Vec::new());
    Ok(())
}

/// Park the arriving execution and return the executions joined so far
fn arrive(ctx: &mut CommandContext<'_>, execution: ExecutionId, node_id: &str) -> Result<Vec<ExecutionId>> {
    ctx.tree.get_mut(execution)?.is_active = false;
    let root = ctx.tree.concurrent_root(execution)?;
    ctx.tree.force_update(root)?;
    if root == execution {
        Ok(vec![execution])
    } else {
        ctx.tree.find_inactive_concurrent_executions(root, node_id)
    }
}

pub(crate) fn execute_parallel(ctx: &mut CommandContext<'_>, execution: ExecutionId) -> Result<()> {
    let definition = ctx.definition_of(execution)?;
    let node_id = ctx.node_of(execution)?;
    let joined = arrive(ctx, execution, &node_id)?;
    let incoming = definition.incoming(&node_id).count().max(1);
    log::debug!(
        "Parallel gateway '{}': {} of {} joined",
        node_id,
        joined.len(),
        incoming
    );
    if joined.len() < incoming {
        return Ok(());
    }
    take_all_outgoing(ctx, &definition, execution, &node_id, joined)
}

fn take_all_outgoing(
    ctx: &mut CommandContext<'_>,
    definition: &ProcessDefinition,
    execution: ExecutionId,
    node_id: &str,
    joined: Vec<ExecutionId>,
) -> Result<()> {
    let flows: Vec<String> = definition.outgoing(node_id).map(|f| f.id.clone()).collect();
    if flows.is_empty() {
        for other in joined.into_iter().filter(|id| *id != execution) {
            ctx.remove_execution(other, None)?;
        }
        ctx.agenda.plan_end(execution);
        return Ok(());
    }
    ctx.agenda.plan_take_flows(execution, flows, joined);
    Ok(())
}

pub(crate) fn execute_inclusive(ctx: &mut CommandContext<'_>, execution: ExecutionId) -> Result<()> {
    let definition = ctx.definition_of(execution)?;
    let node_id = ctx.node_of(execution)?;
    let joined = arrive(ctx, execution, &node_id)?;
    let incoming = definition.incoming(&node_id).count().max(1);

    let activate = joined.len() >= incoming
        || !live_path_can_reach(ctx, &definition, execution, &node_id, &joined)?;
    log::debug!(
        "Inclusive gateway '{}': {} joined of {} incoming, activate = {}",
        node_id,
        joined.len(),
        incoming,
        activate
    );
    if activate {
        router::leave_with(ctx, execution, true, Some(joined))
    } else {
        Ok(())
    }
}

/// Whether a sibling outside the joined set may still arrive at the gateway
fn live_path_can_reach(
    ctx: &CommandContext<'_>,
    definition: &ProcessDefinition,
    execution: ExecutionId,
    node_id: &str,
    joined: &[ExecutionId],
) -> Result<bool> {
    let root = ctx.tree.concurrent_root(execution)?;
    if root == execution {
        return Ok(false);
    }
    for child in ctx.tree.children(root)? {
        if joined.contains(child) {
            continue;
        }
        let Some(position) = ctx.tree.get(*child)?.node() else {
            continue;
        };
        if position == node_id || definition.can_reach(position, node_id) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Wait on every catch event that follows the gateway
pub(crate) fn execute_event_based(ctx: &mut CommandContext<'_>, execution: ExecutionId) -> Result<()> {
    let definition = ctx.definition_of(execution)?;
    let node_id = ctx.node_of(execution)?;
    let mut waiting = 0;
    for flow in definition.outgoing(&node_id) {
        let target = definition.require_node(&flow.target)?;
        match &target.kind {
            NodeKind::IntermediateCatchEvent { event } => {
                ctx.subscribe(execution, &target.id, event)?;
                waiting += 1;
            }
            _ => {
                return Err(ProcessEngineError::modeling(format!(
                    "event-based gateway '{}' may only lead to catch events, found '{}'",
                    node_id, target.id
                )))
            }
        }
    }
    log::debug!(
        "Event-based gateway '{}' waits on {} events",
        node_id,
        waiting
    );
    Ok(())
}
