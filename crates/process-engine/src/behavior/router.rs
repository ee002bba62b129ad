//! Default leave: evaluate outgoing sequence flows and take the selected ones

use crate::error::{ProcessEngineError, Result};
use crate::model::{FlowNode, ProcessDefinition};
use crate::runtime::{CommandContext, ExecutionId, Operation};

/// Outgoing flows whose condition holds, default flow excluded
///
/// With skip expressions switched on, a flow carrying a skip expression is
/// taken without looking at its condition when the expression is true or
/// when it is the node's only outgoing flow, and dropped otherwise.
pub(crate) fn select_flows(
    ctx: &CommandContext<'_>,
    definition: &ProcessDefinition,
    execution: ExecutionId,
    node: &FlowNode,
) -> Result<Vec<String>> {
    let skip_enabled = ctx.skip_expressions_enabled(execution);
    let outgoing: Vec<_> = definition.outgoing(&node.id).collect();
    let total = outgoing.len();
    let mut selected = Vec::new();

    for flow in outgoing {
        if skip_enabled {
            if let Some(skip) = &flow.skip_expression {
                if total == 1 || ctx.evaluate_condition(execution, skip)? {
                    selected.push(flow.id.clone());
                }
                continue;
            }
        }
        if node.default_flow.as_deref() == Some(flow.id.as_str()) {
            continue;
        }
        let take = match &flow.condition {
            Some(condition) => ctx.evaluate_condition(execution, condition)?,
            None => true,
        };
        if take {
            selected.push(flow.id.clone());
        }
    }
    Ok(selected)
}

pub(crate) fn leave(ctx: &mut CommandContext<'_>, execution: ExecutionId) -> Result<()> {
    leave_with(ctx, execution, false, None)
}

/// Router with the knobs gateways need
///
/// `fail_if_none` turns "no flow selected" into `NoOutgoingSequenceFlow`
/// instead of ending the path. `joined` hands executions parked at a join
/// to the flow-taking step for reuse.
pub(crate) fn leave_with(
    ctx: &mut CommandContext<'_>,
    execution: ExecutionId,
    fail_if_none: bool,
    joined: Option<Vec<ExecutionId>>,
) -> Result<()> {
    let definition = ctx.definition_of(execution)?;
    let node_id = ctx.node_of(execution)?;
    let node = definition.require_node(&node_id)?;

    let mut selected = select_flows(ctx, &definition, execution, node)?;
    if selected.is_empty() {
        if let Some(default) = &node.default_flow {
            selected.push(default.clone());
        }
    }
    log::debug!(
        "Leaving '{}' on execution {} through {:?}",
        node_id,
        execution,
        selected
    );

    match (selected.len(), joined) {
        (0, _) if fail_if_none => Err(ProcessEngineError::NoOutgoingSequenceFlow { node_id }),
        (0, Some(joined)) => {
            for other in joined.into_iter().filter(|id| *id != execution) {
                ctx.remove_execution(other, None)?;
            }
            ctx.agenda.plan_end(execution);
            Ok(())
        }
        (0, None) => {
            ctx.agenda.plan_end(execution);
            Ok(())
        }
        (_, Some(joined)) => {
            ctx.plan(Operation::TakeFlows {
                execution,
                flows: selected,
                recyclable: joined,
            });
            Ok(())
        }
        (1, None) => {
            ctx.agenda.plan_take_flows(execution, selected, Vec::new());
            Ok(())
        }
        (_, None) => {
            ctx.tree.get_mut(execution)?.is_active = false;
            ctx.agenda.plan_take_flows(execution, selected, vec![execution]);
            Ok(())
        }
    }
}
