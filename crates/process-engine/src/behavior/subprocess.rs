//! Embedded sub-processes, transactions and call activities

use serde_json::Value;

use crate::error::{ProcessEngineError, Result};
use crate::events::HistoryEvent;
use crate::model::{FlowNode, NodeKind, ProcessDefinition, VariableMapping};
use crate::runtime::{CommandContext, ExecutionId};

/// Move the container's scope execution onto its start event
pub(crate) fn execute_sub_process(
    ctx: &mut CommandContext<'_>,
    definition: &ProcessDefinition,
    execution: ExecutionId,
    node: &FlowNode,
) -> Result<()> {
    let start = definition.start_event(Some(&node.id)).ok_or_else(|| {
        ProcessEngineError::modeling(format!("sub-process '{}' has no start event", node.id))
    })?;
    ctx.tree.get_mut(execution)?.node_id = Some(start.id.clone());
    ctx.agenda.plan_continue(execution);
    Ok(())
}

/// Start the called definition as a linked process instance
pub(crate) fn execute_call_activity(
    ctx: &mut CommandContext<'_>,
    execution: ExecutionId,
    node: &FlowNode,
) -> Result<()> {
    let NodeKind::CallActivity {
        called_element,
        inputs,
        ..
    } = &node.kind
    else {
        return Err(ProcessEngineError::invalid_state(format!(
            "'{}' is not a call activity",
            node.id
        )));
    };
    let called = ctx.repository.latest_by_key(called_element)?;
    let start = called.start_event(None).ok_or_else(|| {
        ProcessEngineError::modeling(format!("called process '{}' has no start event", called.id))
    })?;

    let mapped = map_variables(ctx, execution, inputs)?;
    let sub_instance = ctx.tree.create_process_instance(&called.id, &start.id);
    ctx.tree.get_mut(sub_instance)?.super_execution = Some(execution);
    ctx.tree.get_mut(execution)?.sub_process_instance = Some(sub_instance);
    for (name, value) in mapped {
        ctx.tree.set_variable_local(sub_instance, &name, value)?;
    }

    ctx.record(HistoryEvent::ProcessStarted {
        process_instance_id: sub_instance,
        definition_id: called.id.clone(),
        super_execution_id: Some(execution),
    });
    ctx.record(HistoryEvent::SubProcessInstanceLinked {
        super_execution_id: execution,
        sub_process_instance_id: sub_instance,
        called_definition_id: called.id.clone(),
    });
    log::info!(
        "Call activity '{}' started process instance {} ({})",
        node.id,
        sub_instance,
        called.id
    );
    ctx.agenda.plan_continue(sub_instance);
    Ok(())
}

/// Copy the call activity's output mappings from a finished sub-instance
pub(crate) fn apply_output_mappings(
    ctx: &mut CommandContext<'_>,
    super_execution: ExecutionId,
    sub_instance: ExecutionId,
) -> Result<()> {
    if !ctx.tree.contains(super_execution) {
        return Ok(());
    }
    let definition = ctx.definition_of(super_execution)?;
    let node_id = ctx.node_of(super_execution)?;
    let node = definition.require_node(&node_id)?;
    let NodeKind::CallActivity { outputs, .. } = &node.kind else {
        return Ok(());
    };
    let mapped = map_variables(ctx, sub_instance, outputs)?;
    for (name, value) in mapped {
        ctx.tree.set_variable(super_execution, &name, value)?;
    }
    ctx.tree.get_mut(super_execution)?.sub_process_instance = None;
    Ok(())
}

/// Resolve mappings against `from`; unset sources are skipped
///
/// A source written as `${...}` is evaluated, anything else names a variable.
fn map_variables(
    ctx: &CommandContext<'_>,
    from: ExecutionId,
    mappings: &[VariableMapping],
) -> Result<Vec<(String, Value)>> {
    let mut mapped = Vec::with_capacity(mappings.len());
    for mapping in mappings {
        let source = mapping.source.trim();
        let value = if source.starts_with("${") || source.starts_with("#{") {
            Some(ctx.evaluate(from, source)?)
        } else {
            ctx.tree.get_variable(from, source).cloned()
        };
        if let Some(value) = value {
            mapped.push((mapping.target.clone(), value));
        }
    }
    Ok(mapped)
}
