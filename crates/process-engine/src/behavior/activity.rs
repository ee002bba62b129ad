//! Service tasks and end events

use super::{compensation, event};
use crate::error::{ProcessEngineError, Result};
use crate::handler::{TaskContext, TaskError};
use crate::model::{EventDefinition, FlowNode, NodeKind, ProcessDefinition};
use crate::runtime::{CommandContext, ExecutionId};

/// Await the registered handler and write its updates back
///
/// Business faults become error propagation; any other handler failure
/// aborts the command.
pub(crate) async fn execute_service_task(
    ctx: &mut CommandContext<'_>,
    execution: ExecutionId,
    node: &FlowNode,
) -> Result<()> {
    let NodeKind::ServiceTask { handler } = &node.kind else {
        return Err(ProcessEngineError::invalid_state(format!(
            "'{}' is not a service task",
            node.id
        )));
    };
    let task_handler = ctx.handlers.get(handler).ok_or_else(|| {
        ProcessEngineError::modeling(format!(
            "service task '{}' refers to unregistered handler '{}'",
            node.id, handler
        ))
    })?;

    let process_instance_id = ctx.tree.get(execution)?.process_instance_id;
    let task = TaskContext::new(
        execution,
        process_instance_id,
        node.id.clone(),
        ctx.tree.variables(execution),
    );
    log::debug!(
        "Invoking handler '{}' for '{}' on execution {}",
        handler,
        node.id,
        execution
    );

    match task_handler.execute(task).await {
        Ok(done) => {
            for (name, value) in done.into_updates() {
                ctx.tree.set_variable(execution, &name, value)?;
            }
            ctx.agenda.plan_leave(execution);
            Ok(())
        }
        Err(TaskError::Business { code, message }) => {
            log::debug!("Handler '{}' raised business error '{}'", handler, code);
            event::propagate_error(ctx, execution, &code, &message)
        }
        Err(TaskError::Failed(message)) => Err(ProcessEngineError::TaskFailed {
            node_id: node.id.clone(),
            message,
        }),
    }
}

pub(crate) fn execute_end_event(
    ctx: &mut CommandContext<'_>,
    definition: &ProcessDefinition,
    execution: ExecutionId,
    node: &FlowNode,
) -> Result<()> {
    let NodeKind::EndEvent { event: definition_event } = &node.kind else {
        return Err(ProcessEngineError::invalid_state(format!(
            "'{}' is not an end event",
            node.id
        )));
    };
    match definition_event {
        None | Some(EventDefinition::Message { .. }) | Some(EventDefinition::Timer(_)) => {
            ctx.agenda.plan_end(execution);
            Ok(())
        }
        Some(EventDefinition::Error { code }) => {
            let code = code.clone().unwrap_or_default();
            let message = format!("error end event '{}'", node.id);
            event::propagate_error(ctx, execution, &code, &message)
        }
        Some(EventDefinition::Signal { name }) => {
            event::throw_signal(ctx, name, Default::default())?;
            ctx.agenda.plan_end(execution);
            Ok(())
        }
        // The thrower leaves once compensation finishes; with no outgoing
        // flows the router ends it.
        Some(EventDefinition::Compensate { activity_ref }) => {
            compensation::throw(ctx, execution, node, activity_ref.clone())
        }
        Some(EventDefinition::Cancel) => compensation::cancel_end(ctx, definition, execution, node),
        Some(EventDefinition::Terminate) => compensation::terminate_end(ctx, execution, node),
    }
}
