//! Multi-instance activities
//!
//! The scope execution created on entry is the loop root. It owns the loop
//! counters and one child per iteration:
//!
//! ```text
//! sequential:  root ── instance (scope, loopCounter)
//! parallel:    root ─┬ instance (concurrent, loopCounter)
//!                    ├ instance ── instance scope   (inner is a container)
//!                    └ ...
//! ```
//!
//! A sequential loop creates a fresh instance per iteration. A parallel loop
//! creates every instance before any of them runs.

use serde_json::{json, Value};

use super::{operation, router};
use crate::error::{ProcessEngineError, Result};
use crate::model::{FlowNode, LoopCharacteristics};
use crate::runtime::{CommandContext, ExecutionId, LoopRole, Operation};

pub const NR_OF_INSTANCES: &str = "nrOfInstances";
pub const NR_OF_ACTIVE_INSTANCES: &str = "nrOfActiveInstances";
pub const NR_OF_COMPLETED_INSTANCES: &str = "nrOfCompletedInstances";
pub const LOOP_COUNTER: &str = "loopCounter";

const COMPLETED_REASON: &str = "multi-instance completed";

fn loop_characteristics(node: &FlowNode) -> Result<&LoopCharacteristics> {
    node.loop_characteristics.as_ref().ok_or_else(|| {
        ProcessEngineError::invalid_state(format!("'{}' is not a multi-instance activity", node.id))
    })
}

/// Enter the loop on its root execution
pub(crate) fn execute(ctx: &mut CommandContext<'_>, root: ExecutionId, node: &FlowNode) -> Result<()> {
    let lc = loop_characteristics(node)?;
    let total = resolve_cardinality(ctx, root, node, lc)?;
    let active = match (total, lc.is_sequential) {
        (0, _) => 0,
        (_, true) => 1,
        (n, false) => n,
    };
    ctx.tree.set_variable_local(root, NR_OF_INSTANCES, json!(total))?;
    ctx.tree.set_variable_local(root, NR_OF_ACTIVE_INSTANCES, json!(active))?;
    ctx.tree.set_variable_local(root, NR_OF_COMPLETED_INSTANCES, json!(0))?;
    log::debug!(
        "Multi-instance '{}' starts {} {} instances on root {}",
        node.id,
        total,
        if lc.is_sequential { "sequential" } else { "parallel" },
        root
    );

    if total == 0 {
        ctx.agenda.plan_leave(root);
        return Ok(());
    }
    ctx.tree.get_mut(root)?.is_active = false;

    if lc.is_sequential {
        let instance = create_sequential_instance(ctx, root, node, lc, 0)?;
        ctx.plan(Operation::ExecuteInner { execution: instance });
        return Ok(());
    }

    let mut targets = Vec::with_capacity(total);
    for counter in 0..total {
        let instance = ctx.tree.create_concurrent_child(root)?;
        {
            let e = ctx.tree.get_mut(instance)?;
            e.loop_role = Some(LoopRole::Instance);
            e.node_id = Some(node.id.clone());
            e.is_active = true;
        }
        init_instance_variables(ctx, root, instance, lc, counter)?;

        let target = if node.kind.is_container() {
            ctx.tree.get_mut(instance)?.is_active = false;
            let scope = ctx.tree.create_child(instance)?;
            let s = ctx.tree.get_mut(scope)?;
            s.is_scope = true;
            s.scope_node = Some(node.id.clone());
            s.loop_role = Some(LoopRole::InstanceScope);
            s.node_id = Some(node.id.clone());
            scope
        } else {
            instance
        };
        targets.push(target);
    }
    for target in targets {
        ctx.plan(Operation::ExecuteInner { execution: target });
    }
    Ok(())
}

fn create_sequential_instance(
    ctx: &mut CommandContext<'_>,
    root: ExecutionId,
    node: &FlowNode,
    lc: &LoopCharacteristics,
    counter: usize,
) -> Result<ExecutionId> {
    let instance = ctx.tree.create_child(root)?;
    {
        let e = ctx.tree.get_mut(instance)?;
        e.is_scope = true;
        e.scope_node = Some(node.id.clone());
        e.loop_role = Some(LoopRole::Instance);
        e.node_id = Some(node.id.clone());
    }
    init_instance_variables(ctx, root, instance, lc, counter)?;
    Ok(instance)
}

fn init_instance_variables(
    ctx: &mut CommandContext<'_>,
    root: ExecutionId,
    instance: ExecutionId,
    lc: &LoopCharacteristics,
    counter: usize,
) -> Result<()> {
    ctx.tree.set_variable_local(instance, LOOP_COUNTER, json!(counter))?;
    if let (Some(element), Some(collection)) = (&lc.element_variable, &lc.collection) {
        let items = resolve_collection(ctx, root, collection)?;
        let item = items.get(counter).cloned().unwrap_or(Value::Null);
        ctx.tree.set_variable_local(instance, element, item)?;
    }
    Ok(())
}

/// Leave on a loop execution
///
/// Iterations report completion to the root; the root itself leaves
/// through the regular outgoing flows.
pub(crate) fn leave(ctx: &mut CommandContext<'_>, execution: ExecutionId) -> Result<()> {
    match ctx.tree.get(execution)?.loop_role {
        Some(LoopRole::Instance) | Some(LoopRole::InstanceScope) => complete_instance(ctx, execution),
        _ => router::leave(ctx, execution),
    }
}

fn complete_instance(ctx: &mut CommandContext<'_>, execution: ExecutionId) -> Result<()> {
    let exec = ctx.tree.get(execution)?.clone();
    let instance = if exec.loop_role == Some(LoopRole::InstanceScope) {
        let parent = exec.parent.ok_or_else(|| {
            ProcessEngineError::invalid_state(format!("instance scope {} has no parent", execution))
        })?;
        let root = loop_root(ctx, parent)?;
        operation::rehome_compensation(ctx, execution, root)?;
        ctx.remove_execution(execution, None)?;
        parent
    } else {
        execution
    };
    let root = loop_root(ctx, instance)?;

    let definition = ctx.definition_of(root)?;
    let node_id = ctx.node_of(instance)?;
    let node = definition.require_node(&node_id)?;
    let lc = loop_characteristics(node)?;

    if lc.is_sequential {
        complete_sequential(ctx, root, instance, node, lc)
    } else {
        complete_parallel(ctx, root, instance, node, lc)
    }
}

fn loop_root(ctx: &CommandContext<'_>, instance: ExecutionId) -> Result<ExecutionId> {
    let parent = ctx.tree.get(instance)?.parent;
    match parent {
        Some(root) if ctx.tree.get(root)?.loop_role == Some(LoopRole::Root) => Ok(root),
        _ => Err(ProcessEngineError::invalid_state(format!(
            "loop instance {} is not owned by a loop root",
            instance
        ))),
    }
}

fn counter(ctx: &CommandContext<'_>, root: ExecutionId, name: &str) -> Result<i64> {
    Ok(ctx
        .tree
        .get(root)?
        .variables
        .get(name)
        .and_then(Value::as_i64)
        .unwrap_or(0))
}

fn completion_condition_holds(
    ctx: &CommandContext<'_>,
    instance: ExecutionId,
    lc: &LoopCharacteristics,
) -> Result<bool> {
    match &lc.completion_condition {
        Some(condition) => ctx.evaluate_condition(instance, condition),
        None => Ok(false),
    }
}

fn complete_sequential(
    ctx: &mut CommandContext<'_>,
    root: ExecutionId,
    instance: ExecutionId,
    node: &FlowNode,
    lc: &LoopCharacteristics,
) -> Result<()> {
    let total = counter(ctx, root, NR_OF_INSTANCES)?;
    let completed = counter(ctx, root, NR_OF_COMPLETED_INSTANCES)? + 1;
    ctx.tree.set_variable_local(root, NR_OF_COMPLETED_INSTANCES, json!(completed))?;

    let done = completed >= total || completion_condition_holds(ctx, instance, lc)?;
    let active = if done { 0 } else { 1 };
    ctx.tree.set_variable_local(root, NR_OF_ACTIVE_INSTANCES, json!(active))?;
    log::debug!(
        "Multi-instance '{}': {} of {} sequential instances completed",
        node.id,
        completed,
        total
    );

    operation::rehome_compensation(ctx, instance, root)?;
    ctx.remove_execution(instance, None)?;

    if done {
        finish_loop(ctx, root, node)
    } else {
        let next = create_sequential_instance(ctx, root, node, lc, completed as usize)?;
        ctx.plan(Operation::ExecuteInner { execution: next });
        Ok(())
    }
}

fn complete_parallel(
    ctx: &mut CommandContext<'_>,
    root: ExecutionId,
    instance: ExecutionId,
    node: &FlowNode,
    lc: &LoopCharacteristics,
) -> Result<()> {
    ctx.tree.get_mut(instance)?.is_active = false;
    ctx.tree.force_update(root)?;

    let total = counter(ctx, root, NR_OF_INSTANCES)?;
    let completed = counter(ctx, root, NR_OF_COMPLETED_INSTANCES)? + 1;
    let active = (counter(ctx, root, NR_OF_ACTIVE_INSTANCES)? - 1).max(0);
    ctx.tree.set_variable_local(root, NR_OF_COMPLETED_INSTANCES, json!(completed))?;
    ctx.tree.set_variable_local(root, NR_OF_ACTIVE_INSTANCES, json!(active))?;

    let children = ctx.tree.children(root)?.to_vec();
    let mut joined = 0;
    for child in &children {
        let c = ctx.tree.get(*child)?;
        if c.loop_role == Some(LoopRole::Instance) && !c.is_active && c.children.is_empty() {
            joined += 1;
        }
    }
    log::debug!(
        "Multi-instance '{}': {} of {} parallel instances joined ({} active)",
        node.id,
        joined,
        total,
        active
    );

    if joined < total && !completion_condition_holds(ctx, instance, lc)? {
        return Ok(());
    }

    for child in children {
        let (finished, subtree) = {
            let c = ctx.tree.get(child)?;
            let finished = !c.is_active && c.children.is_empty();
            (finished, ctx.tree.descendants(child))
        };
        operation::rehome_compensation(ctx, child, root)?;
        for nested in subtree {
            operation::rehome_compensation(ctx, nested, root)?;
        }
        let reason = if finished { None } else { Some(COMPLETED_REASON) };
        ctx.remove_execution(child, reason)?;
    }
    finish_loop(ctx, root, node)
}

fn finish_loop(ctx: &mut CommandContext<'_>, root: ExecutionId, node: &FlowNode) -> Result<()> {
    {
        let r = ctx.tree.get_mut(root)?;
        r.is_active = true;
        r.node_id = Some(node.id.clone());
    }
    log::debug!("Multi-instance '{}' completed on root {}", node.id, root);
    ctx.agenda.plan_leave(root);
    Ok(())
}

fn resolve_cardinality(
    ctx: &CommandContext<'_>,
    root: ExecutionId,
    node: &FlowNode,
    lc: &LoopCharacteristics,
) -> Result<usize> {
    if let Some(expression) = &lc.loop_cardinality {
        let value = match expression.trim().parse::<i64>() {
            Ok(n) => json!(n),
            Err(_) => ctx.evaluate(root, expression)?,
        };
        return cardinality_from(&node.id, &value);
    }
    if let Some(collection) = &lc.collection {
        return Ok(resolve_collection(ctx, root, collection)?.len());
    }
    Err(ProcessEngineError::modeling(format!(
        "multi-instance '{}' needs a loop cardinality or a collection",
        node.id
    )))
}

fn cardinality_from(node_id: &str, value: &Value) -> Result<usize> {
    let n = match value {
        Value::Number(num) => num
            .as_i64()
            .or_else(|| num.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    match n {
        Some(n) if n >= 0 => Ok(n as usize),
        _ => Err(ProcessEngineError::InvalidCardinality {
            node_id: node_id.to_string(),
            value: value.to_string(),
        }),
    }
}

fn resolve_collection(
    ctx: &CommandContext<'_>,
    execution: ExecutionId,
    collection: &str,
) -> Result<Vec<Value>> {
    let trimmed = collection.trim();
    let value = if trimmed.starts_with("${") || trimmed.starts_with("#{") {
        ctx.evaluate(execution, trimmed)?
    } else {
        ctx.tree.get_variable(execution, trimmed).cloned().ok_or_else(|| {
            ProcessEngineError::modeling(format!("collection variable '{}' is not set", trimmed))
        })?
    };
    match value {
        Value::Array(items) => Ok(items),
        other => Err(ProcessEngineError::modeling(format!(
            "collection '{}' is not a list: {}",
            trimmed, other
        ))),
    }
}
