//! Arena of executions, event subscriptions and timer jobs
//!
//! The tree for every running process instance lives in one
//! `ExecutionTree`. Parent/child links are ids into the arena; a call
//! activity reaches its sub-instance through `sub_process_instance` and the
//! sub-instance points back through the non-owning `super_execution`.
//!
//! Every mutation is recorded in a `ChangeSet` that the engine drains on
//! commit and hands to the execution store.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::execution::{Execution, ExecutionId};
use super::subscription::{EventSubscription, SubscriptionId, SubscriptionKind};
use super::timer::{JobId, TimerJob};
use crate::error::{ProcessEngineError, Result};

/// Ids touched since the last `take_changes`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub inserted: BTreeSet<ExecutionId>,
    pub updated: BTreeSet<ExecutionId>,
    pub deleted: BTreeSet<ExecutionId>,
    /// Executions whose revision must move even without a field change
    pub forced: BTreeSet<ExecutionId>,
    pub subscriptions_inserted: BTreeSet<SubscriptionId>,
    pub subscriptions_deleted: BTreeSet<SubscriptionId>,
    pub jobs_inserted: BTreeSet<JobId>,
    pub jobs_deleted: BTreeSet<JobId>,
}

impl ChangeSet {
    fn insert(&mut self, id: ExecutionId) {
        self.inserted.insert(id);
    }

    fn update(&mut self, id: ExecutionId) {
        if !self.inserted.contains(&id) {
            self.updated.insert(id);
        }
    }

    fn delete(&mut self, id: ExecutionId) {
        self.updated.remove(&id);
        self.forced.remove(&id);
        if !self.inserted.remove(&id) {
            self.deleted.insert(id);
        }
    }

    fn insert_subscription(&mut self, id: SubscriptionId) {
        self.subscriptions_inserted.insert(id);
    }

    fn delete_subscription(&mut self, id: SubscriptionId) {
        if !self.subscriptions_inserted.remove(&id) {
            self.subscriptions_deleted.insert(id);
        }
    }

    fn insert_job(&mut self, id: JobId) {
        self.jobs_inserted.insert(id);
    }

    fn delete_job(&mut self, id: JobId) {
        if !self.jobs_inserted.remove(&id) {
            self.jobs_deleted.insert(id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty()
            && self.updated.is_empty()
            && self.deleted.is_empty()
            && self.forced.is_empty()
            && self.subscriptions_inserted.is_empty()
            && self.subscriptions_deleted.is_empty()
            && self.jobs_inserted.is_empty()
            && self.jobs_deleted.is_empty()
    }
}

/// Everything a cascading removal took out of the arena
#[derive(Debug, Default)]
pub struct Removed {
    pub executions: Vec<Execution>,
    pub subscriptions: Vec<EventSubscription>,
    pub jobs: Vec<JobId>,
}

/// Arena holding the runtime state of all process instances
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTree {
    executions: BTreeMap<ExecutionId, Execution>,
    subscriptions: BTreeMap<SubscriptionId, EventSubscription>,
    jobs: BTreeMap<JobId, TimerJob>,
    ended_instances: BTreeSet<ExecutionId>,
    next_id: u64,
    #[serde(skip)]
    changes: ChangeSet,
}

impl ExecutionTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    // ------------------------------------------------------------------
    // Executions
    // ------------------------------------------------------------------

    /// Create the root execution of a new process instance
    pub fn create_process_instance(
        &mut self,
        definition_id: &str,
        start_node: &str,
    ) -> ExecutionId {
        let id = ExecutionId(self.allocate());
        let mut root = Execution::new(id, None, id, definition_id);
        root.is_scope = true;
        root.node_id = Some(start_node.to_string());
        self.executions.insert(id, root);
        self.changes.insert(id);
        id
    }

    /// Create a plain child positioned at the parent's node
    pub fn create_child(&mut self, parent: ExecutionId) -> Result<ExecutionId> {
        let id = ExecutionId(self.allocate());
        let parent_exec = self.get_mut(parent)?;
        parent_exec.children.push(id);
        let mut child = Execution::new(
            id,
            Some(parent),
            parent_exec.process_instance_id,
            parent_exec.definition_id.clone(),
        );
        child.node_id = parent_exec.node_id.clone();
        self.executions.insert(id, child);
        self.changes.insert(id);
        Ok(id)
    }

    /// Create a concurrent child of `parent`
    ///
    /// A parent whose only child is a non-concurrent scope gets that child
    /// wrapped in a concurrent execution first, so a concurrent parent only
    /// ever owns concurrent children.
    pub fn create_concurrent_child(&mut self, parent: ExecutionId) -> Result<ExecutionId> {
        let children = self.children(parent)?.to_vec();
        if let [only] = children.as_slice() {
            let only = *only;
            let existing = self.get(only)?;
            if !existing.is_concurrent {
                let position = existing
                    .scope_node
                    .clone()
                    .or_else(|| existing.node_id.clone());
                let wrapper = self.create_child(parent)?;
                {
                    let w = self.get_mut(wrapper)?;
                    w.is_concurrent = true;
                    w.is_active = false;
                    w.node_id = position;
                }
                self.reparent(only, wrapper)?;
            }
        }
        let child = self.create_child(parent)?;
        self.get_mut(child)?.is_concurrent = true;
        Ok(child)
    }

    /// Move an execution (with its subtree) under a new parent
    pub fn reparent(&mut self, id: ExecutionId, new_parent: ExecutionId) -> Result<()> {
        if let Some(old_parent) = self.get(id)?.parent {
            self.get_mut(old_parent)?.children.retain(|c| *c != id);
        }
        self.get_mut(new_parent)?.children.push(id);
        self.get_mut(id)?.parent = Some(new_parent);
        Ok(())
    }

    pub fn contains(&self, id: ExecutionId) -> bool {
        self.executions.contains_key(&id)
    }

    pub fn find(&self, id: ExecutionId) -> Option<&Execution> {
        self.executions.get(&id)
    }

    pub fn get(&self, id: ExecutionId) -> Result<&Execution> {
        self.executions
            .get(&id)
            .ok_or(ProcessEngineError::ExecutionNotFound(id))
    }

    /// Mutable access; marks the execution as updated
    pub fn get_mut(&mut self, id: ExecutionId) -> Result<&mut Execution> {
        match self.executions.get_mut(&id) {
            Some(execution) => {
                self.changes.update(id);
                Ok(execution)
            }
            None => Err(ProcessEngineError::ExecutionNotFound(id)),
        }
    }

    pub fn children(&self, id: ExecutionId) -> Result<&[ExecutionId]> {
        Ok(&self.get(id)?.children)
    }

    /// All executions below `id` in pre-order, excluding `id`
    pub fn descendants(&self, id: ExecutionId) -> Vec<ExecutionId> {
        let mut result = Vec::new();
        let mut stack: Vec<ExecutionId> = match self.find(id) {
            Some(e) => e.children.iter().rev().copied().collect(),
            None => return result,
        };
        while let Some(current) = stack.pop() {
            if let Some(e) = self.find(current) {
                result.push(current);
                stack.extend(e.children.iter().rev().copied());
            }
        }
        result
    }

    /// Ancestors from the direct parent up to the instance root
    pub fn ancestors(&self, id: ExecutionId) -> Vec<ExecutionId> {
        let mut result = Vec::new();
        let mut current = self.find(id).and_then(|e| e.parent);
        while let Some(parent) = current {
            result.push(parent);
            current = self.find(parent).and_then(|e| e.parent);
        }
        result
    }

    /// The execution itself followed by its ancestors
    pub fn ancestors_or_self(&self, id: ExecutionId) -> Vec<ExecutionId> {
        let mut result = vec![id];
        result.extend(self.ancestors(id));
        result
    }

    /// Nearest ancestor-or-self that is a scope
    pub fn nearest_scope(&self, id: ExecutionId) -> Result<ExecutionId> {
        for candidate in self.ancestors_or_self(id) {
            if self.get(candidate)?.is_scope {
                return Ok(candidate);
            }
        }
        Err(ProcessEngineError::invalid_state(format!(
            "execution {} has no scope ancestor",
            id
        )))
    }

    /// Parent that owns the concurrent siblings of `id` (or `id` itself)
    pub fn concurrent_root(&self, id: ExecutionId) -> Result<ExecutionId> {
        let execution = self.get(id)?;
        match execution.parent {
            Some(parent) if execution.is_concurrent => Ok(parent),
            _ => Ok(id),
        }
    }

    /// Inactive, childless children of `parent` parked at `node_id`
    pub fn find_inactive_concurrent_executions(
        &self,
        parent: ExecutionId,
        node_id: &str,
    ) -> Result<Vec<ExecutionId>> {
        let mut result = Vec::new();
        for child in self.children(parent)? {
            let child = self.get(*child)?;
            if child.is_concurrent
                && !child.is_active
                && child.children.is_empty()
                && child.node() == Some(node_id)
            {
                result.push(child.id);
            }
        }
        Ok(result)
    }

    /// Bump the revision of an execution even without a field change
    ///
    /// Join points call this on the concurrent root so two siblings
    /// arriving at once conflict in the store instead of both joining.
    pub fn force_update(&mut self, id: ExecutionId) -> Result<()> {
        self.get_mut(id)?;
        self.changes.forced.insert(id);
        Ok(())
    }

    /// Remove an execution with everything below it
    ///
    /// Follows children and call-activity links, and drops every
    /// subscription and job owned by a removed execution.
    pub fn remove(&mut self, id: ExecutionId) -> Result<Removed> {
        let parent = self.get(id)?.parent;
        if let Some(parent) = parent {
            if let Some(p) = self.executions.get_mut(&parent) {
                p.children.retain(|c| *c != id);
                self.changes.update(parent);
            }
        }
        let super_execution = self.get(id)?.super_execution;
        if let Some(super_id) = super_execution {
            if let Some(s) = self.executions.get_mut(&super_id) {
                if s.sub_process_instance == Some(id) {
                    s.sub_process_instance = None;
                    self.changes.update(super_id);
                }
            }
        }

        let mut removed = Removed::default();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(execution) = self.executions.remove(&current) else {
                continue;
            };
            self.changes.delete(current);
            stack.extend(execution.children.iter().copied());
            if let Some(sub) = execution.sub_process_instance {
                stack.push(sub);
            }
            for sub_id in self.subscription_ids_of(current) {
                if let Some(sub) = self.remove_subscription(sub_id) {
                    removed.subscriptions.push(sub);
                }
            }
            for job_id in self.job_ids_of(current) {
                self.remove_job(&job_id);
                removed.jobs.push(job_id);
            }
            removed.executions.push(execution);
        }
        Ok(removed)
    }

    /// Root executions of running process instances
    pub fn process_instances(&self) -> Vec<ExecutionId> {
        self.executions
            .values()
            .filter(|e| e.parent.is_none())
            .map(|e| e.id)
            .collect()
    }

    /// Every execution of one process instance, root first
    pub fn instance_executions(&self, process_instance_id: ExecutionId) -> Vec<&Execution> {
        self.executions
            .values()
            .filter(|e| e.process_instance_id == process_instance_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    pub fn mark_ended(&mut self, process_instance_id: ExecutionId) {
        self.ended_instances.insert(process_instance_id);
    }

    pub fn is_ended(&self, process_instance_id: ExecutionId) -> bool {
        self.ended_instances.contains(&process_instance_id)
    }

    /// Set the persisted revision after a flush
    pub(crate) fn set_revision(&mut self, id: ExecutionId, revision: u64) {
        if let Some(execution) = self.executions.get_mut(&id) {
            execution.revision = revision;
        }
    }

    // ------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------

    /// Resolve a variable from the execution upwards
    pub fn get_variable(&self, id: ExecutionId, name: &str) -> Option<&Value> {
        let mut current = Some(id);
        while let Some(exec_id) = current {
            let execution = self.find(exec_id)?;
            if let Some(value) = execution.variables.get(name) {
                return Some(value);
            }
            current = execution.parent;
        }
        None
    }

    /// Set a variable where it is already defined, else on the instance root
    pub fn set_variable(&mut self, id: ExecutionId, name: &str, value: Value) -> Result<()> {
        let mut target = self.get(id)?.process_instance_id;
        for candidate in self.ancestors_or_self(id) {
            if self.get(candidate)?.variables.contains_key(name) {
                target = candidate;
                break;
            }
        }
        self.set_variable_local(target, name, value)
    }

    pub fn set_variable_local(&mut self, id: ExecutionId, name: &str, value: Value) -> Result<()> {
        self.get_mut(id)?.variables.insert(name.to_string(), value);
        Ok(())
    }

    /// Variables visible from an execution, closer definitions winning
    pub fn variables(&self, id: ExecutionId) -> BTreeMap<String, Value> {
        let mut merged = BTreeMap::new();
        for exec_id in self.ancestors_or_self(id).into_iter().rev() {
            if let Some(execution) = self.find(exec_id) {
                merged.extend(execution.variables.clone());
            }
        }
        merged
    }

    // ------------------------------------------------------------------
    // Event subscriptions
    // ------------------------------------------------------------------

    pub fn add_subscription(
        &mut self,
        kind: SubscriptionKind,
        event_name: &str,
        execution_id: ExecutionId,
        node_id: &str,
        configuration: Option<String>,
    ) -> Result<SubscriptionId> {
        let process_instance_id = self.get(execution_id)?.process_instance_id;
        let id = SubscriptionId(self.allocate());
        self.subscriptions.insert(
            id,
            EventSubscription {
                id,
                kind,
                event_name: event_name.to_string(),
                execution_id,
                process_instance_id,
                node_id: node_id.to_string(),
                configuration,
            },
        );
        self.changes.insert_subscription(id);
        Ok(id)
    }

    pub fn subscription(&self, id: SubscriptionId) -> Option<&EventSubscription> {
        self.subscriptions.get(&id)
    }

    pub fn remove_subscription(&mut self, id: SubscriptionId) -> Option<EventSubscription> {
        let removed = self.subscriptions.remove(&id);
        if removed.is_some() {
            self.changes.delete_subscription(id);
        }
        removed
    }

    /// Hand a subscription over to another execution
    pub fn move_subscription(&mut self, id: SubscriptionId, to: ExecutionId) -> Result<()> {
        let process_instance_id = self.get(to)?.process_instance_id;
        if let Some(sub) = self.subscriptions.get_mut(&id) {
            sub.execution_id = to;
            sub.process_instance_id = process_instance_id;
            self.changes.insert_subscription(id);
        }
        Ok(())
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &EventSubscription> {
        self.subscriptions.values()
    }

    fn subscription_ids_of(&self, execution_id: ExecutionId) -> Vec<SubscriptionId> {
        self.subscriptions
            .values()
            .filter(|s| s.execution_id == execution_id)
            .map(|s| s.id)
            .collect()
    }

    /// Subscriptions owned by one execution, oldest first
    pub fn subscriptions_of(&self, execution_id: ExecutionId) -> Vec<&EventSubscription> {
        self.subscriptions
            .values()
            .filter(|s| s.execution_id == execution_id)
            .collect()
    }

    /// Signal subscriptions across all instances for a signal name
    pub fn signal_subscriptions(&self, name: &str) -> Vec<SubscriptionId> {
        self.subscriptions
            .values()
            .filter(|s| s.kind == SubscriptionKind::Signal && s.event_name == name)
            .map(|s| s.id)
            .collect()
    }

    /// Message subscription of an execution for a message name
    pub fn message_subscription(
        &self,
        execution_id: ExecutionId,
        name: &str,
    ) -> Option<SubscriptionId> {
        self.subscriptions
            .values()
            .find(|s| {
                s.kind == SubscriptionKind::Message
                    && s.execution_id == execution_id
                    && s.event_name == name
            })
            .map(|s| s.id)
    }

    /// Timer subscription created together with a job
    pub fn subscription_by_job(&self, job_id: &JobId) -> Option<SubscriptionId> {
        self.subscriptions
            .values()
            .find(|s| {
                s.kind == SubscriptionKind::Timer
                    && s.configuration.as_deref() == Some(job_id.as_str())
            })
            .map(|s| s.id)
    }

    /// Compensation subscriptions of one execution, oldest first
    pub fn compensate_subscriptions(&self, execution_id: ExecutionId) -> Vec<SubscriptionId> {
        self.subscriptions
            .values()
            .filter(|s| s.is_compensation() && s.execution_id == execution_id)
            .map(|s| s.id)
            .collect()
    }

    /// Compensation subscriptions anywhere in a process instance, oldest first
    pub fn instance_compensate_subscriptions(
        &self,
        process_instance_id: ExecutionId,
    ) -> Vec<SubscriptionId> {
        self.subscriptions
            .values()
            .filter(|s| s.is_compensation() && s.process_instance_id == process_instance_id)
            .map(|s| s.id)
            .collect()
    }

    // ------------------------------------------------------------------
    // Timer jobs
    // ------------------------------------------------------------------

    pub fn add_job(&mut self, job: TimerJob) {
        self.changes.insert_job(job.id.clone());
        self.jobs.insert(job.id.clone(), job);
    }

    pub fn job(&self, id: &JobId) -> Option<&TimerJob> {
        self.jobs.get(id)
    }

    pub fn remove_job(&mut self, id: &JobId) -> Option<TimerJob> {
        let removed = self.jobs.remove(id);
        if removed.is_some() {
            self.changes.delete_job(id.clone());
        }
        removed
    }

    pub fn jobs(&self) -> impl Iterator<Item = &TimerJob> {
        self.jobs.values()
    }

    fn job_ids_of(&self, execution_id: ExecutionId) -> Vec<JobId> {
        self.jobs
            .values()
            .filter(|j| j.execution_id == execution_id)
            .map(|j| j.id.clone())
            .collect()
    }

    /// Jobs owned by one execution
    pub fn jobs_of(&self, execution_id: ExecutionId) -> Vec<&TimerJob> {
        self.jobs
            .values()
            .filter(|j| j.execution_id == execution_id)
            .collect()
    }

    // ------------------------------------------------------------------
    // Change tracking
    // ------------------------------------------------------------------

    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    pub fn take_changes(&mut self) -> ChangeSet {
        std::mem::take(&mut self.changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn instance() -> (ExecutionTree, ExecutionId) {
        let mut tree = ExecutionTree::new();
        let root = tree.create_process_instance("order:1", "start");
        (tree, root)
    }

    #[test]
    fn test_root_is_scope() {
        let (tree, root) = instance();
        let exec = tree.get(root).unwrap();
        assert!(exec.is_scope);
        assert!(exec.is_process_instance());
        assert_eq!(exec.process_instance_id, root);
    }

    #[test]
    fn test_concurrent_child_wraps_existing_scope_child() {
        let (mut tree, root) = instance();
        let scope = tree.create_child(root).unwrap();
        {
            let s = tree.get_mut(scope).unwrap();
            s.is_scope = true;
            s.scope_node = Some("review".into());
        }

        let branch = tree.create_concurrent_child(root).unwrap();
        let children = tree.children(root).unwrap().to_vec();
        assert_eq!(children.len(), 2);
        assert!(children.contains(&branch));

        let wrapper = tree.get(scope).unwrap().parent.unwrap();
        assert_ne!(wrapper, root);
        let wrapper = tree.get(wrapper).unwrap();
        assert!(wrapper.is_concurrent);
        assert!(!wrapper.is_active);
        assert_eq!(wrapper.node(), Some("review"));
        assert!(tree.get(branch).unwrap().is_concurrent);
    }

    #[test]
    fn test_variable_scoping() {
        let (mut tree, root) = instance();
        let branch = tree.create_concurrent_child(root).unwrap();
        tree.set_variable(branch, "amount", json!(10)).unwrap();
        // Undeclared variables land on the instance root
        assert!(tree.get(branch).unwrap().variables.is_empty());
        assert_eq!(tree.get_variable(branch, "amount"), Some(&json!(10)));

        tree.set_variable_local(branch, "amount", json!(20)).unwrap();
        assert_eq!(tree.get_variable(branch, "amount"), Some(&json!(20)));
        assert_eq!(tree.get_variable(root, "amount"), Some(&json!(10)));
        assert_eq!(tree.variables(branch).get("amount"), Some(&json!(20)));
    }

    #[test]
    fn test_remove_cascades_to_subscriptions_and_sub_instances() {
        let (mut tree, root) = instance();
        let child = tree.create_child(root).unwrap();
        let grandchild = tree.create_child(child).unwrap();
        tree.add_subscription(SubscriptionKind::Signal, "alert", grandchild, "catch", None)
            .unwrap();

        let sub_instance = tree.create_process_instance("billing:1", "start");
        tree.get_mut(sub_instance).unwrap().super_execution = Some(grandchild);
        tree.get_mut(grandchild).unwrap().sub_process_instance = Some(sub_instance);

        let removed = tree.remove(child).unwrap();
        assert_eq!(removed.executions.len(), 3);
        assert_eq!(removed.subscriptions.len(), 1);
        assert!(tree.children(root).unwrap().is_empty());
        assert!(!tree.contains(sub_instance));
        assert!(tree.signal_subscriptions("alert").is_empty());
    }

    #[test]
    fn test_inactive_concurrent_lookup() {
        let (mut tree, root) = instance();
        let a = tree.create_concurrent_child(root).unwrap();
        let b = tree.create_concurrent_child(root).unwrap();
        for id in [a, b] {
            tree.get_mut(id).unwrap().node_id = Some("join".into());
        }
        tree.get_mut(a).unwrap().is_active = false;

        let joined = tree.find_inactive_concurrent_executions(root, "join").unwrap();
        assert_eq!(joined, vec![a]);
        assert_eq!(tree.concurrent_root(b).unwrap(), root);
        assert_eq!(tree.concurrent_root(root).unwrap(), root);
    }

    #[test]
    fn test_change_tracking() {
        let (mut tree, root) = instance();
        let changes = tree.take_changes();
        assert!(changes.inserted.contains(&root));

        tree.force_update(root).unwrap();
        let temp = tree.create_child(root).unwrap();
        tree.remove(temp).unwrap();
        let changes = tree.take_changes();
        assert!(changes.forced.contains(&root));
        assert!(changes.updated.contains(&root));
        assert!(!changes.inserted.contains(&temp));
        assert!(!changes.deleted.contains(&temp));
    }

    #[test]
    fn test_serde_round_trip_keeps_arena() {
        let (mut tree, root) = instance();
        tree.create_concurrent_child(root).unwrap();
        tree.add_subscription(SubscriptionKind::Message, "paid", root, "wait", None)
            .unwrap();
        let json = serde_json::to_string(&tree).unwrap();
        let back: ExecutionTree = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 2);
        assert!(back.message_subscription(root, "paid").is_some());
    }
}
