//! Execution records
//!
//! An execution is one node of a process instance's runtime tree. Records
//! live in the `ExecutionTree` arena and refer to each other by id only.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Arena key of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub u64);

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Part an execution plays inside a multi-instance activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoopRole {
    /// Holds the loop counters and owns every instance
    Root,
    /// One iteration, carrying its own `loopCounter`
    Instance,
    /// Extra scope under a parallel instance whose inner activity is a container
    InstanceScope,
}

/// A node of the runtime tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: ExecutionId,
    /// Owning parent; `None` for a process instance root
    pub parent: Option<ExecutionId>,
    /// Owned children in creation order
    pub children: Vec<ExecutionId>,
    pub process_instance_id: ExecutionId,
    pub definition_id: String,
    /// Graph node the execution currently sits at
    pub node_id: Option<String>,
    pub is_active: bool,
    pub is_concurrent: bool,
    pub is_scope: bool,
    /// Activity whose entry created this scope; `None` for instance roots
    pub scope_node: Option<String>,
    pub loop_role: Option<LoopRole>,
    pub variables: BTreeMap<String, Value>,
    /// Call activity execution waiting on this instance. Not owned: deleting
    /// this instance never deletes the super execution.
    pub super_execution: Option<ExecutionId>,
    /// Root of the sub-process instance started by this call activity
    pub sub_process_instance: Option<ExecutionId>,
    /// Execution that threw the compensation this handler runs for
    pub compensation_for: Option<ExecutionId>,
    /// Version persisted by the execution store
    pub revision: u64,
}

impl Execution {
    pub(crate) fn new(
        id: ExecutionId,
        parent: Option<ExecutionId>,
        process_instance_id: ExecutionId,
        definition_id: impl Into<String>,
    ) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            process_instance_id,
            definition_id: definition_id.into(),
            node_id: None,
            is_active: true,
            is_concurrent: false,
            is_scope: false,
            scope_node: None,
            loop_role: None,
            variables: BTreeMap::new(),
            super_execution: None,
            sub_process_instance: None,
            compensation_for: None,
            revision: 0,
        }
    }

    pub fn is_process_instance(&self) -> bool {
        self.parent.is_none()
    }

    pub fn node(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    /// Whether this scope was created by an activity rather than a process start
    pub fn is_activity_scope(&self) -> bool {
        self.is_scope && self.scope_node.is_some()
    }

    /// Whether this execution is a multi-instance iteration (or its scope)
    pub fn is_loop_instance(&self) -> bool {
        matches!(
            self.loop_role,
            Some(LoopRole::Instance) | Some(LoopRole::InstanceScope)
        )
    }
}
