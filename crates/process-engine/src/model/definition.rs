//! Read-only process graph shared by every instance of a definition
//!
//! Nodes and sequence flows are stored flat; nesting inside sub-processes is
//! expressed through `FlowNode::parent`. Definitions are serde-serializable so
//! the repository can persist them, but no particular interchange format is
//! implied.

use serde::{Deserialize, Serialize};

use crate::error::{ProcessEngineError, Result};

/// A deployed (or deployable) process graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDefinition {
    /// Assigned on deploy as `key:version`
    #[serde(default)]
    pub id: String,
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub version: u32,
    pub nodes: Vec<FlowNode>,
    pub flows: Vec<SequenceFlow>,
    /// Links from compensation boundary events to their handler activities
    #[serde(default)]
    pub associations: Vec<Association>,
}

/// A node in the process graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowNode {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub kind: NodeKind,
    /// Containing sub-process, `None` at process level
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub default_flow: Option<String>,
    #[serde(default)]
    pub loop_characteristics: Option<LoopCharacteristics>,
    #[serde(default)]
    pub is_for_compensation: bool,
}

/// Closed set of node types the runtime knows how to drive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeKind {
    StartEvent,
    #[serde(rename_all = "camelCase")]
    EndEvent {
        #[serde(default)]
        event: Option<EventDefinition>,
    },
    /// None or manual task; passes straight through
    Task,
    UserTask,
    ReceiveTask,
    #[serde(rename_all = "camelCase")]
    ServiceTask { handler: String },
    ExclusiveGateway,
    ParallelGateway,
    InclusiveGateway,
    EventBasedGateway,
    #[serde(rename_all = "camelCase")]
    IntermediateCatchEvent { event: EventDefinition },
    #[serde(rename_all = "camelCase")]
    IntermediateThrowEvent {
        #[serde(default)]
        event: Option<EventDefinition>,
    },
    #[serde(rename_all = "camelCase")]
    BoundaryEvent {
        attached_to: String,
        #[serde(default = "default_true")]
        cancel_activity: bool,
        event: EventDefinition,
    },
    SubProcess,
    Transaction,
    #[serde(rename_all = "camelCase")]
    CallActivity {
        called_element: String,
        #[serde(default)]
        inputs: Vec<VariableMapping>,
        #[serde(default)]
        outputs: Vec<VariableMapping>,
    },
}

fn default_true() -> bool {
    true
}

impl NodeKind {
    /// Short human-readable label
    pub fn label(&self) -> &'static str {
        match self {
            Self::StartEvent => "Start Event",
            Self::EndEvent { .. } => "End Event",
            Self::Task => "Task",
            Self::UserTask => "User Task",
            Self::ReceiveTask => "Receive Task",
            Self::ServiceTask { .. } => "Service Task",
            Self::ExclusiveGateway => "Exclusive Gateway",
            Self::ParallelGateway => "Parallel Gateway",
            Self::InclusiveGateway => "Inclusive Gateway",
            Self::EventBasedGateway => "Event-Based Gateway",
            Self::IntermediateCatchEvent { .. } => "Intermediate Catch Event",
            Self::IntermediateThrowEvent { .. } => "Intermediate Throw Event",
            Self::BoundaryEvent { .. } => "Boundary Event",
            Self::SubProcess => "Sub-Process",
            Self::Transaction => "Transaction",
            Self::CallActivity { .. } => "Call Activity",
        }
    }

    /// Tasks, sub-processes and call activities
    pub fn is_activity(&self) -> bool {
        matches!(
            self,
            Self::Task
                | Self::UserTask
                | Self::ReceiveTask
                | Self::ServiceTask { .. }
                | Self::SubProcess
                | Self::Transaction
                | Self::CallActivity { .. }
        )
    }

    /// Nodes whose children form their own flow scope
    pub fn is_container(&self) -> bool {
        matches!(self, Self::SubProcess | Self::Transaction)
    }
}

/// Event definition carried by catch, throw, boundary and end events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventDefinition {
    Signal {
        name: String,
    },
    Message {
        name: String,
    },
    Timer(TimerDefinition),
    Error {
        #[serde(default)]
        code: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Compensate {
        #[serde(default)]
        activity_ref: Option<String>,
    },
    Cancel,
    Terminate,
}

/// Timer specification handed to the timer service unparsed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerDefinition {
    #[serde(default)]
    pub time_date: Option<String>,
    #[serde(default)]
    pub time_duration: Option<String>,
    #[serde(default)]
    pub time_cycle: Option<String>,
}

impl TimerDefinition {
    pub fn duration(expr: impl Into<String>) -> Self {
        Self {
            time_duration: Some(expr.into()),
            ..Default::default()
        }
    }
}

/// Multi-instance configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopCharacteristics {
    #[serde(default)]
    pub is_sequential: bool,
    /// Expression resolving to the number of instances
    #[serde(default)]
    pub loop_cardinality: Option<String>,
    /// Expression resolving to an array; one instance per element
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub element_variable: Option<String>,
    #[serde(default)]
    pub completion_condition: Option<String>,
}

/// Directed edge between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceFlow {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub skip_expression: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Association {
    pub source: String,
    pub target: String,
}

/// Copies a variable between a call activity and its sub-instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableMapping {
    pub source: String,
    pub target: String,
}

impl ProcessDefinition {
    /// Create an empty definition
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            key: key.into(),
            name: name.into(),
            version: 0,
            nodes: Vec::new(),
            flows: Vec::new(),
            associations: Vec::new(),
        }
    }

    /// Find a node by ID
    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Find a node by ID or fail with `NodeNotFound`
    pub fn require_node(&self, id: &str) -> Result<&FlowNode> {
        self.node(id).ok_or_else(|| ProcessEngineError::NodeNotFound {
            definition_id: self.id.clone(),
            node_id: id.to_string(),
        })
    }

    /// Find a sequence flow by ID
    pub fn flow(&self, id: &str) -> Option<&SequenceFlow> {
        self.flows.iter().find(|f| f.id == id)
    }

    /// Outgoing flows of a node in declaration order
    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a SequenceFlow> {
        self.flows.iter().filter(move |f| f.source == node_id)
    }

    /// Incoming flows of a node in declaration order
    pub fn incoming<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a SequenceFlow> {
        self.flows.iter().filter(move |f| f.target == node_id)
    }

    /// Boundary events attached to an activity
    pub fn boundary_events<'a, 'b>(
        &'a self,
        activity_id: &'b str,
    ) -> impl Iterator<Item = &'a FlowNode> + 'b
    where
        'a: 'b,
    {
        self.nodes.iter().filter(move |n| {
            matches!(&n.kind, NodeKind::BoundaryEvent { attached_to, .. } if attached_to == activity_id)
        })
    }

    /// The none start event of a scope (`None` = process level)
    pub fn start_event(&self, scope: Option<&str>) -> Option<&FlowNode> {
        self.nodes
            .iter()
            .find(|n| n.kind == NodeKind::StartEvent && n.parent.as_deref() == scope)
    }

    /// Whether `node_id` sits inside `container`, directly or nested
    pub fn is_within(&self, node_id: &str, container: &str) -> bool {
        let mut current = self.node(node_id).and_then(|n| n.parent.as_deref());
        while let Some(parent) = current {
            if parent == container {
                return true;
            }
            current = self.node(parent).and_then(|n| n.parent.as_deref());
        }
        false
    }

    /// Whether entering this node creates a scope execution
    ///
    /// Containers, multi-instance wrappers and activities carrying boundary
    /// events (other than compensation, which only acts after completion)
    /// get their own scope.
    pub fn is_scope(&self, node: &FlowNode) -> bool {
        node.kind.is_container()
            || node.loop_characteristics.is_some()
            || self.boundary_events(&node.id).any(|b| {
                !matches!(
                    b.kind,
                    NodeKind::BoundaryEvent {
                        event: EventDefinition::Compensate { .. },
                        ..
                    }
                )
            })
    }

    /// Compensation boundary attached to an activity, if any
    pub fn compensation_boundary(&self, activity_id: &str) -> Option<&FlowNode> {
        self.boundary_events(activity_id).find(|b| {
            matches!(
                b.kind,
                NodeKind::BoundaryEvent {
                    event: EventDefinition::Compensate { .. },
                    ..
                }
            )
        })
    }

    /// Handler activity associated with a compensation boundary event
    pub fn compensation_handler(&self, boundary_id: &str) -> Option<&FlowNode> {
        self.associations
            .iter()
            .find(|a| a.source == boundary_id)
            .and_then(|a| self.node(&a.target))
    }

    /// Whether any path of sequence flows leads from `from` to `to`
    ///
    /// Leaving a sub-process through its end is followed too, so tokens
    /// nested deeper still count as able to reach an outer node.
    pub fn can_reach(&self, from: &str, to: &str) -> bool {
        let mut visited = std::collections::HashSet::new();
        let mut queue = std::collections::VecDeque::from([from.to_string()]);
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }
            for flow in self.outgoing(&current) {
                if flow.target == to {
                    return true;
                }
                queue.push_back(flow.target.clone());
            }
            if let Some(parent) = self.node(&current).and_then(|n| n.parent.clone()) {
                queue.push_back(parent);
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::builder::ProcessBuilder;

    fn nested() -> ProcessDefinition {
        ProcessBuilder::new("nested", "Nested")
            .start_event("start")
            .sub_process("sp")
            .start_event("sp-start")
            .in_scope("sp")
            .user_task("inner")
            .in_scope("sp")
            .end_event("sp-end")
            .in_scope("sp")
            .timer_boundary_event("timeout", "sp", TimerDefinition::duration("PT1H"), true)
            .end_event("end")
            .flow("start", "sp")
            .flow("sp-start", "inner")
            .flow("inner", "sp-end")
            .flow("sp", "end")
            .build()
    }

    #[test]
    fn test_flow_lookups() {
        let def = nested();
        assert_eq!(def.outgoing("start").count(), 1);
        assert_eq!(def.incoming("end").count(), 1);
        assert_eq!(def.start_event(None).unwrap().id, "start");
        assert_eq!(def.start_event(Some("sp")).unwrap().id, "sp-start");
        assert!(def.require_node("missing").is_err());
    }

    #[test]
    fn test_scope_detection() {
        let def = nested();
        assert!(def.is_scope(def.node("sp").unwrap()));
        assert!(!def.is_scope(def.node("inner").unwrap()));
        assert!(def.is_within("inner", "sp"));
        assert!(!def.is_within("timeout", "sp"));
    }

    #[test]
    fn test_boundary_lookup_outlives_activity_id() {
        let def = ProcessBuilder::new("comp", "Comp")
            .start_event("start")
            .task("book")
            .compensate_boundary_event("book-comp", "book", "unbook")
            .task("unbook")
            .for_compensation()
            .end_event("end")
            .flow("start", "book")
            .flow("book", "end")
            .build();

        let found = {
            let activity = String::from("book");
            def.compensation_boundary(&activity)
        };
        assert_eq!(found.map(|b| b.id.as_str()), Some("book-comp"));

        let timeout = {
            let activity = String::from("sp");
            nested().boundary_events(&activity).count()
        };
        assert_eq!(timeout, 1);
    }

    #[test]
    fn test_reachability_leaves_sub_process() {
        let def = nested();
        assert!(def.can_reach("inner", "end"));
        assert!(!def.can_reach("end", "start"));
    }

    #[test]
    fn test_serde_round_trip_keeps_kinds() {
        let def = nested();
        let json = serde_json::to_string(&def).unwrap();
        let back: ProcessDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back.node("timeout").unwrap().kind, def.node("timeout").unwrap().kind);
    }
}
