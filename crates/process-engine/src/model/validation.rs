//! Structural validation of process definitions
//!
//! Run on deploy so that broken references surface before any instance
//! starts. Runtime-only problems (an exclusive gateway with no true
//! condition, a negative cardinality) are still raised as modeling errors
//! by the behaviors themselves.

use std::collections::{HashMap, HashSet};

use super::definition::{EventDefinition, NodeKind, ProcessDefinition};

/// Validation error with location context
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// A scope (process or sub-process) has no none start event
    MissingStartEvent { scope: Option<String> },
    /// A scope has more than one none start event
    MultipleStartEvents { scope: Option<String> },
    /// Two nodes share an ID
    DuplicateNode { node_id: String },
    /// A flow references a non-existent node
    UnknownNode { flow_id: String, node_id: String },
    /// A node is placed inside something that is not a sub-process
    InvalidParent { node_id: String, parent: String },
    /// A boundary event is attached to a non-existent node
    UnknownAttachment { boundary_id: String, attached_to: String },
    /// A default flow is not among the node's outgoing flows
    InvalidDefaultFlow { node_id: String, flow_id: String },
    /// A cancel event is used outside a transaction
    CancelOutsideTransaction { node_id: String },
    /// A call activity names no process to call
    MissingCalledElement { node_id: String },
    /// A compensation boundary has no associated handler
    MissingCompensationHandler { boundary_id: String },
    /// A multi-instance node has neither cardinality nor collection
    MissingLoopCardinality { node_id: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingStartEvent { scope } => match scope {
                Some(scope) => write!(f, "Sub-process '{}' has no start event", scope),
                None => write!(f, "Process has no start event"),
            },
            Self::MultipleStartEvents { scope } => match scope {
                Some(scope) => write!(f, "Sub-process '{}' has multiple start events", scope),
                None => write!(f, "Process has multiple start events"),
            },
            Self::DuplicateNode { node_id } => write!(f, "Duplicate node id '{}'", node_id),
            Self::UnknownNode { flow_id, node_id } => {
                write!(f, "Flow '{}' references unknown node '{}'", flow_id, node_id)
            }
            Self::InvalidParent { node_id, parent } => {
                write!(f, "Node '{}' is nested in '{}' which is not a sub-process", node_id, parent)
            }
            Self::UnknownAttachment {
                boundary_id,
                attached_to,
            } => {
                write!(
                    f,
                    "Boundary event '{}' is attached to unknown node '{}'",
                    boundary_id, attached_to
                )
            }
            Self::InvalidDefaultFlow { node_id, flow_id } => {
                write!(
                    f,
                    "Default flow '{}' of node '{}' is not one of its outgoing flows",
                    flow_id, node_id
                )
            }
            Self::CancelOutsideTransaction { node_id } => {
                write!(f, "Cancel event '{}' is not inside or attached to a transaction", node_id)
            }
            Self::MissingCalledElement { node_id } => {
                write!(f, "Call activity '{}' has no called element", node_id)
            }
            Self::MissingCompensationHandler { boundary_id } => {
                write!(f, "Compensation boundary '{}' has no handler", boundary_id)
            }
            Self::MissingLoopCardinality { node_id } => {
                write!(f, "Multi-instance node '{}' has neither cardinality nor collection", node_id)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validate a process definition
///
/// Returns all validation errors found (not just the first).
pub fn validate_process(definition: &ProcessDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    validate_node_ids(definition, &mut errors);
    validate_flow_references(definition, &mut errors);
    validate_start_events(definition, &mut errors);
    validate_node_properties(definition, &mut errors);

    errors
}

fn validate_node_ids(definition: &ProcessDefinition, errors: &mut Vec<ValidationError>) {
    let mut seen = HashSet::new();
    for node in &definition.nodes {
        if !seen.insert(node.id.as_str()) {
            errors.push(ValidationError::DuplicateNode {
                node_id: node.id.clone(),
            });
        }
        if let Some(parent) = &node.parent {
            let is_container = definition
                .node(parent)
                .map_or(false, |p| p.kind.is_container());
            if !is_container {
                errors.push(ValidationError::InvalidParent {
                    node_id: node.id.clone(),
                    parent: parent.clone(),
                });
            }
        }
    }
}

/// Check that all flow source/target nodes exist
fn validate_flow_references(definition: &ProcessDefinition, errors: &mut Vec<ValidationError>) {
    let node_ids: HashSet<&str> = definition.nodes.iter().map(|n| n.id.as_str()).collect();

    for flow in &definition.flows {
        for endpoint in [&flow.source, &flow.target] {
            if !node_ids.contains(endpoint.as_str()) {
                errors.push(ValidationError::UnknownNode {
                    flow_id: flow.id.clone(),
                    node_id: endpoint.clone(),
                });
            }
        }
    }
}

/// Exactly one none start event per scope that needs one
fn validate_start_events(definition: &ProcessDefinition, errors: &mut Vec<ValidationError>) {
    let mut counts: HashMap<Option<&str>, usize> = HashMap::new();
    counts.insert(None, 0);
    for node in &definition.nodes {
        if node.kind.is_container() {
            counts.entry(Some(node.id.as_str())).or_insert(0);
        }
    }
    for node in &definition.nodes {
        if node.kind == NodeKind::StartEvent {
            *counts.entry(node.parent.as_deref()).or_insert(0) += 1;
        }
    }

    let mut scopes: Vec<_> = counts.into_iter().collect();
    scopes.sort();
    for (scope, count) in scopes {
        let scope = scope.map(str::to_string);
        if count == 0 {
            errors.push(ValidationError::MissingStartEvent { scope });
        } else if count > 1 {
            errors.push(ValidationError::MultipleStartEvents { scope });
        }
    }
}

fn validate_node_properties(definition: &ProcessDefinition, errors: &mut Vec<ValidationError>) {
    for node in &definition.nodes {
        if let Some(default_flow) = &node.default_flow {
            if !definition.outgoing(&node.id).any(|f| &f.id == default_flow) {
                errors.push(ValidationError::InvalidDefaultFlow {
                    node_id: node.id.clone(),
                    flow_id: default_flow.clone(),
                });
            }
        }

        if let Some(lc) = &node.loop_characteristics {
            if lc.loop_cardinality.is_none() && lc.collection.is_none() {
                errors.push(ValidationError::MissingLoopCardinality {
                    node_id: node.id.clone(),
                });
            }
        }

        match &node.kind {
            NodeKind::BoundaryEvent {
                attached_to, event, ..
            } => match definition.node(attached_to) {
                None => errors.push(ValidationError::UnknownAttachment {
                    boundary_id: node.id.clone(),
                    attached_to: attached_to.clone(),
                }),
                Some(activity) => {
                    if *event == EventDefinition::Cancel && activity.kind != NodeKind::Transaction {
                        errors.push(ValidationError::CancelOutsideTransaction {
                            node_id: node.id.clone(),
                        });
                    }
                    if matches!(event, EventDefinition::Compensate { .. })
                        && definition.compensation_handler(&node.id).is_none()
                    {
                        errors.push(ValidationError::MissingCompensationHandler {
                            boundary_id: node.id.clone(),
                        });
                    }
                }
            },
            NodeKind::EndEvent {
                event: Some(EventDefinition::Cancel),
            } => {
                let in_transaction = node
                    .parent
                    .as_deref()
                    .and_then(|p| definition.node(p))
                    .map_or(false, |p| p.kind == NodeKind::Transaction);
                if !in_transaction {
                    errors.push(ValidationError::CancelOutsideTransaction {
                        node_id: node.id.clone(),
                    });
                }
            }
            NodeKind::CallActivity { called_element, .. } if called_element.trim().is_empty() => {
                errors.push(ValidationError::MissingCalledElement {
                    node_id: node.id.clone(),
                });
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::builder::ProcessBuilder;

    #[test]
    fn test_valid_process() {
        let def = ProcessBuilder::new("ok", "Ok")
            .start_event("start")
            .user_task("task")
            .end_event("end")
            .flow("start", "task")
            .flow("task", "end")
            .build();
        assert!(validate_process(&def).is_empty());
    }

    #[test]
    fn test_missing_start_and_unknown_flow_target() {
        let def = ProcessBuilder::new("bad", "Bad")
            .user_task("task")
            .flow("task", "nowhere")
            .build();

        let errors = validate_process(&def);
        assert!(errors.contains(&ValidationError::MissingStartEvent { scope: None }));
        assert!(errors.iter().any(|e| matches!(
            e,
            ValidationError::UnknownNode { node_id, .. } if node_id == "nowhere"
        )));
    }

    #[test]
    fn test_sub_process_needs_start() {
        let def = ProcessBuilder::new("sp", "Sub")
            .start_event("start")
            .sub_process("sp")
            .user_task("inner")
            .in_scope("sp")
            .flow("start", "sp")
            .build();

        let errors = validate_process(&def);
        assert_eq!(
            errors,
            vec![ValidationError::MissingStartEvent {
                scope: Some("sp".to_string())
            }]
        );
    }

    #[test]
    fn test_cancel_end_outside_transaction() {
        let def = ProcessBuilder::new("cancel", "Cancel")
            .start_event("start")
            .cancel_end_event("cancel")
            .flow("start", "cancel")
            .build();

        let errors = validate_process(&def);
        assert_eq!(
            errors,
            vec![ValidationError::CancelOutsideTransaction {
                node_id: "cancel".to_string()
            }]
        );
    }

    #[test]
    fn test_unknown_attachment_and_default_flow() {
        let mut def = ProcessBuilder::new("attach", "Attach")
            .start_event("start")
            .signal_boundary_event("b", "ghost", "sig", true)
            .flow("start", "b")
            .build();
        def.nodes[0].default_flow = Some("missing".to_string());

        let errors = validate_process(&def);
        assert!(errors.iter().any(|e| matches!(e, ValidationError::UnknownAttachment { .. })));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::InvalidDefaultFlow { .. })));
    }
}
