//! Fluent builder for process definitions
//!
//! Provides a compact API for constructing process graphs programmatically,
//! mostly used by tests and by callers that assemble definitions in code.

use super::definition::{
    Association, EventDefinition, FlowNode, LoopCharacteristics, NodeKind, ProcessDefinition,
    SequenceFlow, TimerDefinition, VariableMapping,
};

/// Fluent builder for process definitions
///
/// Node modifiers (`in_scope`, `named`, `parallel_multi_instance`, ...) apply to
/// the most recently added node; `skip_expression` applies to the most
/// recently added flow.
///
/// # Example
///
/// ```ignore
/// let def = ProcessBuilder::new("approval", "Approval")
///     .start_event("start")
///     .user_task("review")
///     .exclusive_gateway("decide")
///     .end_event("approved")
///     .end_event("rejected")
///     .flow("start", "review")
///     .flow("review", "decide")
///     .conditional_flow("decide", "approved", "${approved}")
///     .default_flow("decide", "rejected")
///     .build();
/// ```
pub struct ProcessBuilder {
    definition: ProcessDefinition,
    flow_counter: usize,
}

impl ProcessBuilder {
    /// Create a new builder
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            definition: ProcessDefinition::new(key, name),
            flow_counter: 0,
        }
    }

    /// Add a fully specified node
    pub fn node(mut self, node: FlowNode) -> Self {
        self.definition.nodes.push(node);
        self
    }

    fn add(self, id: impl Into<String>, kind: NodeKind) -> Self {
        self.node(FlowNode {
            id: id.into(),
            name: None,
            kind,
            parent: None,
            default_flow: None,
            loop_characteristics: None,
            is_for_compensation: false,
        })
    }

    pub fn start_event(self, id: impl Into<String>) -> Self {
        self.add(id, NodeKind::StartEvent)
    }

    pub fn end_event(self, id: impl Into<String>) -> Self {
        self.add(id, NodeKind::EndEvent { event: None })
    }

    /// End event carrying an event definition (error, signal, terminate, ...)
    pub fn end_event_with(self, id: impl Into<String>, event: EventDefinition) -> Self {
        self.add(id, NodeKind::EndEvent { event: Some(event) })
    }

    pub fn terminate_end_event(self, id: impl Into<String>) -> Self {
        self.end_event_with(id, EventDefinition::Terminate)
    }

    pub fn error_end_event(self, id: impl Into<String>, code: impl Into<String>) -> Self {
        self.end_event_with(id, EventDefinition::Error { code: Some(code.into()) })
    }

    pub fn cancel_end_event(self, id: impl Into<String>) -> Self {
        self.end_event_with(id, EventDefinition::Cancel)
    }

    pub fn task(self, id: impl Into<String>) -> Self {
        self.add(id, NodeKind::Task)
    }

    pub fn user_task(self, id: impl Into<String>) -> Self {
        self.add(id, NodeKind::UserTask)
    }

    pub fn receive_task(self, id: impl Into<String>) -> Self {
        self.add(id, NodeKind::ReceiveTask)
    }

    pub fn service_task(self, id: impl Into<String>, handler: impl Into<String>) -> Self {
        self.add(id, NodeKind::ServiceTask { handler: handler.into() })
    }

    pub fn exclusive_gateway(self, id: impl Into<String>) -> Self {
        self.add(id, NodeKind::ExclusiveGateway)
    }

    pub fn parallel_gateway(self, id: impl Into<String>) -> Self {
        self.add(id, NodeKind::ParallelGateway)
    }

    pub fn inclusive_gateway(self, id: impl Into<String>) -> Self {
        self.add(id, NodeKind::InclusiveGateway)
    }

    pub fn event_based_gateway(self, id: impl Into<String>) -> Self {
        self.add(id, NodeKind::EventBasedGateway)
    }

    pub fn catch_event(self, id: impl Into<String>, event: EventDefinition) -> Self {
        self.add(id, NodeKind::IntermediateCatchEvent { event })
    }

    pub fn signal_catch_event(self, id: impl Into<String>, signal: impl Into<String>) -> Self {
        self.catch_event(id, EventDefinition::Signal { name: signal.into() })
    }

    pub fn message_catch_event(self, id: impl Into<String>, message: impl Into<String>) -> Self {
        self.catch_event(id, EventDefinition::Message { name: message.into() })
    }

    pub fn timer_catch_event(self, id: impl Into<String>, timer: TimerDefinition) -> Self {
        self.catch_event(id, EventDefinition::Timer(timer))
    }

    pub fn throw_event(self, id: impl Into<String>, event: Option<EventDefinition>) -> Self {
        self.add(id, NodeKind::IntermediateThrowEvent { event })
    }

    pub fn signal_throw_event(self, id: impl Into<String>, signal: impl Into<String>) -> Self {
        self.throw_event(id, Some(EventDefinition::Signal { name: signal.into() }))
    }

    /// Compensation throw; `activity_ref = None` compensates the whole scope
    pub fn compensate_throw_event(self, id: impl Into<String>, activity_ref: Option<&str>) -> Self {
        self.throw_event(
            id,
            Some(EventDefinition::Compensate {
                activity_ref: activity_ref.map(str::to_string),
            }),
        )
    }

    pub fn boundary_event(
        self,
        id: impl Into<String>,
        attached_to: impl Into<String>,
        event: EventDefinition,
        cancel_activity: bool,
    ) -> Self {
        self.add(
            id,
            NodeKind::BoundaryEvent {
                attached_to: attached_to.into(),
                cancel_activity,
                event,
            },
        )
    }

    pub fn timer_boundary_event(
        self,
        id: impl Into<String>,
        attached_to: impl Into<String>,
        timer: TimerDefinition,
        cancel_activity: bool,
    ) -> Self {
        self.boundary_event(id, attached_to, EventDefinition::Timer(timer), cancel_activity)
    }

    pub fn signal_boundary_event(
        self,
        id: impl Into<String>,
        attached_to: impl Into<String>,
        signal: impl Into<String>,
        cancel_activity: bool,
    ) -> Self {
        self.boundary_event(
            id,
            attached_to,
            EventDefinition::Signal { name: signal.into() },
            cancel_activity,
        )
    }

    pub fn message_boundary_event(
        self,
        id: impl Into<String>,
        attached_to: impl Into<String>,
        message: impl Into<String>,
        cancel_activity: bool,
    ) -> Self {
        self.boundary_event(
            id,
            attached_to,
            EventDefinition::Message { name: message.into() },
            cancel_activity,
        )
    }

    /// Error boundary; `code = None` catches every error
    pub fn error_boundary_event(
        self,
        id: impl Into<String>,
        attached_to: impl Into<String>,
        code: Option<&str>,
    ) -> Self {
        self.boundary_event(
            id,
            attached_to,
            EventDefinition::Error { code: code.map(str::to_string) },
            true,
        )
    }

    pub fn cancel_boundary_event(self, id: impl Into<String>, attached_to: impl Into<String>) -> Self {
        self.boundary_event(id, attached_to, EventDefinition::Cancel, true)
    }

    /// Compensation boundary linked to its handler activity
    pub fn compensate_boundary_event(
        mut self,
        id: impl Into<String>,
        attached_to: impl Into<String>,
        handler: impl Into<String>,
    ) -> Self {
        let id = id.into();
        self.definition.associations.push(Association {
            source: id.clone(),
            target: handler.into(),
        });
        self.boundary_event(id, attached_to, EventDefinition::Compensate { activity_ref: None }, false)
    }

    pub fn sub_process(self, id: impl Into<String>) -> Self {
        self.add(id, NodeKind::SubProcess)
    }

    pub fn transaction(self, id: impl Into<String>) -> Self {
        self.add(id, NodeKind::Transaction)
    }

    pub fn call_activity(self, id: impl Into<String>, called_element: impl Into<String>) -> Self {
        self.add(
            id,
            NodeKind::CallActivity {
                called_element: called_element.into(),
                inputs: Vec::new(),
                outputs: Vec::new(),
            },
        )
    }

    /// Copy `source` into the sub-instance as `target` (call activity only)
    pub fn with_input(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        if let Some(FlowNode {
            kind: NodeKind::CallActivity { inputs, .. },
            ..
        }) = self.definition.nodes.last_mut()
        {
            inputs.push(VariableMapping { source: source.into(), target: target.into() });
        }
        self
    }

    /// Copy `source` from the sub-instance back as `target` (call activity only)
    pub fn with_output(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        if let Some(FlowNode {
            kind: NodeKind::CallActivity { outputs, .. },
            ..
        }) = self.definition.nodes.last_mut()
        {
            outputs.push(VariableMapping { source: source.into(), target: target.into() });
        }
        self
    }

    /// Place the most recently added node inside a sub-process
    pub fn in_scope(mut self, container: impl Into<String>) -> Self {
        if let Some(node) = self.definition.nodes.last_mut() {
            node.parent = Some(container.into());
        }
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        if let Some(node) = self.definition.nodes.last_mut() {
            node.name = Some(name.into());
        }
        self
    }

    pub fn for_compensation(mut self) -> Self {
        if let Some(node) = self.definition.nodes.last_mut() {
            node.is_for_compensation = true;
        }
        self
    }

    pub fn multi_instance(mut self, loop_characteristics: LoopCharacteristics) -> Self {
        if let Some(node) = self.definition.nodes.last_mut() {
            node.loop_characteristics = Some(loop_characteristics);
        }
        self
    }

    pub fn parallel_multi_instance(self, cardinality: impl Into<String>) -> Self {
        self.multi_instance(LoopCharacteristics {
            loop_cardinality: Some(cardinality.into()),
            ..Default::default()
        })
    }

    pub fn sequential_multi_instance(self, cardinality: impl Into<String>) -> Self {
        self.multi_instance(LoopCharacteristics {
            is_sequential: true,
            loop_cardinality: Some(cardinality.into()),
            ..Default::default()
        })
    }

    /// Set the completion condition of the last node's loop
    pub fn completion_condition(mut self, condition: impl Into<String>) -> Self {
        if let Some(lc) = self
            .definition
            .nodes
            .last_mut()
            .and_then(|n| n.loop_characteristics.as_mut())
        {
            lc.completion_condition = Some(condition.into());
        }
        self
    }

    /// Add a flow with an auto-generated ID
    pub fn flow(self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.push_flow(source.into(), target.into(), None)
    }

    /// Add a flow with an explicit ID
    pub fn flow_with_id(
        mut self,
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        self.definition.flows.push(SequenceFlow {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition: None,
            skip_expression: None,
        });
        self
    }

    pub fn conditional_flow(
        self,
        source: impl Into<String>,
        target: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        self.push_flow(source.into(), target.into(), Some(condition.into()))
    }

    /// Add a flow and mark it as the source node's default flow
    pub fn default_flow(self, source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let mut builder = self.push_flow(source.clone(), target.into(), None);
        let flow_id = builder.definition.flows.last().map(|f| f.id.clone());
        if let Some(node) = builder.definition.nodes.iter_mut().find(|n| n.id == source) {
            node.default_flow = flow_id;
        }
        builder
    }

    /// Set the skip expression of the most recently added flow
    pub fn skip_expression(mut self, expression: impl Into<String>) -> Self {
        if let Some(flow) = self.definition.flows.last_mut() {
            flow.skip_expression = Some(expression.into());
        }
        self
    }

    fn push_flow(mut self, source: String, target: String, condition: Option<String>) -> Self {
        self.flow_counter += 1;
        self.definition.flows.push(SequenceFlow {
            id: format!("flow-{}", self.flow_counter),
            source,
            target,
            condition,
            skip_expression: None,
        });
        self
    }

    /// Build the definition without validation
    ///
    /// Boundary events without an explicit scope inherit the scope of the
    /// activity they are attached to.
    pub fn build(mut self) -> ProcessDefinition {
        let parents: Vec<(usize, Option<String>)> = self
            .definition
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(idx, node)| match &node.kind {
                NodeKind::BoundaryEvent { attached_to, .. } if node.parent.is_none() => Some((
                    idx,
                    self.definition.node(attached_to).and_then(|a| a.parent.clone()),
                )),
                _ => None,
            })
            .collect();
        for (idx, parent) in parents {
            self.definition.nodes[idx].parent = parent;
        }
        self.definition
    }
}
