//! Process graph model: definitions, builder, validation and repository

pub mod builder;
pub mod definition;
pub mod repository;
pub mod validation;

pub use builder::ProcessBuilder;
pub use definition::{
    Association, EventDefinition, FlowNode, LoopCharacteristics, NodeKind, ProcessDefinition,
    SequenceFlow, TimerDefinition, VariableMapping,
};
pub use repository::{DefinitionMetadata, ProcessRepository};
pub use validation::{validate_process, ValidationError};
