//! Error types for the process engine

use thiserror::Error;

use crate::model::validation::ValidationError;
use crate::runtime::ExecutionId;

/// Result type alias using ProcessEngineError
pub type Result<T> = std::result::Result<T, ProcessEngineError>;

/// Errors that can occur while deploying or running processes
///
/// Every error aborts the current command. Modeling errors and unhandled
/// business faults are the two kinds the behaviors raise themselves.
#[derive(Debug, Error)]
pub enum ProcessEngineError {
    /// No deployed definition matches the id or key
    #[error("Process definition not found: {0}")]
    DefinitionNotFound(String),

    /// A definition failed structural validation on deploy
    #[error("Process definition '{key}' is invalid: {}", format_validation(.errors))]
    Validation {
        key: String,
        errors: Vec<ValidationError>,
    },

    /// Graph node lookup failed
    #[error("Node '{node_id}' not found in definition '{definition_id}'")]
    NodeNotFound {
        definition_id: String,
        node_id: String,
    },

    /// Execution lookup failed
    #[error("Execution {0} not found")]
    ExecutionNotFound(ExecutionId),

    /// Timer job lookup failed
    #[error("Job '{0}' not found")]
    JobNotFound(String),

    /// No subscription matched an incoming message
    #[error("Execution {execution_id} has no subscription for message '{message}'")]
    NoMessageSubscription {
        execution_id: ExecutionId,
        message: String,
    },

    /// No outgoing sequence flow could be selected
    #[error("No outgoing sequence flow found for node '{node_id}'")]
    NoOutgoingSequenceFlow { node_id: String },

    /// Multi-instance cardinality resolved to something unusable
    #[error("Invalid number of instances for '{node_id}': must be a non-negative integer, got {value}")]
    InvalidCardinality { node_id: String, value: String },

    /// A boundary or end event could not find the scope it targets
    #[error("No scope execution found for '{node_id}'")]
    MissingBoundaryTarget { node_id: String },

    /// Any other error in the process model discovered at runtime
    #[error("Modeling error: {0}")]
    Modeling(String),

    /// A business fault reached the process root without a matching catch
    #[error("Unhandled error '{code}': {message}")]
    UnhandledError { code: String, message: String },

    /// Expression parsing or evaluation failed
    #[error("Expression error in '{expression}': {message}")]
    Expression { expression: String, message: String },

    /// A service task handler failed with a technical error
    #[error("Task '{node_id}' failed: {message}")]
    TaskFailed { node_id: String, message: String },

    /// Operation not allowed in the current execution state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The agenda ran more operations than the configured limit
    #[error("Command exceeded {0} operations")]
    OperationLimitExceeded(u32),

    /// The execution store rejected a stale revision
    #[error("Execution {execution_id} was updated concurrently (expected revision {expected})")]
    OptimisticLock {
        execution_id: ExecutionId,
        expected: u64,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Compression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessEngineError {
    /// Create a modeling error with a message
    pub fn modeling(msg: impl Into<String>) -> Self {
        Self::Modeling(msg.into())
    }

    /// Create an invalid state error with a message
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create an expression error
    pub fn expression(expression: &str, msg: impl Into<String>) -> Self {
        Self::Expression {
            expression: expression.to_string(),
            message: msg.into(),
        }
    }

    /// Whether this error comes from the process model rather than the caller
    pub fn is_modeling_error(&self) -> bool {
        matches!(
            self,
            Self::NoOutgoingSequenceFlow { .. }
                | Self::InvalidCardinality { .. }
                | Self::MissingBoundaryTarget { .. }
                | Self::Modeling(_)
                | Self::UnhandledError { .. }
        )
    }
}

fn format_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
