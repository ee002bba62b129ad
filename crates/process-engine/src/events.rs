//! History events emitted by the runtime
//!
//! The runtime reports scope start/end, flow traversal, deletions and
//! sub-process linkage to a `HistorySink`. Recording is fire-and-forget:
//! events are released when a command commits and a failing sink never
//! fails the command.

use serde::{Deserialize, Serialize};

use crate::runtime::ExecutionId;

/// Trait for receiving history events
///
/// This abstracts over the audit store (database table, log stream, channel)
/// so the engine never depends on how history is kept.
pub trait HistorySink: Send + Sync {
    /// Record an event
    ///
    /// Returns an error if the event could not be recorded; the engine logs
    /// it and moves on.
    fn record(&self, event: HistoryEvent) -> Result<(), HistoryError>;
}

/// Error when recording a history event fails
#[derive(Debug, Clone)]
pub struct HistoryError {
    pub message: String,
}

impl std::fmt::Display for HistoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "History error: {}", self.message)
    }
}

impl std::error::Error for HistoryError {}

impl HistoryError {
    pub fn unavailable() -> Self {
        Self {
            message: "History store unavailable".to_string(),
        }
    }
}

/// Events emitted while process instances run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HistoryEvent {
    /// A process instance started
    #[serde(rename_all = "camelCase")]
    ProcessStarted {
        process_instance_id: ExecutionId,
        definition_id: String,
        super_execution_id: Option<ExecutionId>,
    },

    /// A process instance completed or was deleted
    #[serde(rename_all = "camelCase")]
    ProcessEnded {
        process_instance_id: ExecutionId,
        definition_id: String,
        end_node_id: Option<String>,
        delete_reason: Option<String>,
    },

    /// A token entered a node
    #[serde(rename_all = "camelCase")]
    ActivityStarted {
        process_instance_id: ExecutionId,
        execution_id: ExecutionId,
        node_id: String,
        node_type: String,
    },

    /// A token left a node
    #[serde(rename_all = "camelCase")]
    ActivityEnded {
        process_instance_id: ExecutionId,
        execution_id: ExecutionId,
        node_id: String,
    },

    /// A scope execution was created for a node
    #[serde(rename_all = "camelCase")]
    ScopeStarted {
        process_instance_id: ExecutionId,
        execution_id: ExecutionId,
        parent_id: ExecutionId,
        node_id: String,
    },

    /// A scope execution completed normally
    #[serde(rename_all = "camelCase")]
    ScopeEnded {
        process_instance_id: ExecutionId,
        execution_id: ExecutionId,
        node_id: String,
    },

    /// A sequence flow was taken
    #[serde(rename_all = "camelCase")]
    SequenceFlowTaken {
        process_instance_id: ExecutionId,
        flow_id: String,
        source: String,
        target: String,
    },

    /// An execution was removed by cancellation
    #[serde(rename_all = "camelCase")]
    ExecutionDeleted {
        process_instance_id: ExecutionId,
        execution_id: ExecutionId,
        node_id: Option<String>,
        reason: String,
    },

    /// A call activity started a sub-process instance
    #[serde(rename_all = "camelCase")]
    SubProcessInstanceLinked {
        super_execution_id: ExecutionId,
        sub_process_instance_id: ExecutionId,
        called_definition_id: String,
    },

    /// A signal was thrown
    #[serde(rename_all = "camelCase")]
    SignalThrown {
        signal: String,
        deliveries: usize,
    },

    /// A compensation handler was started for a completed activity
    #[serde(rename_all = "camelCase")]
    CompensationStarted {
        process_instance_id: ExecutionId,
        activity_id: String,
        handler_id: String,
    },
}

impl HistoryEvent {
    /// Deletion reason if this is an `ExecutionDeleted` event
    pub fn delete_reason(&self) -> Option<&str> {
        match self {
            Self::ExecutionDeleted { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

/// A no-op sink that discards all events
pub struct NullHistorySink;

impl HistorySink for NullHistorySink {
    fn record(&self, _event: HistoryEvent) -> Result<(), HistoryError> {
        Ok(())
    }
}

/// A vector-based sink that collects events
///
/// Useful for testing to verify events were emitted correctly.
pub struct VecHistorySink {
    events: std::sync::Mutex<Vec<HistoryEvent>>,
}

impl VecHistorySink {
    pub fn new() -> Self {
        Self {
            events: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<HistoryEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Node ids of every `ActivityStarted` event, in order
    pub fn started_nodes(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                HistoryEvent::ActivityStarted { node_id, .. } => Some(node_id),
                _ => None,
            })
            .collect()
    }

    /// Clear all collected events
    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl Default for VecHistorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl HistorySink for VecHistorySink {
    fn record(&self, event: HistoryEvent) -> Result<(), HistoryError> {
        self.events
            .lock()
            .map_err(|_| HistoryError::unavailable())?
            .push(event);
        Ok(())
    }
}
