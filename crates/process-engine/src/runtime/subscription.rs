//! Event subscriptions held by waiting executions

use std::fmt;

use serde::{Deserialize, Serialize};

use super::execution::ExecutionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubscriptionKind {
    Signal,
    Message,
    Timer,
    Compensate,
}

/// A waiting execution's interest in an event
///
/// `execution_id` is a lookup reference; the subscription is deleted with
/// its execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSubscription {
    pub id: SubscriptionId,
    pub kind: SubscriptionKind,
    /// Signal or message name; the activity id for compensation
    pub event_name: String,
    pub execution_id: ExecutionId,
    pub process_instance_id: ExecutionId,
    /// Catching node, or the compensated activity
    pub node_id: String,
    /// Job id for timers, handler activity for compensation
    pub configuration: Option<String>,
}

impl EventSubscription {
    pub fn is_compensation(&self) -> bool {
        self.kind == SubscriptionKind::Compensate
    }
}
