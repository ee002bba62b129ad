//! Process Engine - Token-tree execution runtime for BPMN-style process graphs
//!
//! This crate runs process instances of deployed definitions. It supports:
//!
//! - Sequence flows with conditions, default flows and skip expressions
//! - Exclusive, parallel, inclusive and event-based gateways
//! - Sequential and parallel multi-instance activities
//! - Signal, message, timer, error, compensation, cancel and terminate events
//! - Embedded sub-processes, transactions and call activities
//! - Per-command rollback from compressed checkpoints
//!
//! # Architecture
//!
//! A process instance is a tree of executions stored in an arena:
//!
//! - `ExecutionTree`: executions, event subscriptions and timer jobs by id
//! - `Agenda`: FIFO queue of operations a command still has to run
//! - `Behavior`: what entering, leaving and triggering a node does
//! - `ProcessEngine`: opens a command, drains the agenda, commits or rolls back
//!
//! Behaviors never call each other; they plan operations. Outward effects
//! (timer requests, history events, store writes) are buffered and released
//! only when the command commits.
//!
//! # Example
//!
//! ```ignore
//! use process_engine::{ProcessBuilder, ProcessEngine, Variables};
//!
//! let mut engine = ProcessEngine::new();
//! engine.deploy(
//!     ProcessBuilder::new("approval", "Approval")
//!         .start_event("start")
//!         .user_task("review")
//!         .end_event("end")
//!         .flow("start", "review")
//!         .flow("review", "end")
//!         .build(),
//! )?;
//! let pi = engine.start_process_instance_by_key("approval", Variables::new()).await?;
//! engine.trigger(pi, Variables::new()).await?;
//! assert!(engine.is_ended(pi));
//! ```

pub mod behavior;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod expression;
pub mod handler;
pub mod model;
pub mod runtime;

#[cfg(test)]
mod scenarios;

// Re-export key types
pub use behavior::Behavior;
pub use config::EngineConfig;
pub use engine::{ProcessEngine, SharedProcessEngine, Variables};
pub use error::{ProcessEngineError, Result};
pub use events::{HistoryEvent, HistorySink, NullHistorySink, VecHistorySink};
pub use expression::{ExpressionEvaluator, SimpleExpressionEvaluator, VariableScope};
pub use handler::{CallbackTaskHandler, HandlerRegistry, TaskContext, TaskError, TaskHandler};
pub use model::{ProcessBuilder, ProcessDefinition, ProcessRepository};
pub use runtime::{
    Execution, ExecutionId, ExecutionStore, InMemoryStore, JobId, RecordingTimerService,
    TimerService,
};
