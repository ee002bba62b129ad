//! Runtime state: the execution arena and everything a command works with

pub mod agenda;
pub mod checkpoint;
pub mod context;
pub mod execution;
pub mod persistence;
pub mod subscription;
pub mod timer;
pub mod tree;

pub use agenda::{Agenda, Operation};
pub use checkpoint::Checkpoint;
pub use context::{CommandContext, CommandOutput, ExecutionVariables};
pub use execution::{Execution, ExecutionId, LoopRole};
pub use persistence::{ExecutionStore, InMemoryStore};
pub use subscription::{EventSubscription, SubscriptionId, SubscriptionKind};
pub use timer::{
    JobId, NoopTimerService, RecordingTimerService, TimerJob, TimerRequest, TimerService,
};
pub use tree::{ChangeSet, ExecutionTree, Removed};
