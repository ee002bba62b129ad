//! Execution store collaborator
//!
//! The engine keeps the authoritative arena in memory and flushes each
//! committed command's changes to an `ExecutionStore`. Revisions are
//! checked before anything is written, so a stale command writes nothing.

use std::collections::HashMap;

use super::execution::{Execution, ExecutionId};
use super::subscription::{EventSubscription, SubscriptionId};
use super::timer::{JobId, TimerJob};
use super::tree::{ChangeSet, ExecutionTree};
use crate::error::{ProcessEngineError, Result};

/// Durable storage for executions, subscriptions and jobs
pub trait ExecutionStore: Send + Sync {
    /// Store a new execution; its stored revision starts at 1
    fn insert(&mut self, execution: &Execution) -> Result<u64>;

    /// Replace a stored execution whose revision matches `execution.revision`
    ///
    /// Returns the new revision, or `OptimisticLock` when the stored row
    /// moved on.
    fn update(&mut self, execution: &Execution) -> Result<u64>;

    fn delete(&mut self, id: ExecutionId) -> Result<()>;

    fn find_by_id(&self, id: ExecutionId) -> Option<Execution>;

    fn find_children(&self, parent: ExecutionId) -> Vec<Execution>;

    /// Insert or replace a subscription
    fn insert_subscription(&mut self, subscription: &EventSubscription) -> Result<()>;

    fn delete_subscription(&mut self, id: SubscriptionId) -> Result<()>;

    fn insert_job(&mut self, job: &TimerJob) -> Result<()>;

    fn delete_job(&mut self, id: &JobId) -> Result<()>;

    fn find_jobs_by_execution_id(&self, id: ExecutionId) -> Vec<TimerJob>;
}

/// Store backed by hash maps
#[derive(Debug, Default)]
pub struct InMemoryStore {
    executions: HashMap<ExecutionId, Execution>,
    subscriptions: HashMap<SubscriptionId, EventSubscription>,
    jobs: HashMap<JobId, TimerJob>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execution_count(&self) -> usize {
        self.executions.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

impl ExecutionStore for InMemoryStore {
    fn insert(&mut self, execution: &Execution) -> Result<u64> {
        let mut row = execution.clone();
        row.revision = 1;
        self.executions.insert(row.id, row);
        Ok(1)
    }

    fn update(&mut self, execution: &Execution) -> Result<u64> {
        let stored = self
            .executions
            .get(&execution.id)
            .map(|e| e.revision)
            .ok_or(ProcessEngineError::ExecutionNotFound(execution.id))?;
        if stored != execution.revision {
            return Err(ProcessEngineError::OptimisticLock {
                execution_id: execution.id,
                expected: execution.revision,
            });
        }
        let mut row = execution.clone();
        row.revision = stored + 1;
        self.executions.insert(row.id, row);
        Ok(stored + 1)
    }

    fn delete(&mut self, id: ExecutionId) -> Result<()> {
        self.executions.remove(&id);
        Ok(())
    }

    fn find_by_id(&self, id: ExecutionId) -> Option<Execution> {
        self.executions.get(&id).cloned()
    }

    fn find_children(&self, parent: ExecutionId) -> Vec<Execution> {
        let mut children: Vec<Execution> = self
            .executions
            .values()
            .filter(|e| e.parent == Some(parent))
            .cloned()
            .collect();
        children.sort_by_key(|e| e.id);
        children
    }

    fn insert_subscription(&mut self, subscription: &EventSubscription) -> Result<()> {
        self.subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    fn delete_subscription(&mut self, id: SubscriptionId) -> Result<()> {
        self.subscriptions.remove(&id);
        Ok(())
    }

    fn insert_job(&mut self, job: &TimerJob) -> Result<()> {
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn delete_job(&mut self, id: &JobId) -> Result<()> {
        self.jobs.remove(id);
        Ok(())
    }

    fn find_jobs_by_execution_id(&self, id: ExecutionId) -> Vec<TimerJob> {
        self.jobs
            .values()
            .filter(|j| j.execution_id == id)
            .cloned()
            .collect()
    }
}

/// Write one command's changes to the store
///
/// Every updated execution's revision is verified first; on success the
/// arena records the revisions the store assigned.
pub fn flush(store: &mut dyn ExecutionStore, tree: &mut ExecutionTree, changes: &ChangeSet) -> Result<()> {
    for id in &changes.updated {
        let Some(execution) = tree.find(*id) else {
            continue;
        };
        if let Some(stored) = store.find_by_id(*id) {
            if stored.revision != execution.revision {
                return Err(ProcessEngineError::OptimisticLock {
                    execution_id: *id,
                    expected: execution.revision,
                });
            }
        }
    }

    for id in &changes.deleted {
        store.delete(*id)?;
    }
    for id in &changes.inserted {
        if let Some(execution) = tree.find(*id).cloned() {
            let revision = store.insert(&execution)?;
            tree.set_revision(*id, revision);
        }
    }
    for id in &changes.updated {
        let Some(execution) = tree.find(*id).cloned() else {
            continue;
        };
        let revision = if store.find_by_id(*id).is_some() {
            store.update(&execution)?
        } else {
            store.insert(&execution)?
        };
        tree.set_revision(*id, revision);
    }

    for id in &changes.subscriptions_deleted {
        store.delete_subscription(*id)?;
    }
    for id in &changes.subscriptions_inserted {
        if let Some(subscription) = tree.subscription(*id) {
            store.insert_subscription(subscription)?;
        }
    }
    for id in &changes.jobs_deleted {
        store.delete_job(id)?;
    }
    for id in &changes.jobs_inserted {
        if let Some(job) = tree.job(id) {
            store.insert_job(job)?;
        }
    }

    log::debug!(
        "Flushed {} inserted, {} updated ({} forced), {} deleted executions",
        changes.inserted.len(),
        changes.updated.len(),
        changes.forced.len(),
        changes.deleted.len()
    );
    Ok(())
}
