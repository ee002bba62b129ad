//! Timer jobs and the external timer service
//!
//! The engine never waits on a clock. Entering a timer catch creates a job
//! and asks the `TimerService` to schedule it; when the job is due the host
//! calls `ProcessEngine::fire_job`.

use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::execution::ExecutionId;
use crate::model::TimerDefinition;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn generate() -> Self {
        Self(format!("job-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A pending timer owned by an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerJob {
    pub id: JobId,
    pub execution_id: ExecutionId,
    pub process_instance_id: ExecutionId,
    pub node_id: String,
    pub timer: TimerDefinition,
}

/// Schedules and cancels timer jobs outside the engine
pub trait TimerService: Send + Sync {
    fn schedule(&self, job: &TimerJob);
    fn cancel(&self, job_id: &JobId);
}

/// Timer service that drops every request
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTimerService;

impl TimerService for NoopTimerService {
    fn schedule(&self, _job: &TimerJob) {}
    fn cancel(&self, _job_id: &JobId) {}
}

/// What a `RecordingTimerService` was asked to do
#[derive(Debug, Clone, PartialEq)]
pub enum TimerRequest {
    Schedule(TimerJob),
    Cancel(JobId),
}

/// Timer service that remembers requests (useful for testing)
#[derive(Debug, Default)]
pub struct RecordingTimerService {
    requests: Mutex<Vec<TimerRequest>>,
}

impl RecordingTimerService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<TimerRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Jobs scheduled and not cancelled since
    pub fn scheduled(&self) -> Vec<TimerJob> {
        let mut pending: Vec<TimerJob> = Vec::new();
        for request in self.requests() {
            match request {
                TimerRequest::Schedule(job) => pending.push(job),
                TimerRequest::Cancel(id) => pending.retain(|j| j.id != id),
            }
        }
        pending
    }

    fn push(&self, request: TimerRequest) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
    }
}

impl TimerService for RecordingTimerService {
    fn schedule(&self, job: &TimerJob) {
        self.push(TimerRequest::Schedule(job.clone()));
    }

    fn cancel(&self, job_id: &JobId) {
        self.push(TimerRequest::Cancel(job_id.clone()));
    }
}
