//! Job lifecycle notifications.
//!
//! Events are fire-and-forget: emitting never blocks and never fails, and a
//! subscriber that falls behind misses events rather than slowing workers.

use crate::job::JobId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// Something that happened to a job or a worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// A worker claimed the job.
    Active { job_id: JobId, queue: String, worker_id: String },
    /// A handler reported progress.
    Progress { job_id: JobId, queue: String, progress: Value },
    /// The job continued to another step.
    Continued {
        job_id: JobId,
        queue: String,
        step: String,
        scheduled_for: DateTime<Utc>,
    },
    /// The job is waiting on its children.
    WaitingChildren { job_id: JobId, queue: String },
    /// The job failed and was scheduled for another attempt.
    Retrying {
        job_id: JobId,
        queue: String,
        attempts_made: u32,
        scheduled_for: DateTime<Utc>,
    },
    /// The job finished.
    Completed { job_id: JobId, queue: String, result: Option<Value> },
    /// The job failed terminally.
    Failed { job_id: JobId, queue: String, reason: String },
    /// The job was deleted after finishing or failing.
    Removed { job_id: JobId, queue: String },
    /// A worker lost the lease before saving.
    LockLost { job_id: JobId, queue: String, worker_id: String },
    /// A worker hit an error outside of any job.
    WorkerError { worker_id: String, message: String },
}

impl JobEvent {
    /// The job the event is about, if any.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            JobEvent::Active { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Continued { job_id, .. }
            | JobEvent::WaitingChildren { job_id, .. }
            | JobEvent::Retrying { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Removed { job_id, .. }
            | JobEvent::LockLost { job_id, .. } => Some(job_id),
            JobEvent::WorkerError { .. } => None,
        }
    }
}

/// Broadcast channel for [`JobEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    /// Default number of buffered events per subscriber.
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn emit(&self, event: JobEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
