//! Durable job storage.
//!
//! The only operation that needs cross-worker atomicity is
//! [`JobStore::claim_next`]; every other write by a worker is a conditional
//! update guarded by the lease it obtained there.

mod clock;
mod memory;

pub use clock::{offset, Clock, ManualClock, SystemClock};
pub use memory::InMemoryJobStore;

use crate::error::JobResult;
use crate::job::{Job, JobId, LockToken};
use crate::status::JobStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Proof of a claim, required for every write a worker makes to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub worker_id: String,
    pub token: LockToken,
    pub expires_at: DateTime<Utc>,
}

/// A job handed to a worker by [`JobStore::claim_next`].
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    /// The job, already `Active` and leased.
    pub job: Job,
    /// The lease to present when saving.
    pub lease: Lease,
    /// Status the job had before the claim.
    pub resumed_from: JobStatus,
}

/// Aggregate state of a parent's children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildrenState {
    /// Number of children.
    pub total: u64,
    /// Children not yet in a terminal status.
    pub outstanding: u64,
    /// Children that ended `Failed` or `Cancelled`.
    pub failed: u64,
}

impl ChildrenState {
    /// Returns true when every child is terminal (vacuously true without children).
    pub fn all_done(&self) -> bool {
        self.outstanding == 0
    }

    /// Returns true if the parent may be claimed again.
    pub fn releases_parent(&self) -> bool {
        self.outstanding == 0 || self.failed > 0
    }

    /// Adds one child with the given status.
    pub fn record(&mut self, status: JobStatus) {
        self.total += 1;
        if !status.is_terminal() {
            self.outstanding += 1;
        }
        if status.is_failure() {
            self.failed += 1;
        }
    }
}

/// Job counts per status for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub waiting_children: u64,
    pub finished: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl QueueStats {
    /// Adds `count` jobs with `status`.
    pub fn record(&mut self, status: JobStatus, count: u64) {
        let slot = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Waiting => &mut self.waiting,
            JobStatus::Active => &mut self.active,
            JobStatus::Delayed => &mut self.delayed,
            JobStatus::WaitingChildren => &mut self.waiting_children,
            JobStatus::Finished => &mut self.finished,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
        };
        *slot += count;
    }

    /// Total number of jobs.
    pub fn total(&self) -> u64 {
        self.pending
            + self.waiting
            + self.active
            + self.delayed
            + self.waiting_children
            + self.finished
            + self.failed
            + self.cancelled
    }
}

/// Outcome of a stalled-job sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StalledReport {
    /// Jobs put back for another run.
    pub recovered: Vec<JobId>,
    /// Jobs failed for stalling too often.
    pub failed: Vec<JobId>,
}

impl StalledReport {
    /// Returns true if the sweep touched nothing.
    pub fn is_empty(&self) -> bool {
        self.recovered.is_empty() && self.failed.is_empty()
    }
}

/// Page of a job listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobPage {
    /// Jobs skipped from the start of the ordering.
    pub offset: usize,
    /// Maximum number of jobs returned.
    pub limit: usize,
    /// Oldest first when true, newest first otherwise.
    pub ascending: bool,
}

impl Default for JobPage {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
            ascending: false,
        }
    }
}

/// Storage backend for jobs.
///
/// All time comparisons use the store's own clock, exposed by [`now`](Self::now).
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Current time according to the store.
    async fn now(&self) -> JobResult<DateTime<Utc>>;

    /// Inserts a new job. Fails with `DuplicateJob` if the id exists.
    async fn insert(&self, job: &Job) -> JobResult<()>;

    /// Inserts every job or none of them.
    ///
    /// A job whose `parent_id` names an earlier job of the same batch is
    /// accepted.
    async fn insert_many(&self, jobs: &[Job]) -> JobResult<()>;

    /// Fetches a job by id.
    async fn get(&self, id: &JobId) -> JobResult<Option<Job>>;

    /// Jobs of `queue` in any of `statuses`, ordered by creation time.
    async fn jobs_by_status(
        &self,
        queue: &str,
        statuses: &[JobStatus],
        page: JobPage,
    ) -> JobResult<Vec<Job>>;

    /// Atomically selects the best eligible job in `queue` and leases it.
    ///
    /// Eligible: no live lease, and either `Waiting`/`Delayed` with a due
    /// start time, or `WaitingChildren` whose children released it. Order is
    /// priority descending, then creation order. A paused queue yields nothing.
    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        lease_duration: Duration,
    ) -> JobResult<Option<ClaimedJob>>;

    /// Writes `job` back if `lease` is still the live lease on it.
    ///
    /// Fails with `LockLost` otherwise. While the job stays `Active`, the
    /// stored lease expiry is kept as is.
    async fn save(&self, job: &Job, lease: &Lease) -> JobResult<()>;

    /// Pushes the lease expiry to `now + lease_duration`.
    async fn extend_lease(
        &self,
        id: &JobId,
        lease: &Lease,
        lease_duration: Duration,
    ) -> JobResult<Lease>;

    /// Aggregates the status of jobs whose `parent_id` is `parent`.
    async fn children(&self, parent: &JobId) -> JobResult<ChildrenState>;

    /// Jobs whose `parent_id` is `parent`, in creation order.
    async fn child_jobs(&self, parent: &JobId) -> JobResult<Vec<Job>>;

    /// Cancels a `Waiting` job. Returns false if it was in another status.
    async fn cancel(&self, id: &JobId) -> JobResult<bool>;

    /// Deletes a job. Returns false if it did not exist.
    async fn delete(&self, id: &JobId) -> JobResult<bool>;

    /// Moves due `Delayed` jobs to `Waiting`. Returns the number moved.
    async fn promote_delayed(&self, queue: &str) -> JobResult<u64>;

    /// Recovers `Active` jobs whose lease expired.
    async fn recover_stalled(&self, queue: &str) -> JobResult<StalledReport>;

    /// Job counts per status.
    async fn stats(&self, queue: &str) -> JobResult<QueueStats>;

    /// Stops or restarts claims from `queue`.
    async fn set_paused(&self, queue: &str, paused: bool) -> JobResult<()>;

    async fn is_paused(&self, queue: &str) -> JobResult<bool>;

    /// Deletes up to `limit` terminal jobs of `queue` that finished more than
    /// `grace` ago, oldest first, restricted to `status` when given.
    ///
    /// Children of a parent that is not yet terminal are kept. Returns the
    /// deleted ids.
    async fn clean(
        &self,
        queue: &str,
        grace: Duration,
        limit: usize,
        status: Option<JobStatus>,
    ) -> JobResult<Vec<JobId>>;
}
