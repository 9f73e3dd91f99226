//! In-process job store.
//!
//! Every operation runs inside one `parking_lot::Mutex` critical section, so
//! select-and-lease in `claim_next` is atomic across tasks and threads.

use super::{
    offset, ChildrenState, ClaimedJob, Clock, JobPage, JobStore, Lease, QueueStats,
    StalledReport, SystemClock,
};
use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId, LockToken};
use crate::status::JobStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

struct Entry {
    job: Job,
    /// Insertion order; breaks ties between equal `created_at` values.
    seq: u64,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Entry>,
    next_seq: u64,
    paused: HashSet<String>,
}

impl Inner {
    fn push(&mut self, job: Job) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.jobs.insert(job.id.clone(), Entry { job, seq });
    }

    /// Entries matching `filter`, oldest first.
    fn sorted<F>(&self, filter: F) -> Vec<&Entry>
    where
        F: Fn(&Job) -> bool,
    {
        let mut entries: Vec<&Entry> = self.jobs.values().filter(|e| filter(&e.job)).collect();
        entries.sort_by_key(|e| (e.job.created_at, e.seq));
        entries
    }

    fn parent_is_pending(&self, job: &Job) -> bool {
        job.parent_id
            .as_ref()
            .and_then(|parent| self.jobs.get(parent))
            .is_some_and(|parent| !parent.job.status.is_terminal())
    }

    fn children(&self, parent: &JobId) -> ChildrenState {
        let mut state = ChildrenState::default();
        for entry in self.jobs.values() {
            if entry.job.parent_id.as_ref() == Some(parent) {
                state.record(entry.job.status);
            }
        }
        state
    }

    fn is_claimable(&self, job: &Job, queue: &str, now: DateTime<Utc>) -> bool {
        if job.queue_name != queue || job.lease_is_live(now) {
            return false;
        }
        match job.status {
            JobStatus::Waiting | JobStatus::Delayed => job.is_due(now),
            JobStatus::WaitingChildren => self.children(&job.id).releases_parent(),
            _ => false,
        }
    }

    fn verify_lease<'a>(
        &'a mut self,
        id: &JobId,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> JobResult<&'a mut Entry> {
        match self.jobs.get_mut(id) {
            Some(entry) if entry.job.holds_lease(&lease.worker_id, lease.token, now) => {
                Ok(entry)
            }
            _ => Err(JobError::LockLost(id.to_string())),
        }
    }
}

/// Job store kept in memory.
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobStore {
    /// Creates an empty store on the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store driven by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
        }
    }

    /// Number of stored jobs across all queues.
    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    /// Returns true if no jobs are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn now(&self) -> JobResult<DateTime<Utc>> {
        Ok(self.clock.now())
    }

    async fn insert(&self, job: &Job) -> JobResult<()> {
        self.insert_many(std::slice::from_ref(job)).await
    }

    async fn insert_many(&self, jobs: &[Job]) -> JobResult<()> {
        let mut inner = self.inner.lock();

        let mut batch: HashSet<&JobId> = HashSet::new();
        for job in jobs {
            if let Some(parent) = &job.parent_id {
                if !inner.jobs.contains_key(parent) && !batch.contains(parent) {
                    return Err(JobError::NotFound(parent.to_string()));
                }
            }
            if inner.jobs.contains_key(&job.id) || !batch.insert(&job.id) {
                return Err(JobError::DuplicateJob(job.id.to_string()));
            }
        }

        for job in jobs {
            inner.push(job.clone());
        }
        Ok(())
    }

    async fn get(&self, id: &JobId) -> JobResult<Option<Job>> {
        Ok(self.inner.lock().jobs.get(id).map(|entry| entry.job.clone()))
    }

    async fn jobs_by_status(
        &self,
        queue: &str,
        statuses: &[JobStatus],
        page: JobPage,
    ) -> JobResult<Vec<Job>> {
        let inner = self.inner.lock();
        let mut entries =
            inner.sorted(|job| job.queue_name == queue && statuses.contains(&job.status));
        if !page.ascending {
            entries.reverse();
        }
        Ok(entries
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .map(|entry| entry.job.clone())
            .collect())
    }

    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        lease_duration: Duration,
    ) -> JobResult<Option<ClaimedJob>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if inner.paused.contains(queue) {
            return Ok(None);
        }

        let Some(id) = inner
            .jobs
            .values()
            .filter(|entry| inner.is_claimable(&entry.job, queue, now))
            .min_by_key(|entry| {
                (Reverse(entry.job.priority), entry.job.created_at, entry.seq)
            })
            .map(|entry| entry.job.id.clone())
        else {
            return Ok(None);
        };

        let Some(entry) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };

        let resumed_from = entry.job.status;
        let token = LockToken::new();
        let expires_at = offset(now, lease_duration);
        entry.job.move_to_active(worker_id, token, expires_at, now)?;

        debug!(job_id = %id, queue = %queue, worker_id = %worker_id, "Claimed job");

        Ok(Some(ClaimedJob {
            job: entry.job.clone(),
            lease: Lease {
                worker_id: worker_id.to_string(),
                token,
                expires_at,
            },
            resumed_from,
        }))
    }

    async fn save(&self, job: &Job, lease: &Lease) -> JobResult<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let entry = inner.verify_lease(&job.id, lease, now)?;

        let kept_expiry = entry.job.lock_expires_at;
        entry.job = job.clone();
        if job.status == JobStatus::Active {
            entry.job.lock_expires_at = kept_expiry;
        }
        entry.job.updated_at = now;
        Ok(())
    }

    async fn extend_lease(
        &self,
        id: &JobId,
        lease: &Lease,
        lease_duration: Duration,
    ) -> JobResult<Lease> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let entry = inner.verify_lease(id, lease, now)?;

        let expires_at = offset(now, lease_duration);
        entry.job.lock_expires_at = Some(expires_at);
        Ok(Lease {
            expires_at,
            ..lease.clone()
        })
    }

    async fn children(&self, parent: &JobId) -> JobResult<ChildrenState> {
        Ok(self.inner.lock().children(parent))
    }

    async fn child_jobs(&self, parent: &JobId) -> JobResult<Vec<Job>> {
        let inner = self.inner.lock();
        Ok(inner
            .sorted(|job| job.parent_id.as_ref() == Some(parent))
            .into_iter()
            .map(|entry| entry.job.clone())
            .collect())
    }

    async fn cancel(&self, id: &JobId) -> JobResult<bool> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let entry = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;

        if entry.job.status != JobStatus::Waiting {
            return Ok(false);
        }
        entry.job.cancel(now)?;
        Ok(true)
    }

    async fn delete(&self, id: &JobId) -> JobResult<bool> {
        Ok(self.inner.lock().jobs.remove(id).is_some())
    }

    async fn promote_delayed(&self, queue: &str) -> JobResult<u64> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let mut promoted = 0;

        for entry in inner.jobs.values_mut() {
            let job = &mut entry.job;
            if job.queue_name == queue
                && job.status == JobStatus::Delayed
                && job.is_due(now)
                && !job.lease_is_live(now)
            {
                job.move_to_waiting(now)?;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn recover_stalled(&self, queue: &str) -> JobResult<StalledReport> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let mut report = StalledReport::default();

        for entry in inner.jobs.values_mut() {
            let job = &mut entry.job;
            if job.queue_name == queue
                && job.status == JobStatus::Active
                && !job.lease_is_live(now)
            {
                if job.mark_stalled(now)? {
                    report.failed.push(job.id.clone());
                } else {
                    report.recovered.push(job.id.clone());
                }
            }
        }
        Ok(report)
    }

    async fn stats(&self, queue: &str) -> JobResult<QueueStats> {
        let inner = self.inner.lock();
        let mut stats = QueueStats::default();
        for entry in inner.jobs.values().filter(|e| e.job.queue_name == queue) {
            stats.record(entry.job.status, 1);
        }
        Ok(stats)
    }

    async fn set_paused(&self, queue: &str, paused: bool) -> JobResult<()> {
        let mut inner = self.inner.lock();
        if paused {
            inner.paused.insert(queue.to_string());
        } else {
            inner.paused.remove(queue);
        }
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> JobResult<bool> {
        Ok(self.inner.lock().paused.contains(queue))
    }

    async fn clean(
        &self,
        queue: &str,
        grace: Duration,
        limit: usize,
        status: Option<JobStatus>,
    ) -> JobResult<Vec<JobId>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let mut expired: Vec<(DateTime<Utc>, u64, JobId)> = inner
            .jobs
            .values()
            .filter(|e| {
                e.job.queue_name == queue
                    && e.job.status.is_terminal()
                    && status.map_or(true, |s| e.job.status == s)
                    && !inner.parent_is_pending(&e.job)
            })
            .filter_map(|e| {
                e.job
                    .finished_on
                    .filter(|finished| offset(*finished, grace) < now)
                    .map(|finished| (finished, e.seq, e.job.id.clone()))
            })
            .collect();
        expired.sort();
        expired.truncate(limit);

        let mut removed = Vec::with_capacity(expired.len());
        for (_, _, id) in expired {
            if inner.jobs.remove(&id).is_some() {
                removed.push(id);
            }
        }
        Ok(removed)
    }
}
