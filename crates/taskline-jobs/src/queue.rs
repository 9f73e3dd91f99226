//! Per-queue client for producers and workers.

use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId, JobOptions};
use crate::metrics::JobMetrics;
use crate::retry::RetryPolicy;
use crate::status::JobStatus;
use crate::store::{offset, ClaimedJob, JobPage, JobStore, Lease, QueueStats, StalledReport};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use taskline_config::JobsConfig;
use tracing::{debug, info};

/// Defaults applied to jobs that do not override them.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDefaults {
    pub max_attempts: u32,
    pub backoff: RetryPolicy,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
    pub max_stalled: u32,
    /// Lease granted by [`QueueClient::get_next_job`].
    pub lease_duration: Duration,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        let options = JobOptions::default();
        Self {
            max_attempts: 1,
            backoff: options.backoff,
            remove_on_complete: options.remove_on_complete,
            remove_on_fail: options.remove_on_fail,
            max_stalled: options.max_stalled,
            lease_duration: Duration::from_secs(30),
        }
    }
}

impl From<&JobsConfig> for QueueDefaults {
    fn from(config: &JobsConfig) -> Self {
        Self {
            max_attempts: config.queue.default_max_attempts.max(1),
            backoff: RetryPolicy::from(&config.retry),
            remove_on_complete: config.queue.remove_on_complete,
            remove_on_fail: config.queue.remove_on_fail,
            max_stalled: config.queue.max_stalled,
            lease_duration: config.worker.lease_duration(),
        }
    }
}

/// Builder for enqueue options.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    job_id: Option<JobId>,
    priority: Option<i32>,
    delay: Option<Duration>,
    scheduled_at: Option<DateTime<Utc>>,
    max_attempts: Option<u32>,
    parent_id: Option<JobId>,
    backoff: Option<RetryPolicy>,
    remove_on_complete: Option<bool>,
    remove_on_fail: Option<bool>,
    max_stalled: Option<u32>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a caller-chosen id instead of a random one.
    pub fn job_id(mut self, id: impl Into<JobId>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    /// Set the priority (higher runs first).
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set a delay before execution.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self.scheduled_at = None;
        self
    }

    /// Schedule for a specific time.
    pub fn at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self.delay = None;
        self
    }

    /// Total attempts allowed; values below 1 are raised to 1.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Make this job a child of `parent`.
    pub fn parent(mut self, parent: JobId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    /// Override the backoff policy.
    pub fn with_backoff(mut self, policy: RetryPolicy) -> Self {
        self.backoff = Some(policy);
        self
    }

    pub fn remove_on_complete(mut self, remove: bool) -> Self {
        self.remove_on_complete = Some(remove);
        self
    }

    pub fn remove_on_fail(mut self, remove: bool) -> Self {
        self.remove_on_fail = Some(remove);
        self
    }

    pub fn max_stalled(mut self, count: u32) -> Self {
        self.max_stalled = Some(count);
        self
    }

    fn start_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.scheduled_at
            .or_else(|| self.delay.map(|delay| offset(now, delay)))
            .filter(|at| *at > now)
    }
}

/// One entry of a [`QueueClient::enqueue_bulk`] batch.
#[derive(Debug, Clone)]
pub struct BulkJob {
    pub name: String,
    pub payload: Value,
    pub options: EnqueueOptions,
}

impl BulkJob {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            options: EnqueueOptions::default(),
        }
    }

    pub fn with_options(mut self, options: EnqueueOptions) -> Self {
        self.options = options;
        self
    }
}

/// Client bound to a single queue.
#[derive(Clone)]
pub struct QueueClient {
    name: String,
    store: Arc<dyn JobStore>,
    defaults: QueueDefaults,
}

impl QueueClient {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn JobStore>,
        defaults: QueueDefaults,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            defaults,
        }
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn defaults(&self) -> &QueueDefaults {
        &self.defaults
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Adds a job to the queue.
    ///
    /// The job starts `Waiting`, or `Delayed` when a future start time is
    /// given. The payload must be a JSON object.
    pub async fn enqueue(
        &self,
        job_name: &str,
        payload: Value,
        options: EnqueueOptions,
    ) -> JobResult<Job> {
        if let Some(parent) = &options.parent_id {
            if self.store.get(parent).await?.is_none() {
                return Err(JobError::NotFound(parent.to_string()));
            }
        }

        let now = self.store.now().await?;
        let job = self.build_job(job_name, payload, &options, now)?;
        self.store.insert(&job).await?;
        self.record_enqueued(&job);

        Ok(job)
    }

    /// Adds several jobs in one all-or-nothing write.
    ///
    /// A job may name a parent that appears earlier in the same batch. If
    /// any job is rejected, none are stored.
    pub async fn enqueue_bulk(&self, jobs: Vec<BulkJob>) -> JobResult<Vec<Job>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let now = self.store.now().await?;
        let built = jobs
            .into_iter()
            .map(|bulk| self.build_job(&bulk.name, bulk.payload, &bulk.options, now))
            .collect::<JobResult<Vec<_>>>()?;

        self.store.insert_many(&built).await?;
        for job in &built {
            self.record_enqueued(job);
        }
        info!(queue = %self.name, count = built.len(), "Bulk enqueued jobs");

        Ok(built)
    }

    fn build_job(
        &self,
        job_name: &str,
        payload: Value,
        options: &EnqueueOptions,
        now: DateTime<Utc>,
    ) -> JobResult<Job> {
        if job_name.is_empty() {
            return Err(JobError::Configuration("job name must not be empty".to_string()));
        }

        let id = options.job_id.clone().unwrap_or_default();
        let mut job = Job::new(id, &self.name, job_name, payload, now)?;
        let defaults = &self.defaults;

        job.priority = options.priority.unwrap_or(0);
        job.max_attempts = options.max_attempts.unwrap_or(defaults.max_attempts).max(1);
        job.parent_id = options.parent_id.clone();
        job.options = JobOptions {
            backoff: options.backoff.clone().unwrap_or_else(|| defaults.backoff.clone()),
            remove_on_complete: options
                .remove_on_complete
                .unwrap_or(defaults.remove_on_complete),
            remove_on_fail: options.remove_on_fail.unwrap_or(defaults.remove_on_fail),
            max_stalled: options.max_stalled.unwrap_or(defaults.max_stalled),
        };

        match options.start_at(now) {
            Some(at) => job.move_to_delayed(at, now)?,
            None => job.move_to_waiting(now)?,
        }
        Ok(job)
    }

    fn record_enqueued(&self, job: &Job) {
        JobMetrics::job_enqueued(&self.name, &job.job_name);
        debug!(
            job_id = %job.id,
            queue = %self.name,
            job_name = %job.job_name,
            status = %job.status,
            priority = job.priority,
            "Job enqueued"
        );
    }

    /// Claims the next eligible job for `worker_id`.
    pub async fn get_next_job(&self, worker_id: &str) -> JobResult<Option<ClaimedJob>> {
        let claimed = self
            .store
            .claim_next(&self.name, worker_id, self.defaults.lease_duration)
            .await?;
        if let Some(claimed) = &claimed {
            JobMetrics::job_claimed(&self.name, &claimed.job.job_name);
        }
        Ok(claimed)
    }

    /// Persists a job's state, provided `lease` is still live.
    pub async fn save_job_state(&self, job: &Job, lease: &Lease) -> JobResult<()> {
        self.store.save(job, lease).await
    }

    /// Renews `lease` for another lease period.
    pub async fn extend_lock(&self, id: &JobId, lease: &Lease) -> JobResult<Lease> {
        self.store
            .extend_lease(id, lease, self.defaults.lease_duration)
            .await
    }

    pub async fn get_job(&self, id: &JobId) -> JobResult<Option<Job>> {
        Ok(self
            .store
            .get(id)
            .await?
            .filter(|job| job.queue_name == self.name))
    }

    /// Cancels a waiting job. Returns false if it already left `Waiting`.
    pub async fn cancel(&self, id: &JobId) -> JobResult<bool> {
        if self.get_job(id).await?.is_none() {
            return Err(JobError::NotFound(id.to_string()));
        }
        let cancelled = self.store.cancel(id).await?;
        if cancelled {
            JobMetrics::job_cancelled(&self.name);
            info!(job_id = %id, queue = %self.name, "Job cancelled");
        }
        Ok(cancelled)
    }

    /// Deletes a job from the queue.
    pub async fn remove(&self, id: &JobId) -> JobResult<bool> {
        if self.get_job(id).await?.is_none() {
            return Ok(false);
        }
        self.store.delete(id).await
    }

    pub async fn promote_delayed(&self) -> JobResult<u64> {
        self.store.promote_delayed(&self.name).await
    }

    pub async fn recover_stalled(&self) -> JobResult<StalledReport> {
        self.store.recover_stalled(&self.name).await
    }

    pub async fn stats(&self) -> JobResult<QueueStats> {
        let stats = self.store.stats(&self.name).await?;
        JobMetrics::update_queue_sizes(&self.name, &stats);
        Ok(stats)
    }

    /// Lists jobs in any of `statuses`, newest first unless `page.ascending`.
    ///
    /// An empty `statuses` slice matches every status.
    pub async fn get_jobs_by_status(
        &self,
        statuses: &[JobStatus],
        page: JobPage,
    ) -> JobResult<Vec<Job>> {
        let statuses = if statuses.is_empty() {
            &JobStatus::ALL[..]
        } else {
            statuses
        };
        self.store.jobs_by_status(&self.name, statuses, page).await
    }

    /// Stops workers from claiming jobs on this queue. Enqueue still works.
    pub async fn pause(&self) -> JobResult<()> {
        self.store.set_paused(&self.name, true).await?;
        info!(queue = %self.name, "Queue paused");
        Ok(())
    }

    pub async fn resume(&self) -> JobResult<()> {
        self.store.set_paused(&self.name, false).await?;
        info!(queue = %self.name, "Queue resumed");
        Ok(())
    }

    pub async fn is_paused(&self) -> JobResult<bool> {
        self.store.is_paused(&self.name).await
    }

    /// Deletes terminal jobs that finished more than `grace` ago.
    ///
    /// Removes at most `limit` jobs, oldest first; `0` means no limit.
    /// `status` narrows the sweep to one terminal status. Children of a
    /// parent that has not reached a terminal status are kept.
    pub async fn clean(
        &self,
        grace: Duration,
        limit: usize,
        status: Option<JobStatus>,
    ) -> JobResult<Vec<JobId>> {
        if let Some(status) = status.filter(|s| !s.is_terminal()) {
            return Err(JobError::Configuration(format!(
                "cannot clean jobs in non-terminal status {status}"
            )));
        }

        let limit = if limit == 0 { usize::MAX } else { limit };
        let removed = self.store.clean(&self.name, grace, limit, status).await?;
        if !removed.is_empty() {
            JobMetrics::jobs_cleaned(&self.name, removed.len() as u64);
            info!(queue = %self.name, count = removed.len(), "Cleaned terminal jobs");
        }
        Ok(removed)
    }
}
