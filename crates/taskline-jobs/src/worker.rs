//! Worker loop for processing jobs.

use crate::error::{JobError, JobResult};
use crate::events::{EventBus, JobEvent};
use crate::job::{Job, JobId};
use crate::metrics::{JobMetrics, WorkerMetrics};
use crate::queue::{QueueClient, QueueDefaults};
use crate::status::JobStatus;
use crate::step::{StepEnv, StepProcessor, StepRun};
use crate::store::{offset, ClaimedJob, JobStore, Lease};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskline_config::{JobsConfig, WorkerConfig};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerLoopConfig {
    /// Fixed worker id; a random one is generated when `None`.
    pub worker_id: Option<String>,

    /// Number of concurrent slots.
    pub concurrency: usize,

    /// Idle time between polls when no job is eligible.
    pub poll_interval: Duration,

    /// Pause after a store error.
    pub error_backoff: Duration,

    /// Lease granted per claim.
    pub lease_duration: Duration,

    /// How often a running job's lease is extended.
    pub lease_renew_interval: Duration,

    /// How often delayed jobs are promoted and stalled jobs recovered.
    pub maintenance_interval: Duration,

    /// How long `run` waits for slots to drain after `stop`.
    pub shutdown_timeout: Duration,
}

/// Floor for every polling and renewal interval.
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

impl Default for WorkerLoopConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl WorkerLoopConfig {
    /// Raises intervals below [`MIN_INTERVAL`] and keeps lease renewal
    /// inside the lease. A zero renewal interval means half the lease.
    pub fn normalized(mut self) -> Self {
        self.concurrency = self.concurrency.max(1);
        self.poll_interval = self.poll_interval.max(MIN_INTERVAL);
        self.error_backoff = self.error_backoff.max(MIN_INTERVAL);
        self.maintenance_interval = self.maintenance_interval.max(MIN_INTERVAL);
        self.lease_duration = self.lease_duration.max(MIN_INTERVAL * 2);
        if self.lease_renew_interval.is_zero() || self.lease_renew_interval >= self.lease_duration {
            self.lease_renew_interval = self.lease_duration / 2;
        }
        self.lease_renew_interval = self.lease_renew_interval.max(MIN_INTERVAL);
        self
    }
}

impl From<&WorkerConfig> for WorkerLoopConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            concurrency: config.concurrency.max(1),
            poll_interval: config.poll_interval(),
            error_backoff: config.error_backoff(),
            lease_duration: config.lease_duration(),
            lease_renew_interval: config.lease_renew_interval(),
            maintenance_interval: config.maintenance_interval(),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }
}

/// What happened to the job handled by one [`WorkerLoop::process_next`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Completed {
        job_id: JobId,
    },
    Continued {
        job_id: JobId,
        step: String,
        scheduled_for: DateTime<Utc>,
    },
    WaitingChildren {
        job_id: JobId,
    },
    /// The attempt failed and another one is scheduled.
    Retrying {
        job_id: JobId,
        attempts_made: u32,
        delay: Duration,
    },
    /// The job failed terminally.
    Failed {
        job_id: JobId,
        reason: String,
    },
    /// The lease was gone at save time; nothing was written.
    LockLost {
        job_id: JobId,
    },
}

impl ProcessOutcome {
    pub fn job_id(&self) -> &JobId {
        match self {
            ProcessOutcome::Completed { job_id }
            | ProcessOutcome::Continued { job_id, .. }
            | ProcessOutcome::WaitingChildren { job_id }
            | ProcessOutcome::Retrying { job_id, .. }
            | ProcessOutcome::Failed { job_id, .. }
            | ProcessOutcome::LockLost { job_id } => job_id,
        }
    }
}

/// Lease renewal for one running job. Stops when dropped, including when
/// the owning slot is aborted.
struct RenewalTask(JoinHandle<()>);

impl Drop for RenewalTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Registered {
    client: QueueClient,
    processor: Arc<StepProcessor>,
}

/// Claims and runs jobs from every registered queue.
#[derive(Clone)]
pub struct WorkerLoop {
    /// Unique worker ID.
    id: String,

    store: Arc<dyn JobStore>,

    events: EventBus,

    config: Arc<WorkerLoopConfig>,

    /// Defaults for the per-queue clients.
    defaults: QueueDefaults,

    /// Processors keyed by queue name.
    processors: Arc<RwLock<BTreeMap<String, Registered>>>,

    /// Shutdown flag. Stays set until `run` has drained.
    shutdown_tx: watch::Sender<bool>,

    running: Arc<AtomicBool>,

    jobs_completed: Arc<AtomicU64>,

    jobs_failed: Arc<AtomicU64>,

    jobs_retried: Arc<AtomicU64>,

    locks_lost: Arc<AtomicU64>,
}

impl WorkerLoop {
    /// Create a new worker loop.
    ///
    /// The configuration is [normalized](WorkerLoopConfig::normalized) first.
    pub fn new(store: Arc<dyn JobStore>, events: EventBus, config: WorkerLoopConfig) -> Self {
        let config = config.normalized();
        let (shutdown_tx, _) = watch::channel(false);
        let id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()));
        let defaults = QueueDefaults {
            lease_duration: config.lease_duration,
            ..QueueDefaults::default()
        };

        Self {
            id,
            store,
            events,
            config: Arc::new(config),
            defaults,
            processors: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
            running: Arc::new(AtomicBool::new(false)),
            jobs_completed: Arc::new(AtomicU64::new(0)),
            jobs_failed: Arc::new(AtomicU64::new(0)),
            jobs_retried: Arc::new(AtomicU64::new(0)),
            locks_lost: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a worker loop from the `[jobs]` configuration section.
    pub fn from_config(store: Arc<dyn JobStore>, events: EventBus, config: &JobsConfig) -> Self {
        let mut worker = Self::new(store, events, WorkerLoopConfig::from(&config.worker));
        worker.defaults = QueueDefaults::from(config);
        worker
    }

    /// Register the processor for `queue`.
    ///
    /// Each queue has exactly one processor; registering a second one is a
    /// configuration error.
    pub fn register_processor(
        &self,
        queue: impl Into<String>,
        processor: StepProcessor,
    ) -> JobResult<()> {
        let queue = queue.into();
        if queue.is_empty() {
            return Err(JobError::Configuration("queue name must not be empty".to_string()));
        }

        let mut processors = self.processors.write();
        if processors.contains_key(&queue) {
            return Err(JobError::Configuration(format!(
                "a processor is already registered for queue '{queue}'"
            )));
        }

        info!(
            worker_id = %self.id,
            queue = %queue,
            default_step = %processor.default_step(),
            "Registered step processor"
        );
        let client = QueueClient::new(queue.clone(), self.store.clone(), self.defaults.clone());
        processors.insert(
            queue,
            Registered {
                client,
                processor: Arc::new(processor),
            },
        );
        Ok(())
    }

    /// Names of the registered queues.
    pub fn queues(&self) -> Vec<String> {
        self.processors.read().keys().cloned().collect()
    }

    /// Client for a registered queue.
    pub fn client(&self, queue: &str) -> Option<QueueClient> {
        self.processors.read().get(queue).map(|r| r.client.clone())
    }

    fn registered(&self, queue: &str) -> JobResult<(QueueClient, Arc<StepProcessor>)> {
        self.processors
            .read()
            .get(queue)
            .map(|r| (r.client.clone(), r.processor.clone()))
            .ok_or_else(|| {
                JobError::Configuration(format!("no processor registered for queue '{queue}'"))
            })
    }

    /// Claims and runs at most one job from `queue`.
    ///
    /// Returns `Ok(None)` when nothing is eligible. Missing step handlers are
    /// recorded on the job as a terminal failure and then returned as `Err`.
    pub async fn process_next(&self, queue: &str) -> JobResult<Option<ProcessOutcome>> {
        let (client, processor) = self.registered(queue)?;
        self.process_one(&client, &processor, &self.id).await
    }

    async fn process_one(
        &self,
        client: &QueueClient,
        processor: &StepProcessor,
        worker_id: &str,
    ) -> JobResult<Option<ProcessOutcome>> {
        let Some(ClaimedJob {
            mut job,
            lease,
            resumed_from,
        }) = client.get_next_job(worker_id).await?
        else {
            return Ok(None);
        };

        debug!(
            job_id = %job.id,
            queue = %job.queue_name,
            job_name = %job.job_name,
            worker_id = %worker_id,
            resumed_from = %resumed_from,
            "Processing job"
        );
        self.events.emit(JobEvent::Active {
            job_id: job.id.clone(),
            queue: job.queue_name.clone(),
            worker_id: worker_id.to_string(),
        });

        WorkerMetrics::slot_busy(&self.id);
        let outcome = self.execute(client, processor, &mut job, lease, resumed_from).await;
        WorkerMetrics::slot_idle(&self.id);

        outcome.map(Some)
    }

    async fn execute(
        &self,
        client: &QueueClient,
        processor: &StepProcessor,
        job: &mut Job,
        lease: Lease,
        resumed_from: JobStatus,
    ) -> JobResult<ProcessOutcome> {
        let children = client.store().children(&job.id).await?;

        let lease_lost = Arc::new(AtomicBool::new(false));
        let current_lease = Arc::new(Mutex::new(lease));
        let renewal =
            self.spawn_lease_renewal(client, &job.id, current_lease.clone(), lease_lost.clone());

        let env = StepEnv {
            worker_id: current_lease.lock().worker_id.clone(),
            children,
            events: self.events.clone(),
            lease_lost,
        };
        let run = processor.run(job, resumed_from, env).await;
        drop(renewal);

        let lease = current_lease.lock().clone();
        let now = client.store().now().await?;

        match run {
            StepRun::Completed(value) => self.complete(client, job, &lease, value, now).await,
            StepRun::ContinueAs { step, delay } => {
                self.continue_as(client, job, &lease, &step, delay, now).await
            }
            StepRun::WaitForChildren { resume_at } => {
                self.wait_for_children(client, processor, job, &lease, resume_at, now)
                    .await
            }
            StepRun::Failed(err) => self.fail(client, job, &lease, err, now).await,
        }
    }

    fn spawn_lease_renewal(
        &self,
        client: &QueueClient,
        job_id: &JobId,
        lease: Arc<Mutex<Lease>>,
        lost: Arc<AtomicBool>,
    ) -> RenewalTask {
        let client = client.clone();
        let job_id = job_id.clone();
        let interval = self.config.lease_renew_interval;

        RenewalTask(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let held = lease.lock().clone();
                match client.extend_lock(&job_id, &held).await {
                    Ok(renewed) => {
                        debug!(
                            job_id = %job_id,
                            expires_at = %renewed.expires_at,
                            "Lease extended"
                        );
                        *lease.lock() = renewed;
                    }
                    Err(e) if e.is_lock_lost() => {
                        warn!(
                            job_id = %job_id,
                            worker_id = %held.worker_id,
                            "Lease lost while running"
                        );
                        lost.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "Failed to extend lease");
                    }
                }
            }
        }))
    }

    /// Writes the job back. Returns false if the lease was lost.
    async fn persist(&self, client: &QueueClient, job: &Job, lease: &Lease) -> JobResult<bool> {
        match client.save_job_state(job, lease).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_lock_lost() => {
                warn!(
                    job_id = %job.id,
                    queue = %job.queue_name,
                    worker_id = %lease.worker_id,
                    "Lock lost before save, discarding result"
                );
                JobMetrics::job_lock_lost(&job.queue_name, &job.job_name);
                self.locks_lost.fetch_add(1, Ordering::Relaxed);
                self.events.emit(JobEvent::LockLost {
                    job_id: job.id.clone(),
                    queue: job.queue_name.clone(),
                    worker_id: lease.worker_id.clone(),
                });
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Deletes a terminal job whose options ask for it.
    ///
    /// A child is kept while its parent still exists. Deleting a job also
    /// deletes its removable terminal descendants, which were kept for it.
    async fn remove_if_requested(&self, client: &QueueClient, job: &Job) -> JobResult<()> {
        if !job.is_removable() {
            return Ok(());
        }
        let store = client.store();
        if let Some(parent) = &job.parent_id {
            if store.get(parent).await?.is_some() {
                return Ok(());
            }
        }

        let mut pending = vec![job.clone()];
        while let Some(next) = pending.pop() {
            let children = store.child_jobs(&next.id).await?;
            if store.delete(&next.id).await? {
                debug!(job_id = %next.id, queue = %next.queue_name, "Removed job");
                self.events.emit(JobEvent::Removed {
                    job_id: next.id.clone(),
                    queue: next.queue_name.clone(),
                });
            }
            pending.extend(children.into_iter().filter(Job::is_removable));
        }
        Ok(())
    }

    async fn complete(
        &self,
        client: &QueueClient,
        job: &mut Job,
        lease: &Lease,
        value: Value,
        now: DateTime<Utc>,
    ) -> JobResult<ProcessOutcome> {
        let result = (!value.is_null()).then_some(value);
        job.move_to_finished(result.clone(), now)?;

        if !self.persist(client, job, lease).await? {
            return Ok(ProcessOutcome::LockLost { job_id: job.id.clone() });
        }

        info!(
            job_id = %job.id,
            queue = %job.queue_name,
            attempts_made = job.attempts_made,
            "Job completed"
        );
        JobMetrics::job_completed(&job.queue_name, &job.job_name);
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.events.emit(JobEvent::Completed {
            job_id: job.id.clone(),
            queue: job.queue_name.clone(),
            result,
        });

        self.remove_if_requested(client, job).await?;
        Ok(ProcessOutcome::Completed { job_id: job.id.clone() })
    }

    async fn continue_as(
        &self,
        client: &QueueClient,
        job: &mut Job,
        lease: &Lease,
        step: &str,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> JobResult<ProcessOutcome> {
        let scheduled_for = offset(now, delay);
        job.set_step(step);
        job.move_to_delayed(scheduled_for, now)?;

        if !self.persist(client, job, lease).await? {
            return Ok(ProcessOutcome::LockLost { job_id: job.id.clone() });
        }

        debug!(
            job_id = %job.id,
            step = %step,
            scheduled_for = %scheduled_for,
            "Job continues with next step"
        );
        JobMetrics::job_continued(&job.queue_name, &job.job_name);
        self.events.emit(JobEvent::Continued {
            job_id: job.id.clone(),
            queue: job.queue_name.clone(),
            step: step.to_string(),
            scheduled_for,
        });

        Ok(ProcessOutcome::Continued {
            job_id: job.id.clone(),
            step: step.to_string(),
            scheduled_for,
        })
    }

    async fn wait_for_children(
        &self,
        client: &QueueClient,
        processor: &StepProcessor,
        job: &mut Job,
        lease: &Lease,
        resume_at: Option<String>,
        now: DateTime<Utc>,
    ) -> JobResult<ProcessOutcome> {
        let children = client.store().children(&job.id).await?;

        if children.failed > 0 {
            let err = JobError::ChildFailed(format!(
                "{} of {} children of job {} failed",
                children.failed, children.total, job.id
            ));
            return self.fail(client, job, lease, err, now).await;
        }

        let step = resume_at.unwrap_or_else(|| job.current_step(processor.default_step()));

        if children.all_done() {
            return self.continue_as(client, job, lease, &step, Duration::ZERO, now).await;
        }

        job.set_step(&step);
        job.move_to_waiting_children(now)?;

        if !self.persist(client, job, lease).await? {
            return Ok(ProcessOutcome::LockLost { job_id: job.id.clone() });
        }

        debug!(
            job_id = %job.id,
            outstanding = children.outstanding,
            resume_at = %step,
            "Job waiting for children"
        );
        JobMetrics::job_waiting_children(&job.queue_name, &job.job_name);
        self.events.emit(JobEvent::WaitingChildren {
            job_id: job.id.clone(),
            queue: job.queue_name.clone(),
        });

        Ok(ProcessOutcome::WaitingChildren { job_id: job.id.clone() })
    }

    async fn fail(
        &self,
        client: &QueueClient,
        job: &mut Job,
        lease: &Lease,
        err: JobError,
        now: DateTime<Utc>,
    ) -> JobResult<ProcessOutcome> {
        let reason = err.to_string();
        job.move_to_failed(&reason, now)?;

        if err.is_retryable() && job.has_attempts_remaining() {
            let delay = job.options.backoff.delay_for_attempt(job.attempts_made);
            job.move_to_delayed(offset(now, delay), now)?;

            if !self.persist(client, job, lease).await? {
                return Ok(ProcessOutcome::LockLost { job_id: job.id.clone() });
            }

            warn!(
                job_id = %job.id,
                queue = %job.queue_name,
                attempts_made = job.attempts_made,
                max_attempts = job.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Job attempt failed, retrying"
            );
            JobMetrics::job_retried(&job.queue_name, &job.job_name, job.attempts_made);
            self.jobs_retried.fetch_add(1, Ordering::Relaxed);
            self.events.emit(JobEvent::Retrying {
                job_id: job.id.clone(),
                queue: job.queue_name.clone(),
                attempts_made: job.attempts_made,
                scheduled_for: offset(now, delay),
            });

            return Ok(ProcessOutcome::Retrying {
                job_id: job.id.clone(),
                attempts_made: job.attempts_made,
                delay,
            });
        }

        if !self.persist(client, job, lease).await? {
            return Ok(ProcessOutcome::LockLost { job_id: job.id.clone() });
        }

        if err.is_configuration() {
            error!(
                job_id = %job.id,
                queue = %job.queue_name,
                error = %err,
                "Job failed on configuration error"
            );
        } else {
            warn!(
                job_id = %job.id,
                queue = %job.queue_name,
                attempts_made = job.attempts_made,
                error = %err,
                "Job failed"
            );
        }
        JobMetrics::job_failed(&job.queue_name, &job.job_name, err.kind());
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        self.events.emit(JobEvent::Failed {
            job_id: job.id.clone(),
            queue: job.queue_name.clone(),
            reason: reason.clone(),
        });

        self.remove_if_requested(client, job).await?;

        if err.is_configuration() {
            return Err(err);
        }
        Ok(ProcessOutcome::Failed {
            job_id: job.id.clone(),
            reason,
        })
    }

    /// Promotes due delayed jobs and recovers stalled ones in every queue.
    pub async fn run_maintenance(&self) -> JobResult<()> {
        let clients: Vec<QueueClient> =
            self.processors.read().values().map(|r| r.client.clone()).collect();

        for client in clients {
            let promoted = client.promote_delayed().await?;
            let stalled = client.recover_stalled().await?;

            if !stalled.is_empty() {
                warn!(
                    queue = %client.name(),
                    recovered = stalled.recovered.len(),
                    failed = stalled.failed.len(),
                    "Recovered stalled jobs"
                );
            }
            for job_id in &stalled.failed {
                self.events.emit(JobEvent::Failed {
                    job_id: job_id.clone(),
                    queue: client.name().to_string(),
                    reason: "job stalled too many times".to_string(),
                });
            }

            let stalled_count = (stalled.recovered.len() + stalled.failed.len()) as u64;
            JobMetrics::maintenance(client.name(), promoted, stalled_count);
            client.stats().await?;
        }
        Ok(())
    }

    /// Run until [`stop`](Self::stop) is called.
    ///
    /// A `stop` issued before `run` makes the next `run` return as soon as
    /// it has started.
    pub async fn run(&self) -> JobResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(JobError::Worker("Worker loop already running".to_string()));
        }

        let queues = self.queues();
        if queues.is_empty() {
            self.running.store(false, Ordering::SeqCst);
            return Err(JobError::Configuration("no processors registered".to_string()));
        }

        info!(
            worker_id = %self.id,
            concurrency = self.config.concurrency,
            queues = ?queues,
            "Starting worker loop"
        );
        WorkerMetrics::update_concurrency(&self.id, self.config.concurrency);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tasks = JoinSet::new();

        for slot in 0..self.config.concurrency {
            let slot_id = format!("{}-{}", self.id, slot);
            let span = tracing::info_span!("worker", worker_id = %slot_id);
            let halt = self.shutdown_tx.subscribe();
            tasks.spawn(self.clone().slot_loop(slot_id, halt).instrument(span));
        }
        let span = tracing::info_span!("worker_maintenance", worker_id = %self.id);
        let halt = self.shutdown_tx.subscribe();
        tasks.spawn(self.clone().maintenance_loop(halt).instrument(span));

        let _ = shutdown_rx.wait_for(|stop| *stop).await;
        info!(worker_id = %self.id, "Received shutdown signal");

        info!(worker_id = %self.id, "Waiting for slots to finish...");
        let drained = timeout(self.config.shutdown_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(worker_id = %self.id, "Shutdown timeout elapsed, aborting slots");
            tasks.abort_all();
        }

        self.shutdown_tx.send_replace(false);
        self.running.store(false, Ordering::SeqCst);

        info!(
            worker_id = %self.id,
            completed = self.jobs_completed(),
            failed = self.jobs_failed(),
            "Worker loop stopped"
        );

        Ok(())
    }

    async fn slot_loop(self, slot_id: String, mut halt: watch::Receiver<bool>) {
        let mut cursor = 0usize;

        while !*halt.borrow() {
            let registered: Vec<(QueueClient, Arc<StepProcessor>)> = self
                .processors
                .read()
                .values()
                .map(|r| (r.client.clone(), r.processor.clone()))
                .collect();

            let mut pause = Some(self.config.poll_interval);
            for i in 0..registered.len() {
                let (client, processor) = &registered[(cursor + i) % registered.len()];
                match self.process_one(client, processor, &slot_id).await {
                    Ok(Some(outcome)) => {
                        debug!(
                            job_id = %outcome.job_id(),
                            queue = %client.name(),
                            "Slot handled job"
                        );
                        cursor = (cursor + i + 1) % registered.len();
                        pause = None;
                        break;
                    }
                    Ok(None) => {}
                    Err(e) if e.is_configuration() => {
                        self.report_error(&slot_id, &e);
                        pause = None;
                        break;
                    }
                    Err(e) => {
                        self.report_error(&slot_id, &e);
                        pause = Some(self.config.error_backoff);
                        break;
                    }
                }
            }

            if let Some(pause) = pause {
                tokio::select! {
                    _ = halt.changed() => {}
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
    }

    async fn maintenance_loop(self, mut halt: watch::Receiver<bool>) {
        while !*halt.borrow() {
            tokio::select! {
                _ = halt.changed() => break,
                _ = tokio::time::sleep(self.config.maintenance_interval) => {}
            }
            if let Err(e) = self.run_maintenance().await {
                self.report_error(&self.id, &e);
            }
        }
    }

    fn report_error(&self, worker_id: &str, err: &JobError) {
        error!(worker_id = %worker_id, error = %err, "Worker error");
        self.events.emit(JobEvent::WorkerError {
            worker_id: worker_id.to_string(),
            message: err.to_string(),
        });
    }

    /// Stop the worker loop.
    pub fn stop(&self) {
        info!(worker_id = %self.id, "Stopping worker loop...");
        self.shutdown_tx.send_replace(true);
    }

    /// Check if the loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed.load(Ordering::Relaxed)
    }

    pub fn jobs_failed(&self) -> u64 {
        self.jobs_failed.load(Ordering::Relaxed)
    }

    /// Get the worker ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

/// Worker loop statistics.
#[derive(Debug, Clone)]
pub struct WorkerLoopStats {
    /// Worker ID.
    pub id: String,

    /// Is running.
    pub running: bool,

    /// Configured concurrency.
    pub concurrency: usize,

    pub jobs_completed: u64,

    /// Terminal failures.
    pub jobs_failed: u64,

    /// Failed attempts that were rescheduled.
    pub jobs_retried: u64,

    /// Saves rejected for a lost lease.
    pub locks_lost: u64,

    /// Queues being processed.
    pub queues: Vec<String>,
}

impl WorkerLoop {
    /// Get loop statistics.
    pub fn stats(&self) -> WorkerLoopStats {
        WorkerLoopStats {
            id: self.id.clone(),
            running: self.is_running(),
            concurrency: self.config.concurrency,
            jobs_completed: self.jobs_completed(),
            jobs_failed: self.jobs_failed(),
            jobs_retried: self.jobs_retried.load(Ordering::Relaxed),
            locks_lost: self.locks_lost.load(Ordering::Relaxed),
            queues: self.queues(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EnqueueOptions;
    use crate::retry::RetryPolicy;
    use crate::step::{StepContext, StepOutcome};
    use crate::store::{Clock, InMemoryJobStore, ManualClock};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryJobStore>,
        worker: WorkerLoop,
    }

    impl Harness {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::default());
            let store = Arc::new(InMemoryJobStore::with_clock(clock.clone()));
            let config = WorkerLoopConfig {
                worker_id: Some("test-worker".to_string()),
                ..WorkerLoopConfig::default()
            };
            let worker = WorkerLoop::new(store.clone(), EventBus::default(), config);
            Self { clock, store, worker }
        }

        fn client(&self, queue: &str) -> QueueClient {
            QueueClient::new(queue, self.store.clone(), QueueDefaults::default())
        }

        async fn stored(&self, id: &JobId) -> Job {
            self.store.get(id).await.unwrap().unwrap()
        }
    }

    fn always_failing() -> StepProcessor {
        StepProcessor::builder()
            .step("send", |_ctx: StepContext| async {
                Err::<StepOutcome, _>(JobError::handler("smtp down"))
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_worker_loop_config_from_worker_config() {
        let config = WorkerLoopConfig::default();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.lease_duration, Duration::from_secs(30));
        assert!(config.lease_renew_interval < config.lease_duration);
    }

    #[test]
    fn test_zero_intervals_are_raised() {
        let config = WorkerLoopConfig {
            concurrency: 0,
            poll_interval: Duration::ZERO,
            error_backoff: Duration::ZERO,
            lease_duration: Duration::from_secs(10),
            lease_renew_interval: Duration::ZERO,
            maintenance_interval: Duration::ZERO,
            ..WorkerLoopConfig::default()
        };
        let store = Arc::new(InMemoryJobStore::new());
        let worker = WorkerLoop::new(store, EventBus::default(), config);

        let config = &worker.config;
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.poll_interval, MIN_INTERVAL);
        assert_eq!(config.error_backoff, MIN_INTERVAL);
        assert_eq!(config.maintenance_interval, MIN_INTERVAL);
        assert_eq!(config.lease_renew_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_renewal_interval_stays_inside_lease() {
        let config = WorkerLoopConfig {
            lease_duration: Duration::ZERO,
            lease_renew_interval: Duration::from_secs(60),
            ..WorkerLoopConfig::default()
        }
        .normalized();
        assert_eq!(config.lease_duration, MIN_INTERVAL * 2);
        assert_eq!(config.lease_renew_interval, MIN_INTERVAL);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let h = Harness::new();
        h.worker.register_processor("emails", always_failing()).unwrap();
        let err = h.worker.register_processor("emails", always_failing()).unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(h.worker.queues(), vec!["emails".to_string()]);
    }

    #[tokio::test]
    async fn test_process_next_unregistered_queue() {
        let h = Harness::new();
        let err = h.worker.process_next("nowhere").await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_process_next_idle() {
        let h = Harness::new();
        h.worker.register_processor("emails", always_failing()).unwrap();
        assert!(h.worker.process_next("emails").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_max_attempts_exhausted() {
        let h = Harness::new();
        h.worker.register_processor("emails", always_failing()).unwrap();
        let job = h
            .client("emails")
            .enqueue(
                "welcome",
                json!({}),
                EnqueueOptions::new()
                    .max_attempts(3)
                    .with_backoff(RetryPolicy::exponential(Duration::from_secs(1))),
            )
            .await
            .unwrap();

        let mut delays = Vec::new();
        for _ in 0..2 {
            match h.worker.process_next("emails").await.unwrap() {
                Some(ProcessOutcome::Retrying { delay, .. }) => delays.push(delay),
                other => panic!("expected retry, got {other:?}"),
            }
            assert!(h.worker.process_next("emails").await.unwrap().is_none());
            h.clock.advance(*delays.last().unwrap());
        }
        assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);

        let last = h.worker.process_next("emails").await.unwrap().unwrap();
        assert!(matches!(
            last,
            ProcessOutcome::Failed { ref reason, .. } if reason.contains("smtp down")
        ));

        let stored = h.stored(&job.id).await;
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts_made, 3);
        assert!(stored.failure_reason.unwrap().contains("smtp down"));
        assert_eq!(h.worker.stats().jobs_retried, 2);
        assert_eq!(h.worker.stats().jobs_failed, 1);

        h.clock.advance(Duration::from_secs(3600));
        assert!(h.worker.process_next("emails").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_single_attempt_fails_terminally() {
        let h = Harness::new();
        h.worker.register_processor("emails", always_failing()).unwrap();
        let job = h
            .client("emails")
            .enqueue("welcome", json!({}), EnqueueOptions::new())
            .await
            .unwrap();

        let outcome = h.worker.process_next("emails").await.unwrap().unwrap();
        assert!(matches!(outcome, ProcessOutcome::Failed { .. }));
        let stored = h.stored(&job.id).await;
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts_made, 1);
    }

    #[tokio::test]
    async fn test_proceed_schedules_next_step() {
        let h = Harness::new();
        let processor = StepProcessor::builder()
            .step("A", |ctx: StepContext| async move {
                Ok::<_, JobError>(ctx.proceed("B", Some(Duration::from_millis(1000))))
            })
            .step("B", |ctx: StepContext| async move {
                ctx.complete(json!({"step": ctx.step()}))
            })
            .default_step("A")
            .build()
            .unwrap();
        h.worker.register_processor("flows", processor).unwrap();
        let job = h
            .client("flows")
            .enqueue("flow", json!({}), EnqueueOptions::new().remove_on_complete(false))
            .await
            .unwrap();

        let start = h.clock.now();
        let outcome = h.worker.process_next("flows").await.unwrap().unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Continued {
                job_id: job.id.clone(),
                step: "B".to_string(),
                scheduled_for: offset(start, Duration::from_secs(1)),
            }
        );

        let stored = h.stored(&job.id).await;
        assert_eq!(stored.status, JobStatus::Delayed);
        assert_eq!(stored.step(), Some("B"));
        assert_eq!(stored.scheduled_for, Some(offset(start, Duration::from_secs(1))));
        assert_eq!(stored.attempts_made, 0);

        h.clock.advance(Duration::from_millis(999));
        assert!(h.worker.process_next("flows").await.unwrap().is_none());

        h.clock.advance(Duration::from_millis(1));
        let outcome = h.worker.process_next("flows").await.unwrap().unwrap();
        assert!(matches!(outcome, ProcessOutcome::Completed { .. }));
        let stored = h.stored(&job.id).await;
        assert_eq!(stored.status, JobStatus::Finished);
        assert_eq!(stored.result, Some(json!({"step": "B"})));
        assert_eq!(stored.attempts_made, 1);
    }

    #[tokio::test]
    async fn test_unknown_step_is_terminal_and_surfaced() {
        let h = Harness::new();
        let processor = StepProcessor::builder()
            .step("start", |_ctx: StepContext| async { Ok::<_, JobError>(StepOutcome::done()) })
            .build()
            .unwrap();
        h.worker.register_processor("q", processor).unwrap();
        let job = h
            .client("q")
            .enqueue("x", json!({"step": "missing"}), EnqueueOptions::new().max_attempts(5))
            .await
            .unwrap();

        let err = h.worker.process_next("q").await.unwrap_err();
        assert!(matches!(err, JobError::UnknownStep { ref step, .. } if step == "missing"));

        let stored = h.stored(&job.id).await;
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts_made, 1);
    }

    #[tokio::test]
    async fn test_completed_job_removed_by_default() {
        let h = Harness::new();
        let processor = StepProcessor::builder()
            .step("start", |_ctx: StepContext| async { Ok::<_, JobError>(StepOutcome::done()) })
            .build()
            .unwrap();
        h.worker.register_processor("q", processor).unwrap();
        let mut events = h.worker.events().subscribe();
        let job = h.client("q").enqueue("x", json!({}), EnqueueOptions::new()).await.unwrap();

        h.worker.process_next("q").await.unwrap().unwrap();
        assert!(h.store.get(&job.id).await.unwrap().is_none());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen.first(), Some(JobEvent::Active { .. })));
        assert!(matches!(seen.last(), Some(JobEvent::Removed { .. })));
    }

    #[tokio::test]
    async fn test_lock_lost_discards_result() {
        let h = Harness::new();
        let clock = h.clock.clone();
        let first_run = Arc::new(AtomicBool::new(true));
        let processor = StepProcessor::builder()
            .step("slow", move |_ctx: StepContext| {
                let clock = clock.clone();
                let first_run = first_run.clone();
                async move {
                    if first_run.swap(false, Ordering::SeqCst) {
                        clock.advance(Duration::from_secs(31));
                    }
                    Ok::<_, JobError>(StepOutcome::done())
                }
            })
            .build()
            .unwrap();
        h.worker.register_processor("q", processor).unwrap();
        let job = h.client("q").enqueue("x", json!({}), EnqueueOptions::new()).await.unwrap();

        let outcome = h.worker.process_next("q").await.unwrap().unwrap();
        assert_eq!(outcome, ProcessOutcome::LockLost { job_id: job.id.clone() });

        let stored = h.stored(&job.id).await;
        assert_eq!(stored.status, JobStatus::Active);
        assert_eq!(stored.attempts_made, 0);
        assert_eq!(h.worker.stats().locks_lost, 1);
        assert_eq!(h.worker.stats().jobs_completed, 0);

        h.worker.run_maintenance().await.unwrap();
        let stored = h.stored(&job.id).await;
        assert_eq!(stored.stalled_count, 1);
        assert!(matches!(
            h.worker.process_next("q").await.unwrap(),
            Some(ProcessOutcome::Completed { .. })
        ));
    }

    #[tokio::test]
    async fn test_parent_waits_for_children() {
        let h = Harness::new();
        let parent_runs = Arc::new(AtomicU32::new(0));
        let runs = parent_runs.clone();

        let parent = StepProcessor::builder()
            .step("fan_out", |ctx: StepContext| async move {
                Ok::<_, JobError>(ctx.wait_for_children(Some("collect")))
            })
            .step("collect", move |ctx: StepContext| {
                let runs = runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    ctx.complete(json!({"children": ctx.children().total}))
                }
            })
            .build()
            .unwrap();
        let child = StepProcessor::builder()
            .step("work", |_ctx: StepContext| async { Ok::<_, JobError>(StepOutcome::done()) })
            .build()
            .unwrap();
        h.worker.register_processor("parents", parent).unwrap();
        h.worker.register_processor("children", child).unwrap();

        let parents = h.client("parents");
        let children = h.client("children");
        let p = parents
            .enqueue("report", json!({}), EnqueueOptions::new().remove_on_complete(false))
            .await
            .unwrap();
        for _ in 0..2 {
            children
                .enqueue("part", json!({}), EnqueueOptions::new().parent(p.id.clone()))
                .await
                .unwrap();
        }

        let outcome = h.worker.process_next("parents").await.unwrap().unwrap();
        assert_eq!(outcome, ProcessOutcome::WaitingChildren { job_id: p.id.clone() });
        assert_eq!(h.stored(&p.id).await.status, JobStatus::WaitingChildren);
        assert_eq!(h.stored(&p.id).await.step(), Some("collect"));
        assert!(h.worker.process_next("parents").await.unwrap().is_none());

        h.worker.process_next("children").await.unwrap().unwrap();
        assert!(h.worker.process_next("parents").await.unwrap().is_none());
        assert_eq!(parent_runs.load(Ordering::SeqCst), 0);

        h.worker.process_next("children").await.unwrap().unwrap();
        let outcome = h.worker.process_next("parents").await.unwrap().unwrap();
        assert!(matches!(outcome, ProcessOutcome::Completed { .. }));
        assert_eq!(parent_runs.load(Ordering::SeqCst), 1);

        let stored = h.stored(&p.id).await;
        assert_eq!(stored.status, JobStatus::Finished);
        assert_eq!(stored.result, Some(json!({"children": 2})));
    }

    #[tokio::test]
    async fn test_removed_parent_takes_finished_children_along() {
        let h = Harness::new();
        let parent = StepProcessor::builder()
            .step("fan_out", |ctx: StepContext| async move {
                Ok::<_, JobError>(ctx.wait_for_children(Some("collect")))
            })
            .step("collect", |_ctx: StepContext| async { Ok::<_, JobError>(StepOutcome::done()) })
            .build()
            .unwrap();
        let child = StepProcessor::builder()
            .step("work", |_ctx: StepContext| async { Ok::<_, JobError>(StepOutcome::done()) })
            .build()
            .unwrap();
        h.worker.register_processor("parents", parent).unwrap();
        h.worker.register_processor("children", child).unwrap();
        let mut events = h.worker.events().subscribe();

        let p = h
            .client("parents")
            .enqueue("report", json!({}), EnqueueOptions::new())
            .await
            .unwrap();
        for _ in 0..2 {
            h.client("children")
                .enqueue("part", json!({}), EnqueueOptions::new().parent(p.id.clone()))
                .await
                .unwrap();
        }

        h.worker.process_next("parents").await.unwrap().unwrap();
        h.worker.process_next("children").await.unwrap().unwrap();
        h.worker.process_next("children").await.unwrap().unwrap();
        assert_eq!(h.store.len(), 3);

        let outcome = h.worker.process_next("parents").await.unwrap().unwrap();
        assert!(matches!(outcome, ProcessOutcome::Completed { .. }));
        assert_eq!(h.store.len(), 0);

        let mut removed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, JobEvent::Removed { .. }) {
                removed += 1;
            }
        }
        assert_eq!(removed, 3);
    }

    #[tokio::test]
    async fn test_finished_child_of_removed_parent_is_removed() {
        let h = Harness::new();
        h.worker.register_processor("parents", always_failing()).unwrap();
        let child = StepProcessor::builder()
            .step("work", |_ctx: StepContext| async { Ok::<_, JobError>(StepOutcome::done()) })
            .build()
            .unwrap();
        h.worker.register_processor("children", child).unwrap();

        let p = h
            .client("parents")
            .enqueue("report", json!({}), EnqueueOptions::new().remove_on_fail(true))
            .await
            .unwrap();
        let c = h
            .client("children")
            .enqueue("part", json!({}), EnqueueOptions::new().parent(p.id.clone()))
            .await
            .unwrap();

        h.worker.process_next("parents").await.unwrap().unwrap();
        assert!(h.store.get(&p.id).await.unwrap().is_none());
        assert!(h.store.get(&c.id).await.unwrap().is_some());

        h.worker.process_next("children").await.unwrap().unwrap();
        assert!(h.store.get(&c.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_panicking_handler_is_retried() {
        let h = Harness::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let processor = StepProcessor::builder()
            .step("send", move |ctx: StepContext| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("mailer crashed");
                    }
                    ctx.complete(json!({"sent": true}))
                }
            })
            .build()
            .unwrap();
        h.worker.register_processor("emails", processor).unwrap();
        let job = h
            .client("emails")
            .enqueue(
                "welcome",
                json!({}),
                EnqueueOptions::new()
                    .max_attempts(2)
                    .remove_on_complete(false)
                    .with_backoff(RetryPolicy::fixed(Duration::from_secs(1))),
            )
            .await
            .unwrap();

        let outcome = h.worker.process_next("emails").await.unwrap().unwrap();
        assert!(matches!(outcome, ProcessOutcome::Retrying { attempts_made: 1, .. }));
        let stored = h.stored(&job.id).await;
        assert_eq!(stored.status, JobStatus::Delayed);
        assert!(stored.failure_reason.unwrap().contains("mailer crashed"));

        h.clock.advance(Duration::from_secs(1));
        let outcome = h.worker.process_next("emails").await.unwrap().unwrap();
        assert!(matches!(outcome, ProcessOutcome::Completed { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_child_failure_fails_parent() {
        let h = Harness::new();
        let parent = StepProcessor::builder()
            .step("fan_out", |ctx: StepContext| async move {
                Ok::<_, JobError>(ctx.wait_for_children(Some("collect")))
            })
            .step("collect", |_ctx: StepContext| async { Ok::<_, JobError>(StepOutcome::done()) })
            .build()
            .unwrap();
        h.worker.register_processor("parents", parent).unwrap();
        h.worker.register_processor("children", always_failing()).unwrap();

        let p = h
            .client("parents")
            .enqueue("report", json!({}), EnqueueOptions::new().max_attempts(3))
            .await
            .unwrap();
        let c1 = h
            .client("children")
            .enqueue(
                "part",
                json!({}),
                EnqueueOptions::new().parent(p.id.clone()).remove_on_fail(true),
            )
            .await
            .unwrap();
        h.client("children")
            .enqueue("part", json!({}), EnqueueOptions::new().parent(p.id.clone()))
            .await
            .unwrap();

        h.worker.process_next("parents").await.unwrap().unwrap();
        let failed = h.worker.process_next("children").await.unwrap().unwrap();
        assert!(matches!(failed, ProcessOutcome::Failed { .. }));
        assert_eq!(failed.job_id(), &c1.id);
        assert!(h.store.get(&c1.id).await.unwrap().is_some());

        let outcome = h.worker.process_next("parents").await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            ProcessOutcome::Failed { ref reason, .. } if reason.contains("children")
        ));

        let stored = h.stored(&p.id).await;
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts_made, 1);
    }

    #[tokio::test]
    async fn test_wait_without_children_continues() {
        let h = Harness::new();
        let processor = StepProcessor::builder()
            .step("a", |ctx: StepContext| async move {
                Ok::<_, JobError>(ctx.wait_for_children(Some("b")))
            })
            .step("b", |_ctx: StepContext| async { Ok::<_, JobError>(StepOutcome::done()) })
            .build()
            .unwrap();
        h.worker.register_processor("q", processor).unwrap();
        h.client("q").enqueue("x", json!({}), EnqueueOptions::new()).await.unwrap();

        let outcome = h.worker.process_next("q").await.unwrap().unwrap();
        assert!(matches!(outcome, ProcessOutcome::Continued { ref step, .. } if step == "b"));
        let outcome = h.worker.process_next("q").await.unwrap().unwrap();
        assert!(matches!(outcome, ProcessOutcome::Completed { .. }));
    }
}
