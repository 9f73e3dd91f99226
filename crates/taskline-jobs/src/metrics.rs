//! Metrics for job engine monitoring.
//!
//! Recorded through the `metrics` facade; install any exporter to collect them.

use crate::store::QueueStats;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names for the job engine.
pub mod names {
    /// Total jobs enqueued.
    pub const JOBS_ENQUEUED_TOTAL: &str = "taskline_jobs_enqueued_total";
    /// Total jobs claimed by workers.
    pub const JOBS_CLAIMED_TOTAL: &str = "taskline_jobs_claimed_total";
    /// Total jobs completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "taskline_jobs_completed_total";
    /// Total jobs failed terminally.
    pub const JOBS_FAILED_TOTAL: &str = "taskline_jobs_failed_total";
    /// Total failed attempts scheduled for retry.
    pub const JOBS_RETRIED_TOTAL: &str = "taskline_jobs_retried_total";
    /// Total step continuations.
    pub const JOBS_CONTINUED_TOTAL: &str = "taskline_jobs_continued_total";
    /// Total jobs suspended on children.
    pub const JOBS_WAITING_CHILDREN_TOTAL: &str = "taskline_jobs_waiting_children_total";
    /// Total saves rejected because the lease was gone.
    pub const JOBS_LOCK_LOST_TOTAL: &str = "taskline_jobs_lock_lost_total";
    /// Total jobs cancelled.
    pub const JOBS_CANCELLED_TOTAL: &str = "taskline_jobs_cancelled_total";
    /// Total stalled jobs recovered.
    pub const JOBS_STALLED_TOTAL: &str = "taskline_jobs_stalled_total";
    /// Total delayed jobs promoted to waiting.
    pub const JOBS_PROMOTED_TOTAL: &str = "taskline_jobs_promoted_total";
    /// Total terminal jobs deleted by a clean sweep.
    pub const JOBS_CLEANED_TOTAL: &str = "taskline_jobs_cleaned_total";

    /// Current jobs per status.
    pub const JOBS_BY_STATUS: &str = "taskline_jobs";

    /// Step handler duration in seconds.
    pub const STEP_DURATION_SECONDS: &str = "taskline_job_step_duration_seconds";

    /// Worker loop concurrency.
    pub const WORKER_CONCURRENCY: &str = "taskline_worker_concurrency";
    /// Slots currently running a handler.
    pub const WORKER_BUSY_SLOTS: &str = "taskline_worker_busy_slots";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total number of jobs enqueued");
    describe_counter!(names::JOBS_CLAIMED_TOTAL, "Total number of jobs claimed by workers");
    describe_counter!(
        names::JOBS_COMPLETED_TOTAL,
        "Total number of jobs completed successfully"
    );
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total number of jobs that failed terminally");
    describe_counter!(
        names::JOBS_RETRIED_TOTAL,
        "Total number of failed attempts scheduled for retry"
    );
    describe_counter!(names::JOBS_CONTINUED_TOTAL, "Total number of step continuations");
    describe_counter!(
        names::JOBS_WAITING_CHILDREN_TOTAL,
        "Total number of times a job suspended on its children"
    );
    describe_counter!(
        names::JOBS_LOCK_LOST_TOTAL,
        "Total number of saves rejected for a lost lease"
    );
    describe_counter!(names::JOBS_CANCELLED_TOTAL, "Total number of jobs cancelled");
    describe_counter!(names::JOBS_STALLED_TOTAL, "Total number of stalled jobs recovered");
    describe_counter!(names::JOBS_PROMOTED_TOTAL, "Total number of delayed jobs promoted");
    describe_counter!(names::JOBS_CLEANED_TOTAL, "Total number of terminal jobs cleaned");

    describe_gauge!(names::JOBS_BY_STATUS, "Current number of jobs per status");

    describe_histogram!(names::STEP_DURATION_SECONDS, "Step handler duration in seconds");

    describe_gauge!(names::WORKER_CONCURRENCY, "Worker loop concurrency setting");
    describe_gauge!(names::WORKER_BUSY_SLOTS, "Worker slots currently running a handler");
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a job enqueued.
    pub fn job_enqueued(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_ENQUEUED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Record a job claimed.
    pub fn job_claimed(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_CLAIMED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Record how long one step handler ran.
    pub fn step_finished(
        queue: &str,
        job_name: &str,
        step: &str,
        outcome: &'static str,
        duration: Duration,
    ) {
        histogram!(
            names::STEP_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "step" => step.to_string(),
            "outcome" => outcome
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job completed.
    pub fn job_completed(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_COMPLETED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Record a step continuation.
    pub fn job_continued(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_CONTINUED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Record a job suspended on its children.
    pub fn job_waiting_children(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_WAITING_CHILDREN_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Record a terminal failure.
    pub fn job_failed(queue: &str, job_name: &str, error_type: &str) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "error_type" => error_type.to_string()
        )
        .increment(1);
    }

    /// Record a job retried.
    pub fn job_retried(queue: &str, job_name: &str, attempt: u32) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "attempt" => attempt.to_string()
        )
        .increment(1);
    }

    /// Record a save rejected for a lost lease.
    pub fn job_lock_lost(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_LOCK_LOST_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Record a job cancelled.
    pub fn job_cancelled(queue: &str) {
        counter!(names::JOBS_CANCELLED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Record terminal jobs deleted by a clean sweep.
    pub fn jobs_cleaned(queue: &str, count: u64) {
        counter!(names::JOBS_CLEANED_TOTAL, "queue" => queue.to_string()).increment(count);
    }

    /// Record a maintenance sweep.
    pub fn maintenance(queue: &str, promoted: u64, stalled: u64) {
        counter!(names::JOBS_PROMOTED_TOTAL, "queue" => queue.to_string()).increment(promoted);
        counter!(names::JOBS_STALLED_TOTAL, "queue" => queue.to_string()).increment(stalled);
    }

    /// Update per-status gauges.
    pub fn update_queue_sizes(queue: &str, stats: &QueueStats) {
        for (status, count) in [
            ("waiting", stats.waiting),
            ("active", stats.active),
            ("delayed", stats.delayed),
            ("waiting_children", stats.waiting_children),
            ("finished", stats.finished),
            ("failed", stats.failed),
            ("cancelled", stats.cancelled),
        ] {
            gauge!(
                names::JOBS_BY_STATUS,
                "queue" => queue.to_string(),
                "status" => status
            )
            .set(count as f64);
        }
    }
}

/// Worker metrics recorder.
#[derive(Clone)]
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Update configured concurrency.
    pub fn update_concurrency(worker_id: &str, concurrency: usize) {
        gauge!(
            names::WORKER_CONCURRENCY,
            "worker_id" => worker_id.to_string()
        )
        .set(concurrency as f64);
    }

    /// Mark a slot busy.
    pub fn slot_busy(worker_id: &str) {
        gauge!(names::WORKER_BUSY_SLOTS, "worker_id" => worker_id.to_string()).increment(1.0);
    }

    /// Mark a slot idle.
    pub fn slot_idle(worker_id: &str) {
        gauge!(names::WORKER_BUSY_SLOTS, "worker_id" => worker_id.to_string()).decrement(1.0);
    }
}
