//! The job entity and its guarded mutations.

use crate::error::{JobError, JobResult};
use crate::retry::RetryPolicy;
use crate::status::JobStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Payload field holding the name of the step to run next.
pub const STEP_FIELD: &str = "step";

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Creates a new time-ordered job ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Creates a job ID from a string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque token identifying one specific claim of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(Uuid);

impl LockToken {
    /// Creates a new random token.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID.
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-job behaviour options persisted alongside the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Backoff applied between failed attempts.
    #[serde(default)]
    pub backoff: RetryPolicy,

    /// Delete the job once it finishes.
    #[serde(default = "default_true")]
    pub remove_on_complete: bool,

    /// Delete the job once it fails terminally.
    #[serde(default)]
    pub remove_on_fail: bool,

    /// Stalled recoveries tolerated before the job is failed.
    #[serde(default = "default_max_stalled")]
    pub max_stalled: u32,
}

fn default_true() -> bool {
    true
}

fn default_max_stalled() -> u32 {
    3
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            backoff: RetryPolicy::default(),
            remove_on_complete: true,
            remove_on_fail: false,
            max_stalled: default_max_stalled(),
        }
    }
}

/// Severity of a job log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(level)
    }
}

/// One line of a job's own log, written by its handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLog {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// A persisted unit of work.
///
/// Status changes go through the `move_to_*` methods, each of which checks
/// the transition table and keeps the lease and timestamp fields coherent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    pub job_name: String,
    pub payload: Value,
    pub options: JobOptions,
    pub status: JobStatus,
    /// Higher runs first.
    pub priority: i32,
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// Earliest time the job may be claimed; `None` means immediately.
    pub scheduled_for: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub lock_token: Option<LockToken>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub failure_reason: Option<String>,
    pub progress: Option<Value>,
    #[serde(default)]
    pub logs: Vec<JobLog>,
    pub parent_id: Option<JobId>,
    pub stalled_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_on: Option<DateTime<Utc>>,
    pub finished_on: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a `Pending` job.
    ///
    /// The payload must be a JSON object; `null` is accepted as an empty object.
    pub fn new(
        id: JobId,
        queue_name: impl Into<String>,
        job_name: impl Into<String>,
        payload: Value,
        now: DateTime<Utc>,
    ) -> JobResult<Self> {
        let payload = match payload {
            Value::Object(map) => Value::Object(map),
            Value::Null => Value::Object(Map::new()),
            other => {
                return Err(JobError::InvalidPayload(format!(
                    "payload must be a JSON object, got {}",
                    json_kind(&other)
                )))
            }
        };

        Ok(Self {
            id,
            queue_name: queue_name.into(),
            job_name: job_name.into(),
            payload,
            options: JobOptions::default(),
            status: JobStatus::Pending,
            priority: 0,
            attempts_made: 0,
            max_attempts: 1,
            scheduled_for: None,
            worker_id: None,
            lock_token: None,
            lock_expires_at: None,
            result: None,
            failure_reason: None,
            progress: None,
            logs: Vec::new(),
            parent_id: None,
            stalled_count: 0,
            created_at: now,
            updated_at: now,
            processed_on: None,
            finished_on: None,
        })
    }

    fn transition(&mut self, to: JobStatus, now: DateTime<Utc>) -> JobResult<()> {
        self.status = self.status.transition(to)?;
        self.updated_at = now;
        Ok(())
    }

    fn release_lock(&mut self) {
        self.worker_id = None;
        self.lock_token = None;
        self.lock_expires_at = None;
    }

    /// Queues the job for immediate claim.
    pub fn move_to_waiting(&mut self, now: DateTime<Utc>) -> JobResult<()> {
        self.transition(JobStatus::Waiting, now)?;
        self.scheduled_for = None;
        Ok(())
    }

    /// Claims the job for `worker_id` until `lock_expires_at`.
    pub fn move_to_active(
        &mut self,
        worker_id: &str,
        token: LockToken,
        lock_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> JobResult<()> {
        self.transition(JobStatus::Active, now)?;
        self.worker_id = Some(worker_id.to_string());
        self.lock_token = Some(token);
        self.lock_expires_at = Some(lock_expires_at);
        self.processed_on = Some(now);
        Ok(())
    }

    /// Completes the job. Counts as an attempt.
    pub fn move_to_finished(&mut self, result: Option<Value>, now: DateTime<Utc>) -> JobResult<()> {
        self.transition(JobStatus::Finished, now)?;
        self.attempts_made = self.attempts_made.saturating_add(1).min(self.max_attempts);
        self.result = result;
        self.failure_reason = None;
        self.finished_on = Some(now);
        self.release_lock();
        Ok(())
    }

    /// Records a failed attempt.
    ///
    /// The caller decides whether to follow up with [`move_to_delayed`](Self::move_to_delayed).
    pub fn move_to_failed(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> JobResult<()> {
        self.transition(JobStatus::Failed, now)?;
        self.attempts_made = self.attempts_made.saturating_add(1).min(self.max_attempts);
        self.failure_reason = Some(reason.into());
        self.finished_on = Some(now);
        self.release_lock();
        Ok(())
    }

    /// Parks the job until `until`.
    pub fn move_to_delayed(&mut self, until: DateTime<Utc>, now: DateTime<Utc>) -> JobResult<()> {
        self.transition(JobStatus::Delayed, now)?;
        self.scheduled_for = Some(until);
        self.finished_on = None;
        self.release_lock();
        Ok(())
    }

    /// Suspends the job until its children are done.
    pub fn move_to_waiting_children(&mut self, now: DateTime<Utc>) -> JobResult<()> {
        self.transition(JobStatus::WaitingChildren, now)?;
        self.release_lock();
        Ok(())
    }

    /// Cancels a job that has not started.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> JobResult<()> {
        self.transition(JobStatus::Cancelled, now)?;
        self.finished_on = Some(now);
        Ok(())
    }

    /// Handles an active job whose lease expired without a save.
    ///
    /// Returns true if the job exceeded its stall budget and was failed.
    pub fn mark_stalled(&mut self, now: DateTime<Utc>) -> JobResult<bool> {
        self.stalled_count = self.stalled_count.saturating_add(1);
        if self.stalled_count > self.options.max_stalled {
            self.transition(JobStatus::Failed, now)?;
            self.failure_reason = Some(format!(
                "job stalled more than {} times",
                self.options.max_stalled
            ));
            self.finished_on = Some(now);
            self.release_lock();
            Ok(true)
        } else {
            self.move_to_delayed(now, now)?;
            Ok(false)
        }
    }

    /// Name of the step to run, falling back to `default_step`.
    pub fn current_step(&self, default_step: &str) -> String {
        self.step().unwrap_or(default_step).to_string()
    }

    /// Step recorded in the payload, if any.
    pub fn step(&self) -> Option<&str> {
        self.payload.get(STEP_FIELD).and_then(Value::as_str)
    }

    /// Records the step to run next.
    pub fn set_step(&mut self, step: &str) {
        if let Value::Object(map) = &mut self.payload {
            map.insert(STEP_FIELD.to_string(), Value::String(step.to_string()));
        }
    }

    /// Returns true while another attempt fits in the budget.
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    /// Returns true if some worker holds an unexpired lease at `now`.
    pub fn lease_is_live(&self, now: DateTime<Utc>) -> bool {
        self.lock_expires_at.is_some_and(|expires| expires > now)
    }

    /// Returns true if `worker_id`/`token` hold the live lease.
    pub fn holds_lease(&self, worker_id: &str, token: LockToken, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Active
            && self.worker_id.as_deref() == Some(worker_id)
            && self.lock_token == Some(token)
            && self.lease_is_live(now)
    }

    /// Returns true if the job's start time has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for.map_or(true, |at| at <= now)
    }

    /// Stores handler-reported progress.
    pub fn update_progress(&mut self, progress: Value) {
        self.progress = Some(progress);
    }

    /// Appends a line to the job's log.
    pub fn add_log(&mut self, level: LogLevel, message: impl Into<String>, now: DateTime<Utc>) {
        self.logs.push(JobLog {
            level,
            message: message.into(),
            timestamp: now,
        });
    }

    /// Returns true if the job is terminal and its own options ask for
    /// deletion in that status.
    pub fn is_removable(&self) -> bool {
        match self.status {
            JobStatus::Finished => self.options.remove_on_complete,
            JobStatus::Failed | JobStatus::Cancelled => self.options.remove_on_fail,
            _ => false,
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
