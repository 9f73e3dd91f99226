//! Job error types.

use crate::status::JobStatus;
use taskline_core::TasklineError;
use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job-related errors.
///
/// Step continuations and waits on child jobs are not errors; they are
/// returned as [`StepOutcome`](crate::step::StepOutcome) variants.
#[derive(Debug, Error)]
pub enum JobError {
    /// The job's current step has no registered handler.
    #[error("Unknown step '{step}' for job type {job_name}")]
    UnknownStep { job_name: String, step: String },

    /// Malformed processor registration or invalid job options.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A step handler failed.
    #[error("Handler failed: {0}")]
    Handler(String),

    /// The lease on a job expired or was taken over by another worker.
    #[error("Lock lost for job {0}")]
    LockLost(String),

    /// A status change outside the transition table was attempted.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// A child job failed while its parent waited on it.
    #[error("Child job failed: {0}")]
    ChildFailed(String),

    /// Payload is not a JSON object or does not match the expected shape.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Job not found.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// A job with the same id already exists.
    #[error("Duplicate job id: {0}")]
    DuplicateJob(String),

    /// A persisted status string could not be parsed.
    #[error("Unknown job status: {0}")]
    UnknownStatus(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Worker error.
    #[error("Worker error: {0}")]
    Worker(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Creates a handler failure.
    pub fn handler(message: impl Into<String>) -> Self {
        JobError::Handler(message.into())
    }

    /// Returns true if a job failing with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            JobError::UnknownStep { .. }
                | JobError::Configuration(_)
                | JobError::LockLost(_)
                | JobError::InvalidTransition { .. }
                | JobError::ChildFailed(_)
                | JobError::InvalidPayload(_)
                | JobError::UnknownStatus(_)
        )
    }

    /// Returns true for errors caused by how the processor was set up.
    pub fn is_configuration(&self) -> bool {
        matches!(self, JobError::UnknownStep { .. } | JobError::Configuration(_))
    }

    /// Returns true if the lease was lost.
    pub fn is_lock_lost(&self) -> bool {
        matches!(self, JobError::LockLost(_))
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::UnknownStep { .. } => "unknown_step",
            JobError::Configuration(_) => "configuration",
            JobError::Handler(_) => "handler",
            JobError::LockLost(_) => "lock_lost",
            JobError::InvalidTransition { .. } => "invalid_transition",
            JobError::ChildFailed(_) => "child_failed",
            JobError::InvalidPayload(_) => "invalid_payload",
            JobError::NotFound(_) => "not_found",
            JobError::DuplicateJob(_) => "duplicate_job",
            JobError::UnknownStatus(_) => "unknown_status",
            JobError::Database(_) => "database",
            JobError::Serialization(_) => "serialization",
            JobError::Worker(_) => "worker",
            JobError::Internal(_) => "internal",
        }
    }
}

impl From<TasklineError> for JobError {
    fn from(err: TasklineError) -> Self {
        match err {
            TasklineError::Configuration(msg) => JobError::Configuration(msg),
            other => JobError::Internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::Handler(format!("{:#}", err))
    }
}
