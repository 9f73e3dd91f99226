//! Job status and the transition table that guards it.

use crate::error::{JobError, JobResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created but not yet queued.
    #[default]
    Pending,
    /// Eligible for claim.
    Waiting,
    /// Claimed by a worker holding a live lease.
    Active,
    /// Eligible once `scheduled_for` has passed.
    Delayed,
    /// Suspended until its child jobs reach a terminal state.
    WaitingChildren,
    /// Completed successfully.
    Finished,
    /// Failed; terminal once attempts are exhausted.
    Failed,
    /// Cancelled before it ran.
    Cancelled,
}

impl JobStatus {
    /// Every status, in declaration order.
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Pending,
        JobStatus::Waiting,
        JobStatus::Active,
        JobStatus::Delayed,
        JobStatus::WaitingChildren,
        JobStatus::Finished,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Returns true if the transition table allows `self -> next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, next),
            (Pending, Waiting | Delayed | Active)
                | (Waiting, Active | Cancelled)
                | (Active, Finished | Failed | Delayed | WaitingChildren)
                | (Delayed, Waiting | Active)
                | (WaitingChildren, Active | Finished)
                | (Failed, Delayed)
        )
    }

    /// Validates `self -> next`, returning `next` on success.
    pub fn transition(self, next: JobStatus) -> JobResult<JobStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(JobError::InvalidTransition { from: self, to: next })
        }
    }

    /// Returns true for statuses a stored job never leaves.
    ///
    /// A persisted `Failed` is terminal: the retry path moves a job from
    /// `Failed` to `Delayed` before its state is written back.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Returns true for terminal statuses that count as a child failure.
    pub fn is_failure(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Stable string form used in storage.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Delayed => "delayed",
            JobStatus::WaitingChildren => "waiting_children",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| JobError::UnknownStatus(s.to_string()))
    }
}
