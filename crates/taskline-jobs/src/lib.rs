//! Taskline Jobs - Persistent Job Queue and Step Engine
//!
//! A store-backed job queue with:
//! - Jobs persisted with an explicit status state machine
//! - Atomic claim with a time-bounded lease per worker
//! - Step-based handlers that continue, wait for child jobs, or complete
//! - Retry with exponential backoff within a per-job attempt budget
//! - Lease renewal, delayed-job promotion and stalled-job recovery
//! - Bulk enqueue, paging by status, queue pause and terminal-job cleanup
//! - PostgreSQL and in-memory stores behind one trait
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   Taskline Jobs Architecture                     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  Producer ── QueueClient::enqueue                                │
//! │     │                                                            │
//! │     ▼                                                            │
//! │  ┌─────────────────────────────────────────────────────────┐    │
//! │  │                    JobStore                              │    │
//! │  │   ┌──────────┐ ┌──────────┐ ┌──────────────────────┐    │    │
//! │  │   │ Waiting  │ │ Delayed  │ │   WaitingChildren    │    │    │
//! │  │   └────┬─────┘ └────┬─────┘ └──────────┬───────────┘    │    │
//! │  │        └────────────┴──────────────────┘                │    │
//! │  │                     │ claim_next (atomic lease)          │    │
//! │  └─────────────────────┼───────────────────────────────────┘    │
//! │                        ▼                                         │
//! │  ┌─────────────────────────────────────────────────────────┐    │
//! │  │                   WorkerLoop                             │    │
//! │  │  ┌──────────┐ ┌──────────┐ ┌──────────┐                 │    │
//! │  │  │  Slot 0  │ │  Slot 1  │ │  Slot N  │  + maintenance  │    │
//! │  │  └────┬─────┘ └────┬─────┘ └────┬─────┘                 │    │
//! │  │       └────────────┴────────────┘                       │    │
//! │  │                    │ StepProcessor::run                  │    │
//! │  │     ┌──────────────┼──────────────┬───────────────┐     │    │
//! │  │     ▼              ▼              ▼               ▼     │    │
//! │  │ ┌─────────┐ ┌────────────┐ ┌────────────┐ ┌──────────┐ │    │
//! │  │ │Finished │ │ ContinueAs │ │WaitChildren│ │ Failed / │ │    │
//! │  │ │         │ │ (Delayed)  │ │            │ │  Retry   │ │    │
//! │  │ └─────────┘ └────────────┘ └────────────┘ └──────────┘ │    │
//! │  └─────────────────────────────────────────────────────────┘    │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use taskline_jobs::prelude::*;
//!
//! let store = Arc::new(InMemoryJobStore::new());
//! let worker = WorkerLoop::new(store.clone(), EventBus::default(), WorkerLoopConfig::default());
//!
//! let emails = StepProcessor::builder()
//!     .step("send", |ctx: StepContext| async move {
//!         let to: String = ctx.payload_field("to")?.unwrap_or_default();
//!         // Send email logic
//!         ctx.complete(serde_json::json!({ "sent_to": to }))
//!     })
//!     .build()?;
//! worker.register_processor("emails", emails)?;
//!
//! let client = QueueClient::new("emails", store, QueueDefaults::default());
//! client
//!     .enqueue(
//!         "welcome",
//!         json!({ "to": "user@example.com" }),
//!         EnqueueOptions::new().max_attempts(3),
//!     )
//!     .await?;
//!
//! worker.run().await?;
//! ```

pub mod error;
pub mod events;
pub mod job;
pub mod metrics;
pub mod postgres;
pub mod queue;
pub mod retry;
pub mod status;
pub mod step;
pub mod store;
pub mod worker;

pub use error::{JobError, JobResult};
pub use events::{EventBus, JobEvent};
pub use job::{Job, JobId, JobLog, JobOptions, LockToken, LogLevel, STEP_FIELD};
pub use metrics::{register_metrics, JobMetrics, WorkerMetrics};
pub use postgres::{create_pool, DatabasePool, PostgresJobStore};
pub use queue::{BulkJob, EnqueueOptions, QueueClient, QueueDefaults};
pub use retry::{RetryPolicy, RetryStrategy};
pub use status::JobStatus;
pub use step::{
    StepContext, StepEnv, StepHandler, StepOutcome, StepProcessor, StepProcessorBuilder, StepRun,
};
pub use store::{
    ChildrenState, ClaimedJob, Clock, InMemoryJobStore, JobPage, JobStore, Lease, ManualClock,
    QueueStats, StalledReport, SystemClock,
};
pub use taskline_config::JobsConfig;
pub use worker::{ProcessOutcome, WorkerLoop, WorkerLoopConfig, WorkerLoopStats};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::events::EventBus;
    pub use crate::queue::{BulkJob, EnqueueOptions, QueueClient, QueueDefaults};
    pub use crate::retry::RetryPolicy;
    pub use crate::step::{StepContext, StepOutcome, StepProcessor};
    pub use crate::store::{InMemoryJobStore, JobStore};
    pub use crate::worker::{WorkerLoop, WorkerLoopConfig};
    pub use crate::{Job, JobError, JobId, JobResult, JobStatus};
}
