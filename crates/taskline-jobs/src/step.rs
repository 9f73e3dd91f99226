//! Step processors.
//!
//! A job's handler is split into named steps. Each invocation runs exactly
//! one step and reports what should happen next through a [`StepOutcome`];
//! the worker loop turns that outcome into a status transition.

use crate::error::{JobError, JobResult};
use crate::events::{EventBus, JobEvent};
use crate::job::{Job, JobId, JobLog, LogLevel};
use crate::metrics::JobMetrics;
use crate::status::JobStatus;
use crate::store::ChildrenState;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Boxed step handler.
pub type StepHandler =
    Arc<dyn Fn(StepContext) -> BoxFuture<'static, JobResult<StepOutcome>> + Send + Sync>;

/// What a step handler asks for when it returns successfully.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The job is done.
    Completed(Value),
    /// Run `step` next, after `delay` (the processor default when `None`).
    ContinueAs { step: String, delay: Option<Duration> },
    /// Park the job until its children are terminal, then run `resume_at`
    /// (or the same step again).
    WaitForChildren { resume_at: Option<String> },
}

impl StepOutcome {
    /// Completes with an empty result.
    pub fn done() -> Self {
        StepOutcome::Completed(Value::Null)
    }
}

/// Result of running one step, as seen by the worker loop.
#[derive(Debug)]
pub enum StepRun {
    Completed(Value),
    ContinueAs { step: String, delay: Duration },
    WaitForChildren { resume_at: Option<String> },
    Failed(JobError),
}

impl StepRun {
    fn label(&self) -> &'static str {
        match self {
            StepRun::Completed(_) => "completed",
            StepRun::ContinueAs { .. } => "continued",
            StepRun::WaitForChildren { .. } => "waiting_children",
            StepRun::Failed(_) => "failed",
        }
    }
}

/// Worker-side inputs to a step invocation.
#[derive(Clone)]
pub struct StepEnv {
    pub worker_id: String,
    pub children: ChildrenState,
    pub events: EventBus,
    /// Set by lease renewal when the claim is gone.
    pub lease_lost: Arc<AtomicBool>,
}

impl StepEnv {
    pub fn new(worker_id: impl Into<String>, events: EventBus) -> Self {
        Self {
            worker_id: worker_id.into(),
            children: ChildrenState::default(),
            events,
            lease_lost: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_children(mut self, children: ChildrenState) -> Self {
        self.children = children;
        self
    }
}

/// Handle passed to a step handler.
///
/// Payload, progress and log lines recorded through the context are written
/// back to the job when the step returns, whatever the outcome.
#[derive(Clone)]
pub struct StepContext {
    job: Arc<Job>,
    step: String,
    worker_id: String,
    children: ChildrenState,
    payload: Arc<Mutex<Value>>,
    progress: Arc<Mutex<Option<Value>>>,
    logs: Arc<Mutex<Vec<JobLog>>>,
    lease_lost: Arc<AtomicBool>,
    events: EventBus,
}

impl StepContext {
    /// The job as it was when claimed.
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> &JobId {
        &self.job.id
    }

    pub fn queue(&self) -> &str {
        &self.job.queue_name
    }

    pub fn job_name(&self) -> &str {
        &self.job.job_name
    }

    /// Name of the step being run.
    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Attempts already counted before this one.
    pub fn attempts_made(&self) -> u32 {
        self.job.attempts_made
    }

    /// Returns true if a failure now would be terminal.
    pub fn is_final_attempt(&self) -> bool {
        self.job.attempts_made.saturating_add(1) >= self.job.max_attempts
    }

    /// Children state at claim time.
    pub fn children(&self) -> ChildrenState {
        self.children
    }

    /// Current payload.
    pub fn payload(&self) -> Value {
        self.payload.lock().clone()
    }

    /// Deserializes the whole payload.
    pub fn payload_as<T: DeserializeOwned>(&self) -> JobResult<T> {
        serde_json::from_value(self.payload())
            .map_err(|e| JobError::InvalidPayload(e.to_string()))
    }

    /// Reads and deserializes one payload field.
    pub fn payload_field<T: DeserializeOwned>(&self, key: &str) -> JobResult<Option<T>> {
        let value = self.payload.lock().get(key).cloned();
        value
            .map(|v| {
                serde_json::from_value(v)
                    .map_err(|e| JobError::InvalidPayload(format!("{key}: {e}")))
            })
            .transpose()
    }

    /// Sets one payload field.
    pub fn set_payload_field<T: Serialize>(&self, key: &str, value: T) -> JobResult<()> {
        let value = serde_json::to_value(value)?;
        match &mut *self.payload.lock() {
            Value::Object(map) => {
                map.insert(key.to_string(), value);
                Ok(())
            }
            _ => Err(JobError::InvalidPayload("payload is not an object".to_string())),
        }
    }

    /// Records progress and notifies subscribers.
    pub fn update_progress<T: Serialize>(&self, progress: T) -> JobResult<()> {
        let progress = serde_json::to_value(progress)?;
        *self.progress.lock() = Some(progress.clone());
        self.events.emit(JobEvent::Progress {
            job_id: self.job.id.clone(),
            queue: self.job.queue_name.clone(),
            progress,
        });
        Ok(())
    }

    /// Appends a line to the job's log and mirrors it to tracing.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        let job_id = &self.job.id;
        match level {
            LogLevel::Debug => debug!(job_id = %job_id, step = %self.step, "{message}"),
            LogLevel::Info => info!(job_id = %job_id, step = %self.step, "{message}"),
            LogLevel::Warn => warn!(job_id = %job_id, step = %self.step, "{message}"),
            LogLevel::Error => error!(job_id = %job_id, step = %self.step, "{message}"),
        }
        self.logs.lock().push(JobLog {
            level,
            message,
            timestamp: Utc::now(),
        });
    }

    /// Returns true once the lease could not be renewed.
    ///
    /// Anything the handler does after that is discarded on save.
    pub fn lease_lost(&self) -> bool {
        self.lease_lost.load(Ordering::SeqCst)
    }

    /// Continue with `step`, optionally after `delay`.
    pub fn proceed(&self, step: impl Into<String>, delay: Option<Duration>) -> StepOutcome {
        StepOutcome::ContinueAs {
            step: step.into(),
            delay,
        }
    }

    /// Finish the job with `value` as its result.
    pub fn complete<T: Serialize>(&self, value: T) -> JobResult<StepOutcome> {
        Ok(StepOutcome::Completed(serde_json::to_value(value)?))
    }

    /// Wait for this job's children before running `resume_at`.
    pub fn wait_for_children(&self, resume_at: Option<&str>) -> StepOutcome {
        StepOutcome::WaitForChildren {
            resume_at: resume_at.map(str::to_string),
        }
    }
}

/// Named step handlers for one kind of job.
pub struct StepProcessor {
    steps: HashMap<String, StepHandler>,
    default_step: String,
    default_delay: Duration,
}

impl std::fmt::Debug for StepProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut steps: Vec<&String> = self.steps.keys().collect();
        steps.sort();
        f.debug_struct("StepProcessor")
            .field("steps", &steps)
            .field("default_step", &self.default_step)
            .field("default_delay", &self.default_delay)
            .finish()
    }
}

impl StepProcessor {
    pub fn builder() -> StepProcessorBuilder {
        StepProcessorBuilder::default()
    }

    /// Step run when the payload names none.
    pub fn default_step(&self) -> &str {
        &self.default_step
    }

    pub fn default_delay(&self) -> Duration {
        self.default_delay
    }

    pub fn has_step(&self, step: &str) -> bool {
        self.steps.contains_key(step)
    }

    /// Runs the job's current step.
    ///
    /// `job` must be the claimed, `Active` job; its payload, progress and
    /// logs are updated in place. Never returns an error directly: every failure is
    /// reported as [`StepRun::Failed`].
    pub async fn run(&self, job: &mut Job, resumed_from: JobStatus, env: StepEnv) -> StepRun {
        if resumed_from == JobStatus::WaitingChildren && env.children.failed > 0 {
            return StepRun::Failed(JobError::ChildFailed(format!(
                "{} of {} children of job {} failed",
                env.children.failed, env.children.total, job.id
            )));
        }

        let step = job.current_step(&self.default_step);
        job.set_step(&step);

        let Some(handler) = self.steps.get(&step).cloned() else {
            warn!(job_id = %job.id, job_name = %job.job_name, step = %step, "No handler for step");
            return StepRun::Failed(JobError::UnknownStep {
                job_name: job.job_name.clone(),
                step,
            });
        };

        let ctx = StepContext {
            job: Arc::new(job.clone()),
            step: step.clone(),
            worker_id: env.worker_id,
            children: env.children,
            payload: Arc::new(Mutex::new(job.payload.clone())),
            progress: Arc::new(Mutex::new(None)),
            logs: Arc::new(Mutex::new(Vec::new())),
            lease_lost: env.lease_lost,
            events: env.events,
        };

        debug!(job_id = %job.id, step = %step, "Running step");
        let started = Instant::now();
        let result = AssertUnwindSafe(handler(ctx.clone())).catch_unwind().await;
        let elapsed = started.elapsed();

        job.payload = ctx.payload();
        if let Some(progress) = ctx.progress.lock().take() {
            job.update_progress(progress);
        }
        job.logs.append(&mut ctx.logs.lock());

        let run = match result {
            Ok(Ok(StepOutcome::Completed(value))) => StepRun::Completed(value),
            Ok(Ok(StepOutcome::ContinueAs { step, delay })) => StepRun::ContinueAs {
                step,
                delay: delay.unwrap_or(self.default_delay),
            },
            Ok(Ok(StepOutcome::WaitForChildren { resume_at })) => {
                StepRun::WaitForChildren { resume_at }
            }
            Ok(Err(err)) => StepRun::Failed(err),
            Err(panic) => StepRun::Failed(JobError::handler(format!(
                "step '{}' panicked: {}",
                step,
                panic_message(panic.as_ref())
            ))),
        };

        JobMetrics::step_finished(&job.queue_name, &job.job_name, &step, run.label(), elapsed);
        run
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Builder for [`StepProcessor`].
#[derive(Default)]
pub struct StepProcessorBuilder {
    steps: HashMap<String, StepHandler>,
    first_step: Option<String>,
    default_step: Option<String>,
    default_delay: Duration,
    duplicate: Option<String>,
}

impl StepProcessorBuilder {
    /// Registers a handler for `name`.
    ///
    /// Any error type convertible into [`JobError`] may be returned; it is
    /// treated as a step failure.
    pub fn step<F, Fut, E>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutcome, E>> + Send + 'static,
        E: Into<JobError> + 'static,
    {
        let name = name.into();
        let boxed: StepHandler = Arc::new(move |ctx: StepContext| {
            let fut = handler(ctx);
            async move { fut.await.map_err(Into::into) }.boxed()
        });

        if self.steps.insert(name.clone(), boxed).is_some() {
            self.duplicate.get_or_insert(name.clone());
        }
        self.first_step.get_or_insert(name);
        self
    }

    /// Step run when the payload names none. Defaults to the first registered
    /// step.
    pub fn default_step(mut self, name: impl Into<String>) -> Self {
        self.default_step = Some(name.into());
        self
    }

    /// Delay used when a continuation names none.
    pub fn default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn build(self) -> JobResult<StepProcessor> {
        if let Some(name) = self.duplicate {
            return Err(JobError::Configuration(format!("step '{name}' registered twice")));
        }

        let default_step = self
            .default_step
            .or(self.first_step)
            .ok_or_else(|| JobError::Configuration("processor has no steps".to_string()))?;

        if !self.steps.contains_key(&default_step) {
            return Err(JobError::Configuration(format!(
                "default step '{default_step}' has no handler"
            )));
        }

        Ok(StepProcessor {
            steps: self.steps,
            default_step,
            default_delay: self.default_delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::LockToken;
    use chrono::Utc;
    use serde_json::json;

    fn active_job(payload: Value) -> Job {
        let now = Utc::now();
        let mut job = Job::new(JobId::new(), "q", "report", payload, now).unwrap();
        job.move_to_waiting(now).unwrap();
        job.move_to_active("w", LockToken::new(), now + chrono::Duration::seconds(30), now)
            .unwrap();
        job
    }

    fn env() -> StepEnv {
        StepEnv::new("w", EventBus::default())
    }

    fn two_steps() -> StepProcessor {
        StepProcessor::builder()
            .step("A", |ctx: StepContext| async move {
                ctx.set_payload_field("seen_a", true)?;
                Ok::<_, JobError>(ctx.proceed("B", Some(Duration::from_secs(1))))
            })
            .step("B", |ctx: StepContext| async move {
                ctx.complete(json!({"ok": true}))
            })
            .default_step("A")
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_requires_steps() {
        let err = StepProcessor::builder().build().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_build_rejects_unregistered_default() {
        let err = StepProcessor::builder()
            .step("A", |_ctx: StepContext| async { Ok::<_, JobError>(StepOutcome::done()) })
            .default_step("missing")
            .build()
            .unwrap_err();
        assert!(matches!(err, JobError::Configuration(ref m) if m.contains("missing")));
    }

    #[test]
    fn test_build_rejects_duplicate_step() {
        let err = StepProcessor::builder()
            .step("A", |_ctx: StepContext| async { Ok::<_, JobError>(StepOutcome::done()) })
            .step("A", |_ctx: StepContext| async { Ok::<_, JobError>(StepOutcome::done()) })
            .build()
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_default_step_is_first_registered() {
        let processor = StepProcessor::builder()
            .step("first", |_ctx: StepContext| async { Ok::<_, JobError>(StepOutcome::done()) })
            .step("second", |_ctx: StepContext| async { Ok::<_, JobError>(StepOutcome::done()) })
            .build()
            .unwrap();
        assert_eq!(processor.default_step(), "first");
    }

    #[tokio::test]
    async fn test_first_run_uses_default_step() {
        let processor = two_steps();
        let mut job = active_job(json!({}));

        let run = processor.run(&mut job, JobStatus::Waiting, env()).await;
        match run {
            StepRun::ContinueAs { step, delay } => {
                assert_eq!(step, "B");
                assert_eq!(delay, Duration::from_secs(1));
            }
            other => panic!("unexpected run: {other:?}"),
        }
        assert_eq!(job.payload["seen_a"], true);
        assert_eq!(job.step(), Some("A"));
    }

    #[tokio::test]
    async fn test_runs_step_named_in_payload() {
        let processor = two_steps();
        let mut job = active_job(json!({"step": "B"}));

        let run = processor.run(&mut job, JobStatus::Delayed, env()).await;
        assert!(matches!(run, StepRun::Completed(ref v) if v["ok"] == true));
    }

    #[tokio::test]
    async fn test_unknown_step() {
        let processor = two_steps();
        let mut job = active_job(json!({"step": "Z"}));

        let run = processor.run(&mut job, JobStatus::Waiting, env()).await;
        match run {
            StepRun::Failed(err @ JobError::UnknownStep { .. }) => {
                assert!(!err.is_retryable());
                assert!(err.to_string().contains('Z'));
            }
            other => panic!("unexpected run: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_default_delay_applies() {
        let processor = StepProcessor::builder()
            .step("A", |ctx: StepContext| async move {
                Ok::<_, JobError>(ctx.proceed("A2", None))
            })
            .step("A2", |_ctx: StepContext| async { Ok::<_, JobError>(StepOutcome::done()) })
            .default_delay(Duration::from_millis(250))
            .build()
            .unwrap();
        let mut job = active_job(json!({}));

        let run = processor.run(&mut job, JobStatus::Waiting, env()).await;
        assert!(matches!(
            run,
            StepRun::ContinueAs { delay, .. } if delay == Duration::from_millis(250)
        ));
    }

    #[tokio::test]
    async fn test_handler_error_is_failure() {
        let processor = StepProcessor::builder()
            .step("A", |_ctx: StepContext| async {
                Err::<StepOutcome, _>(anyhow::anyhow!("smtp unavailable"))
            })
            .build()
            .unwrap();
        let mut job = active_job(json!({}));

        let run = processor.run(&mut job, JobStatus::Waiting, env()).await;
        match run {
            StepRun::Failed(err) => {
                assert!(err.is_retryable());
                assert!(err.to_string().contains("smtp unavailable"));
            }
            other => panic!("unexpected run: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_panic_is_failure() {
        let processor = StepProcessor::builder()
            .step("A", |_ctx: StepContext| async {
                if true {
                    panic!("kaboom");
                }
                Ok::<_, JobError>(StepOutcome::done())
            })
            .build()
            .unwrap();
        let mut job = active_job(json!({}));

        let run = processor.run(&mut job, JobStatus::Waiting, env()).await;
        assert!(matches!(
            run,
            StepRun::Failed(JobError::Handler(ref m)) if m.contains("kaboom")
        ));
    }

    #[tokio::test]
    async fn test_failed_child_fails_parent_without_running_handler() {
        let processor = StepProcessor::builder()
            .step("A", |_ctx: StepContext| async {
                if true {
                    panic!("handler must not run");
                }
                Ok::<_, JobError>(StepOutcome::done())
            })
            .build()
            .unwrap();
        let mut job = active_job(json!({}));
        let children = ChildrenState {
            total: 2,
            outstanding: 1,
            failed: 1,
        };

        let run = processor
            .run(&mut job, JobStatus::WaitingChildren, env().with_children(children))
            .await;
        assert!(matches!(run, StepRun::Failed(JobError::ChildFailed(_))));
    }

    #[tokio::test]
    async fn test_progress_and_payload_written_back() {
        let processor = StepProcessor::builder()
            .step("A", |ctx: StepContext| async move {
                let count: u32 = ctx.payload_field("count")?.unwrap_or(0);
                ctx.set_payload_field("count", count + 1)?;
                ctx.update_progress(json!({"percent": 50}))?;
                Ok::<_, JobError>(ctx.wait_for_children(Some("after")))
            })
            .build()
            .unwrap();
        let mut job = active_job(json!({"count": 4}));
        let events = EventBus::default();
        let mut rx = events.subscribe();

        let run = processor
            .run(&mut job, JobStatus::Waiting, StepEnv::new("w", events))
            .await;

        assert!(matches!(
            run,
            StepRun::WaitForChildren { resume_at: Some(ref s) } if s == "after"
        ));
        assert_eq!(job.payload["count"], 5);
        assert_eq!(job.progress, Some(json!({"percent": 50})));
        assert!(matches!(rx.try_recv().unwrap(), JobEvent::Progress { .. }));
    }

    #[tokio::test]
    async fn test_log_lines_survive_failure() {
        let processor = StepProcessor::builder()
            .step("A", |ctx: StepContext| async move {
                ctx.log(LogLevel::Info, "fetching page 1");
                ctx.log(LogLevel::Warn, "rate limited");
                Err::<StepOutcome, _>(JobError::handler("gave up"))
            })
            .build()
            .unwrap();
        let mut job = active_job(json!({}));
        let now = Utc::now();
        job.add_log(LogLevel::Debug, "earlier attempt", now);

        let run = processor.run(&mut job, JobStatus::Waiting, env()).await;

        assert!(matches!(run, StepRun::Failed(_)));
        let lines: Vec<_> = job.logs.iter().map(|l| (l.level, l.message.as_str())).collect();
        assert_eq!(
            lines,
            vec![
                (LogLevel::Debug, "earlier attempt"),
                (LogLevel::Info, "fetching page 1"),
                (LogLevel::Warn, "rate limited"),
            ]
        );
    }

    #[tokio::test]
    async fn test_typed_payload() {
        #[derive(serde::Deserialize)]
        struct Email {
            to: String,
        }

        let processor = StepProcessor::builder()
            .step("send", |ctx: StepContext| async move {
                let email: Email = ctx.payload_as()?;
                ctx.complete(json!({"sent_to": email.to}))
            })
            .build()
            .unwrap();

        let mut ok = active_job(json!({"to": "a@example.com"}));
        let run = processor.run(&mut ok, JobStatus::Waiting, env()).await;
        assert!(matches!(run, StepRun::Completed(ref v) if v["sent_to"] == "a@example.com"));

        let mut bad = active_job(json!({"to": 7}));
        let run = processor.run(&mut bad, JobStatus::Waiting, env()).await;
        assert!(matches!(run, StepRun::Failed(JobError::InvalidPayload(_))));
    }
}
