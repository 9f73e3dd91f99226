//! PostgreSQL job store.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers never block on
//! or double-claim the same row. All time comparisons use the database's
//! `now()`.

use super::DatabasePool;
use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId, JobLog, JobOptions, LockToken};
use crate::status::JobStatus;
use crate::store::{ChildrenState, ClaimedJob, JobPage, JobStore, Lease, QueueStats, StalledReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{FromRow, Postgres};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

macro_rules! job_columns {
    () => {
        "id, queue_name, job_name, payload, options, status, priority, attempts_made, \
         max_attempts, scheduled_for, worker_id, lock_token, lock_expires_at, result, \
         failure_reason, progress, logs, parent_id, stalled_count, created_at, updated_at, \
         processed_on, finished_on"
    };
}

const INSERT_JOB: &str = r#"
    INSERT INTO jobs (id, queue_name, job_name, payload, options, status, priority,
                      attempts_made, max_attempts, scheduled_for, worker_id, lock_token,
                      lock_expires_at, result, failure_reason, progress, logs, parent_id,
                      stalled_count, created_at, updated_at, processed_on, finished_on)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
            $18, $19, $20, $21, $22, $23)
"#;

/// Job store backed by the `jobs` and `queues` tables.
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: Arc<DatabasePool>,
}

impl PostgresJobStore {
    #[must_use]
    pub fn new(pool: Arc<DatabasePool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<DatabasePool> {
        &self.pool
    }
}

/// Database row representation of a job.
#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    queue_name: String,
    job_name: String,
    payload: Value,
    options: Json<JobOptions>,
    status: String,
    priority: i32,
    attempts_made: i32,
    max_attempts: i32,
    scheduled_for: Option<DateTime<Utc>>,
    worker_id: Option<String>,
    lock_token: Option<Uuid>,
    lock_expires_at: Option<DateTime<Utc>>,
    result: Option<Value>,
    failure_reason: Option<String>,
    progress: Option<Value>,
    logs: Json<Vec<JobLog>>,
    parent_id: Option<String>,
    stalled_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    processed_on: Option<DateTime<Utc>>,
    finished_on: Option<DateTime<Utc>>,
}

#[derive(Debug, FromRow)]
struct ClaimRow {
    #[sqlx(flatten)]
    job: JobRow,
    previous_status: String,
}

impl TryFrom<JobRow> for Job {
    type Error = JobError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: JobId::from(row.id),
            queue_name: row.queue_name,
            job_name: row.job_name,
            payload: row.payload,
            options: row.options.0,
            status: row.status.parse()?,
            priority: row.priority,
            attempts_made: to_u32(row.attempts_made, "attempts_made")?,
            max_attempts: to_u32(row.max_attempts, "max_attempts")?,
            scheduled_for: row.scheduled_for,
            worker_id: row.worker_id,
            lock_token: row.lock_token.map(LockToken::from_uuid),
            lock_expires_at: row.lock_expires_at,
            result: row.result,
            failure_reason: row.failure_reason,
            progress: row.progress,
            logs: row.logs.0,
            parent_id: row.parent_id.map(JobId::from),
            stalled_count: to_u32(row.stalled_count, "stalled_count")?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            processed_on: row.processed_on,
            finished_on: row.finished_on,
        })
    }
}

fn to_u32(value: i32, column: &str) -> JobResult<u32> {
    u32::try_from(value)
        .map_err(|_| JobError::Internal(format!("negative {column} in database: {value}")))
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn bind_insert<'q>(
    query: Query<'q, Postgres, PgArguments>,
    job: &'q Job,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(job.id.as_str())
        .bind(&job.queue_name)
        .bind(&job.job_name)
        .bind(&job.payload)
        .bind(Json(&job.options))
        .bind(job.status.as_str())
        .bind(job.priority)
        .bind(to_i32(job.attempts_made))
        .bind(to_i32(job.max_attempts))
        .bind(job.scheduled_for)
        .bind(job.worker_id.as_deref())
        .bind(job.lock_token.map(|t| t.as_uuid()))
        .bind(job.lock_expires_at)
        .bind(job.result.as_ref())
        .bind(job.failure_reason.as_deref())
        .bind(job.progress.as_ref())
        .bind(Json(&job.logs))
        .bind(job.parent_id.as_ref().map(JobId::as_str))
        .bind(to_i32(job.stalled_count))
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.processed_on)
        .bind(job.finished_on)
}

fn insert_error(err: sqlx::Error, job: &Job) -> JobError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return JobError::DuplicateJob(job.id.to_string());
        }
        if db.is_foreign_key_violation() {
            let parent = job.parent_id.as_ref().map(JobId::to_string).unwrap_or_default();
            return JobError::NotFound(parent);
        }
    }
    JobError::Database(err)
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn now(&self) -> JobResult<DateTime<Utc>> {
        let now: DateTime<Utc> = sqlx::query_scalar("SELECT now()")
            .fetch_one(self.pool.inner())
            .await?;
        Ok(now)
    }

    async fn insert(&self, job: &Job) -> JobResult<()> {
        debug!(job_id = %job.id, queue = %job.queue_name, "Inserting job");

        bind_insert(sqlx::query(INSERT_JOB), job)
            .execute(self.pool.inner())
            .await
            .map_err(|e| insert_error(e, job))?;
        Ok(())
    }

    async fn insert_many(&self, jobs: &[Job]) -> JobResult<()> {
        debug!(count = jobs.len(), "Inserting job batch");

        let mut tx = self.pool.inner().begin().await?;
        for job in jobs {
            bind_insert(sqlx::query(INSERT_JOB), job)
                .execute(&mut *tx)
                .await
                .map_err(|e| insert_error(e, job))?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: &JobId) -> JobResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(concat!(
            "SELECT ",
            job_columns!(),
            " FROM jobs WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(self.pool.inner())
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn jobs_by_status(
        &self,
        queue: &str,
        statuses: &[JobStatus],
        page: JobPage,
    ) -> JobResult<Vec<Job>> {
        let sql = if page.ascending {
            concat!(
                "SELECT ",
                job_columns!(),
                " FROM jobs WHERE queue_name = $1 AND status = ANY($2)",
                " ORDER BY created_at ASC, seq ASC OFFSET $3 LIMIT $4"
            )
        } else {
            concat!(
                "SELECT ",
                job_columns!(),
                " FROM jobs WHERE queue_name = $1 AND status = ANY($2)",
                " ORDER BY created_at DESC, seq DESC OFFSET $3 LIMIT $4"
            )
        };
        let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();

        let rows = sqlx::query_as::<_, JobRow>(sql)
            .bind(queue)
            .bind(statuses)
            .bind(to_i64(page.offset))
            .bind(to_i64(page.limit))
            .fetch_all(self.pool.inner())
            .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        lease_duration: Duration,
    ) -> JobResult<Option<ClaimedJob>> {
        let token = LockToken::new();

        let row = sqlx::query_as::<_, ClaimRow>(
            r#"
            WITH candidate AS (
                SELECT j.id, j.status AS previous_status
                FROM jobs j
                WHERE j.queue_name = $1
                  AND NOT EXISTS (SELECT 1 FROM queues q WHERE q.name = $1 AND q.paused)
                  AND (j.lock_expires_at IS NULL OR j.lock_expires_at <= now())
                  AND (
                        (j.status IN ('waiting', 'delayed')
                            AND (j.scheduled_for IS NULL OR j.scheduled_for <= now()))
                     OR (j.status = 'waiting_children'
                            AND (NOT EXISTS (
                                    SELECT 1 FROM jobs c
                                    WHERE c.parent_id = j.id
                                      AND c.status NOT IN ('finished', 'failed', 'cancelled'))
                                 OR EXISTS (
                                    SELECT 1 FROM jobs c
                                    WHERE c.parent_id = j.id
                                      AND c.status IN ('failed', 'cancelled'))))
                  )
                ORDER BY j.priority DESC, j.created_at ASC, j.seq ASC
                LIMIT 1
                FOR UPDATE OF j SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'active',
                worker_id = $2,
                lock_token = $3,
                lock_expires_at = now() + ($4::bigint * interval '1 millisecond'),
                processed_on = now(),
                updated_at = now()
            FROM candidate
            WHERE jobs.id = candidate.id
            RETURNING jobs.*, candidate.previous_status
            "#,
        )
        .bind(queue)
        .bind(worker_id)
        .bind(token.as_uuid())
        .bind(millis(lease_duration))
        .fetch_optional(self.pool.inner())
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let resumed_from: JobStatus = row.previous_status.parse()?;
        let job = Job::try_from(row.job)?;
        let expires_at = job.lock_expires_at.ok_or_else(|| {
            JobError::Internal(format!("claimed job {} has no lease expiry", job.id))
        })?;

        debug!(job_id = %job.id, queue = %queue, worker_id = %worker_id, "Claimed job");

        Ok(Some(ClaimedJob {
            lease: Lease {
                worker_id: worker_id.to_string(),
                token,
                expires_at,
            },
            job,
            resumed_from,
        }))
    }

    async fn save(&self, job: &Job, lease: &Lease) -> JobResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET payload = $4,
                options = $5,
                status = $6,
                priority = $7,
                attempts_made = $8,
                max_attempts = $9,
                scheduled_for = $10,
                worker_id = $11,
                lock_token = $12,
                lock_expires_at = CASE WHEN $6 = 'active' THEN jobs.lock_expires_at ELSE $13 END,
                result = $14,
                failure_reason = $15,
                progress = $16,
                logs = $17,
                stalled_count = $18,
                processed_on = $19,
                finished_on = $20,
                updated_at = now()
            WHERE id = $1
              AND status = 'active'
              AND worker_id = $2
              AND lock_token = $3
              AND lock_expires_at > now()
            "#,
        )
        .bind(job.id.as_str())
        .bind(&lease.worker_id)
        .bind(lease.token.as_uuid())
        .bind(&job.payload)
        .bind(Json(&job.options))
        .bind(job.status.as_str())
        .bind(job.priority)
        .bind(to_i32(job.attempts_made))
        .bind(to_i32(job.max_attempts))
        .bind(job.scheduled_for)
        .bind(job.worker_id.as_deref())
        .bind(job.lock_token.map(|t| t.as_uuid()))
        .bind(job.lock_expires_at)
        .bind(job.result.as_ref())
        .bind(job.failure_reason.as_deref())
        .bind(job.progress.as_ref())
        .bind(Json(&job.logs))
        .bind(to_i32(job.stalled_count))
        .bind(job.processed_on)
        .bind(job.finished_on)
        .execute(self.pool.inner())
        .await?;

        if result.rows_affected() == 0 {
            return Err(JobError::LockLost(job.id.to_string()));
        }
        Ok(())
    }

    async fn extend_lease(
        &self,
        id: &JobId,
        lease: &Lease,
        lease_duration: Duration,
    ) -> JobResult<Lease> {
        let expires_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET lock_expires_at = now() + ($4::bigint * interval '1 millisecond'),
                updated_at = now()
            WHERE id = $1
              AND status = 'active'
              AND worker_id = $2
              AND lock_token = $3
              AND lock_expires_at > now()
            RETURNING lock_expires_at
            "#,
        )
        .bind(id.as_str())
        .bind(&lease.worker_id)
        .bind(lease.token.as_uuid())
        .bind(millis(lease_duration))
        .fetch_optional(self.pool.inner())
        .await?;

        let expires_at = expires_at.ok_or_else(|| JobError::LockLost(id.to_string()))?;
        Ok(Lease {
            expires_at,
            ..lease.clone()
        })
    }

    async fn children(&self, parent: &JobId) -> JobResult<ChildrenState> {
        let (total, outstanding, failed): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE status NOT IN ('finished', 'failed', 'cancelled')),
                   COUNT(*) FILTER (WHERE status IN ('failed', 'cancelled'))
            FROM jobs
            WHERE parent_id = $1
            "#,
        )
        .bind(parent.as_str())
        .fetch_one(self.pool.inner())
        .await?;

        Ok(ChildrenState {
            total: to_u64(total),
            outstanding: to_u64(outstanding),
            failed: to_u64(failed),
        })
    }

    async fn child_jobs(&self, parent: &JobId) -> JobResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(concat!(
            "SELECT ",
            job_columns!(),
            " FROM jobs WHERE parent_id = $1 ORDER BY created_at ASC, seq ASC"
        ))
        .bind(parent.as_str())
        .fetch_all(self.pool.inner())
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn cancel(&self, id: &JobId) -> JobResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled', finished_on = now(), updated_at = now()
            WHERE id = $1 AND status = 'waiting'
            "#,
        )
        .bind(id.as_str())
        .execute(self.pool.inner())
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists: Option<i32> = sqlx::query_scalar("SELECT 1 FROM jobs WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(self.pool.inner())
            .await?;

        match exists {
            Some(_) => Ok(false),
            None => Err(JobError::NotFound(id.to_string())),
        }
    }

    async fn delete(&self, id: &JobId) -> JobResult<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id.as_str())
            .execute(self.pool.inner())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn promote_delayed(&self, queue: &str) -> JobResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'waiting', scheduled_for = NULL, updated_at = now()
            WHERE queue_name = $1
              AND status = 'delayed'
              AND (scheduled_for IS NULL OR scheduled_for <= now())
              AND (lock_expires_at IS NULL OR lock_expires_at <= now())
            "#,
        )
        .bind(queue)
        .execute(self.pool.inner())
        .await?;

        Ok(result.rows_affected())
    }

    async fn recover_stalled(&self, queue: &str) -> JobResult<StalledReport> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            WITH stalled AS (
                SELECT id,
                       stalled_count + 1 AS next_count,
                       COALESCE((options ->> 'max_stalled')::int, 3) AS max_stalled
                FROM jobs
                WHERE queue_name = $1
                  AND status = 'active'
                  AND (lock_expires_at IS NULL OR lock_expires_at <= now())
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET stalled_count = stalled.next_count,
                status = CASE WHEN stalled.next_count > stalled.max_stalled
                              THEN 'failed' ELSE 'delayed' END,
                failure_reason = CASE WHEN stalled.next_count > stalled.max_stalled
                              THEN 'job stalled more than ' || stalled.max_stalled || ' times'
                              ELSE jobs.failure_reason END,
                scheduled_for = CASE WHEN stalled.next_count > stalled.max_stalled
                              THEN jobs.scheduled_for ELSE now() END,
                finished_on = CASE WHEN stalled.next_count > stalled.max_stalled
                              THEN now() ELSE NULL END,
                worker_id = NULL,
                lock_token = NULL,
                lock_expires_at = NULL,
                updated_at = now()
            FROM stalled
            WHERE jobs.id = stalled.id
            RETURNING jobs.id, jobs.status
            "#,
        )
        .bind(queue)
        .fetch_all(self.pool.inner())
        .await?;

        let mut report = StalledReport::default();
        for (id, status) in rows {
            if status == JobStatus::Failed.as_str() {
                report.failed.push(JobId::from(id));
            } else {
                report.recovered.push(JobId::from(id));
            }
        }
        Ok(report)
    }

    async fn stats(&self, queue: &str) -> JobResult<QueueStats> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM jobs WHERE queue_name = $1 GROUP BY status",
        )
        .bind(queue)
        .fetch_all(self.pool.inner())
        .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            stats.record(status.parse()?, to_u64(count));
        }
        Ok(stats)
    }

    async fn set_paused(&self, queue: &str, paused: bool) -> JobResult<()> {
        sqlx::query(
            r#"
            INSERT INTO queues (name, paused, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (name) DO UPDATE SET paused = EXCLUDED.paused, updated_at = now()
            "#,
        )
        .bind(queue)
        .bind(paused)
        .execute(self.pool.inner())
        .await?;
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> JobResult<bool> {
        let paused: Option<bool> = sqlx::query_scalar("SELECT paused FROM queues WHERE name = $1")
            .bind(queue)
            .fetch_optional(self.pool.inner())
            .await?;
        Ok(paused.unwrap_or(false))
    }

    async fn clean(
        &self,
        queue: &str,
        grace: Duration,
        limit: usize,
        status: Option<JobStatus>,
    ) -> JobResult<Vec<JobId>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            DELETE FROM jobs
            WHERE id IN (
                SELECT j.id
                FROM jobs j
                WHERE j.queue_name = $1
                  AND j.status IN ('finished', 'failed', 'cancelled')
                  AND ($2::text IS NULL OR j.status = $2)
                  AND j.finished_on + ($3::bigint * interval '1 millisecond') < now()
                  AND NOT EXISTS (
                        SELECT 1 FROM jobs p
                        WHERE p.id = j.parent_id
                          AND p.status NOT IN ('finished', 'failed', 'cancelled'))
                ORDER BY j.finished_on ASC, j.seq ASC
                LIMIT $4
                FOR UPDATE OF j SKIP LOCKED
            )
            RETURNING id
            "#,
        )
        .bind(queue)
        .bind(status.map(|s| s.as_str()))
        .bind(millis(grace))
        .bind(to_i64(limit))
        .fetch_all(self.pool.inner())
        .await?;

        Ok(ids.into_iter().map(JobId::from).collect())
    }
}
