use crate::errors::StoreError;
use crate::schema::{Job, JobStatus};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};

macro_rules! job_columns {
    () => {
        "id, kind, target_id, request_key, status, attempt_count, max_attempts, next_run_at, \
         locked_at, locked_by, payload, result_summary, error_code, error_message, created_at, \
         updated_at"
    };
}

/// Error code recorded on jobs whose lock expired.
pub const STALE_LOCK_CODE: &str = "stale_lock";

/// Counts of jobs moved by [`JobStore::recover_stale`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Jobs put back in the queue
    pub requeued: u64,
    /// Jobs dead-lettered because they had no attempts left
    pub dead: u64,
}

impl RecoveryReport {
    /// Total number of recovered jobs.
    pub fn total(&self) -> u64 {
        self.requeued + self.dead
    }
}

/// The `summary_jobs` table, scoped to one job kind.
///
/// Every mutation is a single SQL statement, so a job can never be observed
/// half-updated. Mutual exclusion between workers comes from the row locks taken
/// by [`Self::claim_next`], not from application-level locking.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: PgPool,
    kind: String,
}

impl JobStore {
    /// Create a store for jobs of the given kind.
    pub fn new(pool: PgPool, kind: impl Into<String>) -> Self {
        Self {
            pool,
            kind: kind.into(),
        }
    }

    /// The job kind this store reads and writes.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Inserts a queued job, or revives the existing job with the same request key.
    ///
    /// An existing job is reset to `queued` with no attempts when it is terminal
    /// (`succeeded`, `failed` or `dead`), or `running` with a lock older than
    /// `stale_lock`. A `queued` or freshly locked `running` job is returned
    /// untouched, which makes enqueueing idempotent while a duplicate is pending.
    ///
    /// Callers check the result cache first, so a `succeeded` job only gets here
    /// when its summary is no longer cached or regeneration was forced.
    #[instrument(skip(self, payload), fields(kind = %self.kind))]
    pub async fn upsert_queued(
        &self,
        target_id: &str,
        request_key: &str,
        max_attempts: i32,
        payload: &Value,
        stale_lock: Duration,
    ) -> Result<Job, StoreError> {
        let upserted = sqlx::query_as::<_, Job>(concat!(
            r"
            INSERT INTO summary_jobs AS jobs (kind, target_id, request_key, max_attempts, payload)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (request_key) DO UPDATE SET
                status = 'queued',
                attempt_count = 0,
                max_attempts = EXCLUDED.max_attempts,
                payload = EXCLUDED.payload,
                next_run_at = NOW(),
                locked_at = NULL,
                locked_by = NULL,
                result_summary = NULL,
                error_code = NULL,
                error_message = NULL,
                updated_at = NOW()
            WHERE jobs.status IN ('succeeded', 'failed', 'dead')
               OR (jobs.status = 'running'
                   AND jobs.locked_at < NOW() - ($6::float8 * INTERVAL '1 millisecond'))
            RETURNING ",
            job_columns!()
        ))
        .bind(&self.kind)
        .bind(target_id)
        .bind(request_key)
        .bind(max_attempts)
        .bind(payload)
        .bind(duration_millis(stale_lock))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(job) = upserted {
            debug!(job.id = job.id, "Job queued");
            return Ok(job);
        }

        // The conditional update did not fire: an equivalent job is already
        // queued or running.
        let existing = sqlx::query_as::<_, Job>(concat!(
            "SELECT ",
            job_columns!(),
            " FROM summary_jobs WHERE request_key = $1"
        ))
        .bind(request_key)
        .fetch_one(&self.pool)
        .await?;

        debug!(job.id = existing.id, job.status = %existing.status, "Equivalent job already exists");
        Ok(existing)
    }

    /// Claims the next eligible job for `worker_id`.
    ///
    /// Eligible jobs are `queued` with `next_run_at` in the past, taken in
    /// `(next_run_at, created_at)` order. Rows locked by a concurrent claimer are
    /// skipped, so two callers never receive the same job. Returns `None` when
    /// nothing is eligible.
    #[instrument(skip(self), fields(kind = %self.kind))]
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>, StoreError> {
        let job = sqlx::query_as::<_, Job>(concat!(
            r"
            UPDATE summary_jobs
            SET status = 'running',
                locked_at = NOW(),
                locked_by = $2,
                attempt_count = attempt_count + 1,
                updated_at = NOW()
            WHERE id = (
                SELECT id
                FROM summary_jobs
                WHERE kind = $1
                  AND status = 'queued'
                  AND next_run_at <= NOW()
                ORDER BY next_run_at ASC, created_at ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING ",
            job_columns!()
        ))
        .bind(&self.kind)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    /// Records a successful run and releases the lock.
    ///
    /// `claimed` is the row returned by [`Self::claim_next`]. The outcome is only
    /// recorded while that claim still holds the lock: once the job was
    /// recovered or claimed again, this returns [`StoreError::NotRunning`].
    #[instrument(skip_all, fields(kind = %self.kind, job.id = claimed.id))]
    pub async fn mark_succeeded(&self, claimed: &Job, summary: &str) -> Result<Job, StoreError> {
        let job = sqlx::query_as::<_, Job>(concat!(
            r"
            UPDATE summary_jobs
            SET status = 'succeeded',
                result_summary = $4,
                locked_at = NULL,
                locked_by = NULL,
                error_code = NULL,
                error_message = NULL,
                next_run_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND status = 'running'
              AND locked_by = $2
              AND attempt_count = $3
            RETURNING ",
            job_columns!()
        ))
        .bind(claimed.id)
        .bind(&claimed.locked_by)
        .bind(claimed.attempt_count)
        .bind(summary)
        .fetch_optional(&self.pool)
        .await?;

        match job {
            Some(job) => Ok(job),
            None => Err(self.not_running(claimed.id).await),
        }
    }

    /// Records a failed run of the `claimed` job and releases the lock.
    ///
    /// - retryable with attempts left: back to `queued`, eligible at `next_run_at`
    /// - retryable with no attempts left: `dead`
    /// - not retryable: `failed`, regardless of remaining attempts
    ///
    /// Like [`Self::mark_succeeded`], this only applies while the claim still holds the lock.
    #[instrument(skip_all, fields(kind = %self.kind, job.id = claimed.id))]
    pub async fn mark_failed(
        &self,
        claimed: &Job,
        retryable: bool,
        error_code: &str,
        error_message: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let job = sqlx::query_as::<_, Job>(concat!(
            r"
            UPDATE summary_jobs
            SET status = CASE
                    WHEN NOT $4 THEN 'failed'::summary_job_status
                    WHEN attempt_count < max_attempts THEN 'queued'::summary_job_status
                    ELSE 'dead'::summary_job_status
                END,
                next_run_at = CASE
                    WHEN $4 AND attempt_count < max_attempts THEN $7
                    ELSE next_run_at
                END,
                locked_at = NULL,
                locked_by = NULL,
                error_code = $5,
                error_message = $6,
                updated_at = NOW()
            WHERE id = $1
              AND status = 'running'
              AND locked_by = $2
              AND attempt_count = $3
            RETURNING ",
            job_columns!()
        ))
        .bind(claimed.id)
        .bind(&claimed.locked_by)
        .bind(claimed.attempt_count)
        .bind(retryable)
        .bind(error_code)
        .bind(error_message)
        .bind(next_run_at)
        .fetch_optional(&self.pool)
        .await?;

        match job {
            Some(job) => Ok(job),
            None => Err(self.not_running(claimed.id).await),
        }
    }

    /// Releases jobs whose worker stopped reporting back.
    ///
    /// Every `running` job locked longer than `stale_lock` ago goes back to
    /// `queued` if it has attempts left, or to `dead` otherwise. This is the only
    /// way work held by a crashed worker becomes available again, so a crashed
    /// worker's job is unavailable for up to `stale_lock`.
    #[instrument(skip(self), fields(kind = %self.kind))]
    pub async fn recover_stale(&self, stale_lock: Duration) -> Result<RecoveryReport, StoreError> {
        let statuses = sqlx::query_scalar::<_, JobStatus>(
            r"
            UPDATE summary_jobs
            SET status = CASE
                    WHEN attempt_count < max_attempts THEN 'queued'::summary_job_status
                    ELSE 'dead'::summary_job_status
                END,
                next_run_at = NOW(),
                locked_at = NULL,
                locked_by = NULL,
                error_code = $3,
                error_message = 'lock expired before the worker reported an outcome',
                updated_at = NOW()
            WHERE kind = $1
              AND status = 'running'
              AND locked_at < NOW() - ($2::float8 * INTERVAL '1 millisecond')
            RETURNING status
            ",
        )
        .bind(&self.kind)
        .bind(duration_millis(stale_lock))
        .bind(STALE_LOCK_CODE)
        .fetch_all(&self.pool)
        .await?;

        let mut report = RecoveryReport::default();
        for status in statuses {
            match status {
                JobStatus::Dead => report.dead += 1,
                _ => report.requeued += 1,
            }
        }

        if report.total() > 0 {
            warn!(
                requeued = report.requeued,
                dead = report.dead,
                "Recovered jobs with stale locks"
            );
        }

        Ok(report)
    }

    /// The most recently active job for a target.
    pub async fn get_latest_by_target(&self, target_id: &str) -> Result<Option<Job>, StoreError> {
        let job = sqlx::query_as::<_, Job>(concat!(
            "SELECT ",
            job_columns!(),
            r"
            FROM summary_jobs
            WHERE kind = $1 AND target_id = $2
            ORDER BY updated_at DESC, id DESC
            LIMIT 1
            "
        ))
        .bind(&self.kind)
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    /// Looks up a job by id.
    pub async fn get_job(&self, job_id: i64) -> Result<Option<Job>, StoreError> {
        let job = sqlx::query_as::<_, Job>(concat!(
            "SELECT ",
            job_columns!(),
            " FROM summary_jobs WHERE id = $1 AND kind = $2"
        ))
        .bind(job_id)
        .bind(&self.kind)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    /// Operator retry: puts a `failed` or `dead` job back in the queue with a fresh
    /// attempt budget.
    ///
    /// Returns `None` if the job exists but is in any other state.
    #[instrument(skip(self), fields(kind = %self.kind))]
    pub async fn retry_job(&self, job_id: i64) -> Result<Option<Job>, StoreError> {
        let job = sqlx::query_as::<_, Job>(concat!(
            r"
            UPDATE summary_jobs
            SET status = 'queued',
                attempt_count = 0,
                next_run_at = NOW(),
                locked_at = NULL,
                locked_by = NULL,
                error_code = NULL,
                error_message = NULL,
                updated_at = NOW()
            WHERE id = $1 AND kind = $2 AND status IN ('failed', 'dead')
            RETURNING ",
            job_columns!()
        ))
        .bind(job_id)
        .bind(&self.kind)
        .fetch_optional(&self.pool)
        .await?;

        if job.is_none() && self.get_job(job_id).await?.is_none() {
            return Err(StoreError::JobNotFound(job_id));
        }

        Ok(job)
    }

    /// The number of jobs in each status.
    pub async fn status_counts(&self) -> Result<HashMap<JobStatus, i64>, StoreError> {
        let rows = sqlx::query_as::<_, (JobStatus, i64)>(
            "SELECT status, COUNT(*) FROM summary_jobs WHERE kind = $1 GROUP BY status",
        )
        .bind(&self.kind)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn not_running(&self, job_id: i64) -> StoreError {
        match self.get_job(job_id).await {
            Ok(Some(_)) => StoreError::NotRunning(job_id),
            Ok(None) => StoreError::JobNotFound(job_id),
            Err(error) => error,
        }
    }
}

fn duration_millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
