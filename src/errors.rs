use thiserror::Error;

/// Errors raised by the job and cache tables.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database could not be reached, or asked for the statement to be retried.
    ///
    /// This is never recorded against a job; the next poll simply tries again.
    #[error("job store unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),

    /// Any other database error.
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    /// The job does not exist.
    #[error("job {0} not found")]
    JobNotFound(i64),

    /// The job is not running under the reporting claim anymore (it was never
    /// claimed, already finished, or recovered and claimed again), so the
    /// outcome was not recorded.
    #[error("job {0} is not running under this claim")]
    NotRunning(i64),
}

impl StoreError {
    /// Whether the operation may succeed if retried on a later poll.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        if is_transient(&error) {
            Self::Unavailable(error)
        } else {
            Self::Database(error)
        }
    }
}

// 40001: serialization_failure, 40P01: deadlock_detected
fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("40001" | "40P01")),
        _ => false,
    }
}

/// Errors raised by the summary cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Entries must expire strictly after they are generated.
    #[error("cache TTL must be at least one millisecond")]
    InvalidTtl,

    /// The underlying table could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for CacheError {
    fn from(error: sqlx::Error) -> Self {
        Self::Store(error.into())
    }
}

/// Error type for job enqueueing operations.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// Failed to serialize the job payload.
    #[error("failed to serialize job payload: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The job table rejected the upsert.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The cache lookup failed.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl From<sqlx::Error> for EnqueueError {
    fn from(error: sqlx::Error) -> Self {
        Self::Store(error.into())
    }
}

/// Errors raised while loading a [`QueueConfig`](crate::QueueConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The TOML document could not be parsed.
    #[error("invalid queue configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// An override variable could not be parsed.
    #[error("invalid value {value:?} for {name}")]
    InvalidVar {
        /// Variable name
        name: String,
        /// Raw value
        value: String,
    },

    /// A setting is outside its allowed range.
    #[error("invalid setting {name}: {reason}")]
    Invalid {
        /// Setting name
        name: &'static str,
        /// What is wrong with it
        reason: &'static str,
    },
}

/// Well-known failures an executor can report.
///
/// Executors return `anyhow::Error`; wrapping one of these variants lets the
/// [`RetryPolicy`](crate::RetryPolicy) classify it without guessing from the message.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The summarization API responded with a non-success status.
    #[error("summarization API returned status {status}: {message}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// The request did not complete in time.
    #[error("summarization request timed out")]
    Timeout,

    /// The request never reached the API (DNS, connection refused or reset).
    #[error("network error: {0}")]
    Network(String),
}

/// Errors reported to a worker's `on_error` callback.
///
/// None of these stop the worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Claiming or recording a job failed; retried on the next poll.
    #[error("job store operation failed: {0}")]
    Store(#[from] StoreError),

    /// Stale lock recovery failed; retried on the next sweep.
    #[error("stale job recovery failed: {0}")]
    Recovery(#[source] StoreError),

    /// The executor failed for a job. The failure has been recorded on the job.
    #[error("job {job_id} failed ({code}): {message}")]
    Job {
        /// The failed job
        job_id: i64,
        /// Classified error code
        code: String,
        /// Error message recorded on the job
        message: String,
        /// Whether the job will be retried
        retryable: bool,
    },

    /// The summary was stored on the job but could not be cached.
    #[error("failed to cache summary for job {job_id}: {source}")]
    Cache {
        /// The succeeded job
        job_id: i64,
        /// Underlying error
        #[source]
        source: CacheError,
    },
}
