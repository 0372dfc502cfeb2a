#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod cache;
mod config;
mod enqueue;
mod errors;
mod executor;
mod queue;
mod request_key;
mod retry;
/// Database row types.
pub mod schema;
mod storage;
mod sweeper;
mod util;
mod worker;

/// The summary result cache.
pub use self::cache::ResultCache;
/// Queue settings.
pub use self::config::QueueConfig;
/// Enqueueing summary requests.
pub use self::enqueue::{EnqueueOutcome, Enqueuer};
/// Error types.
pub use self::errors::{
    CacheError, ConfigError, EnqueueError, ExecutorError, StoreError, WorkerError,
};
/// The trait implemented by summary generators.
pub use self::executor::Executor;
/// The per-kind queue facade.
pub use self::queue::{BOOKMARK_KIND, GITHUB_KIND, SummaryQueue};
/// Idempotency keys.
pub use self::request_key::RequestKeyBuilder;
/// Backoff and error classification.
pub use self::retry::{ErrorClass, PANIC_CODE, RetryPolicy, TIMEOUT_CODE};
/// Row types most callers need.
pub use self::schema::{CacheEntry, Job, JobStatus, SummaryRequest};
/// The job table.
pub use self::storage::{JobStore, RecoveryReport, STALE_LOCK_CODE};
/// Stale lock recovery.
pub use self::sweeper::RecoverySweeper;
/// Workers.
pub use self::worker::{ErrorCallback, PollOutcome, Worker, WorkerHandle, WorkerOptions};

/// Create the job and cache tables by running the embedded migrations.
pub async fn setup_database(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
