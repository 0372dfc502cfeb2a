use crate::cache::ResultCache;
use crate::config::QueueConfig;
use crate::enqueue::{EnqueueOutcome, Enqueuer};
use crate::errors::{EnqueueError, StoreError};
use crate::executor::Executor;
use crate::schema::{Job, JobStatus};
use crate::storage::JobStore;
use crate::sweeper::RecoverySweeper;
use crate::worker::{Worker, WorkerHandle, WorkerOptions};
use serde_json::Value;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::AbortHandle;

/// Content type tag for bookmark summaries.
pub const BOOKMARK_KIND: &str = "bookmark";
/// Content type tag for GitHub repository summaries.
pub const GITHUB_KIND: &str = "github";

/// The summary job queue of one content kind.
///
/// This is the entry point for callers: it enqueues requests, reports job
/// status and starts workers. Every kind shares the same tables, told apart by
/// the `kind` column.
#[derive(Debug, Clone)]
pub struct SummaryQueue {
    store: JobStore,
    cache: ResultCache,
    enqueuer: Enqueuer,
    config: Arc<QueueConfig>,
}

impl SummaryQueue {
    /// Create the queue for `kind` with the given connection pool and settings.
    pub fn new(connection_pool: PgPool, kind: &str, config: QueueConfig) -> Self {
        let config = Arc::new(config);
        let store = JobStore::new(connection_pool.clone(), kind);
        let cache = ResultCache::new(connection_pool, kind);
        let enqueuer = Enqueuer::new(store.clone(), cache.clone(), config.clone());
        Self {
            store,
            cache,
            enqueuer,
            config,
        }
    }

    /// The content kind of this queue.
    pub fn kind(&self) -> &str {
        self.store.kind()
    }

    /// The queue settings.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// The job table of this queue.
    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// The summary cache of this queue.
    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Request a summary. See [`Enqueuer::enqueue`].
    pub async fn enqueue(
        &self,
        target_id: &str,
        metadata_hash: &str,
        prompt_version: &str,
        force: bool,
        input: Value,
    ) -> Result<EnqueueOutcome, EnqueueError> {
        self.enqueuer
            .enqueue(target_id, metadata_hash, prompt_version, force, input)
            .await
    }

    /// Request a summary with the configured prompt version.
    pub async fn enqueue_current(
        &self,
        target_id: &str,
        metadata_hash: &str,
        force: bool,
        input: Value,
    ) -> Result<EnqueueOutcome, EnqueueError> {
        self.enqueue(
            target_id,
            metadata_hash,
            &self.config.prompt_version,
            force,
            input,
        )
        .await
    }

    /// The most recently active job for a target, for status polling.
    pub async fn get_status(&self, target_id: &str) -> Result<Option<Job>, StoreError> {
        self.store.get_latest_by_target(target_id).await
    }

    /// Put a `failed` or `dead` job back in the queue. See [`JobStore::retry_job`].
    pub async fn retry_job(&self, job_id: i64) -> Result<Option<Job>, StoreError> {
        self.store.retry_job(job_id).await
    }

    /// The number of jobs in each status.
    pub async fn status_counts(&self) -> Result<HashMap<JobStatus, i64>, StoreError> {
        self.store.status_counts().await
    }

    /// Build a worker without starting it, e.g. to drive it with
    /// [`Worker::poll_once`].
    pub fn worker<E: Executor>(&self, options: WorkerOptions, executor: E) -> Worker<E> {
        Worker::new(
            self.store.clone(),
            self.cache.clone(),
            self.config.clone(),
            executor,
            options,
        )
    }

    /// Start a worker that polls this queue in the background.
    pub fn start_worker<E: Executor>(&self, options: WorkerOptions, executor: E) -> WorkerHandle {
        self.worker(options, executor).start()
    }

    /// Default options for a worker of this queue named `worker_id`.
    pub fn worker_options(&self, worker_id: impl Into<String>) -> WorkerOptions {
        WorkerOptions::new(worker_id, &self.config)
    }

    /// Build a stale lock sweeper using the configured threshold and interval.
    pub fn sweeper(&self) -> RecoverySweeper {
        RecoverySweeper::new(
            self.store.clone(),
            self.config.stale_lock(),
            self.config.recovery_interval(),
        )
    }

    /// Run the stale lock sweeper on its own timer, independent of any worker.
    pub fn spawn_sweeper(&self) -> AbortHandle {
        self.sweeper().spawn()
    }
}
