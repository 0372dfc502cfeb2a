use crate::cache::ResultCache;
use crate::config::QueueConfig;
use crate::errors::{StoreError, WorkerError};
use crate::executor::Executor;
use crate::retry::{ErrorClass, PANIC_CODE, RetryPolicy, TIMEOUT_CODE};
use crate::schema::Job;
use crate::storage::JobStore;
use crate::sweeper::RecoverySweeper;
use crate::util::{call_ignoring_panics, catch_panic, with_sentry_transaction};
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Instrument, debug, info, info_span, trace, warn};

/// Callback invoked with every error a worker runs into.
///
/// It is for observability only: its return value is ignored and panics are swallowed.
pub type ErrorCallback = Arc<dyn Fn(&WorkerError) + Send + Sync>;

/// Settings of a single worker.
#[derive(Clone)]
pub struct WorkerOptions {
    worker_id: String,
    poll_interval: Duration,
    jitter: Duration,
    stale_lock: Duration,
    recovery_interval: Duration,
    execution_timeout: Duration,
    shutdown_when_queue_empty: bool,
    on_error: Option<ErrorCallback>,
}

impl std::fmt::Debug for WorkerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerOptions")
            .field("worker_id", &self.worker_id)
            .field("poll_interval", &self.poll_interval)
            .field("jitter", &self.jitter)
            .field("stale_lock", &self.stale_lock)
            .field("recovery_interval", &self.recovery_interval)
            .field("execution_timeout", &self.execution_timeout)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .field("on_error", &self.on_error.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

impl WorkerOptions {
    /// Options for the worker named `worker_id`, with timings from `config`.
    pub fn new(worker_id: impl Into<String>, config: &QueueConfig) -> Self {
        Self {
            worker_id: worker_id.into(),
            poll_interval: config.poll_interval(),
            jitter: config.poll_jitter(),
            stale_lock: config.stale_lock(),
            recovery_interval: config.recovery_interval(),
            execution_timeout: config.execution_timeout(),
            shutdown_when_queue_empty: false,
            on_error: None,
        }
    }

    /// Identity recorded in `locked_by` for claimed jobs.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Set how often the worker polls for new jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for jobs simultaneously.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the age after which a `running` job's lock is considered abandoned.
    pub fn stale_lock(mut self, stale_lock: Duration) -> Self {
        self.stale_lock = stale_lock;
        self
    }

    /// Set the minimum delay between two stale lock sweeps of this worker.
    pub fn recovery_interval(mut self, recovery_interval: Duration) -> Self {
        self.recovery_interval = recovery_interval;
        self
    }

    /// Set the upper bound on a single executor call. Exceeding it is a retryable failure.
    pub fn execution_timeout(mut self, execution_timeout: Duration) -> Self {
        self.execution_timeout = execution_timeout;
        self
    }

    /// Stop the worker as soon as a poll finds no eligible job.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Set the callback notified of errors.
    pub fn on_error(mut self, on_error: impl Fn(&WorkerError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(on_error));
        self
    }
}

/// What a single poll did.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Another poll of this worker was still in flight.
    Skipped,
    /// No job was eligible.
    Empty,
    /// A job was executed; this is its state after recording the outcome.
    Ran(Job),
}

struct ExecutionFailure {
    class: ErrorClass,
    message: String,
}

/// Claims and executes jobs one at a time.
pub struct Worker<E> {
    store: JobStore,
    cache: ResultCache,
    config: Arc<QueueConfig>,
    retry_policy: RetryPolicy,
    sweeper: RecoverySweeper,
    executor: E,
    options: WorkerOptions,
    busy: AtomicBool,
}

impl<E> std::fmt::Debug for Worker<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("kind", &self.store.kind())
            .field("options", &self.options)
            .field("busy", &self.busy.load(Ordering::Relaxed))
            .finish()
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<E: Executor> Worker<E> {
    /// Create a worker for the queue behind `store`.
    pub fn new(
        store: JobStore,
        cache: ResultCache,
        config: Arc<QueueConfig>,
        executor: E,
        options: WorkerOptions,
    ) -> Self {
        let sweeper = RecoverySweeper::new(
            store.clone(),
            options.stale_lock,
            options.recovery_interval,
        );
        Self {
            store,
            cache,
            retry_policy: RetryPolicy::from_config(&config),
            config,
            sweeper,
            executor,
            options,
            busy: AtomicBool::new(false),
        }
    }

    /// Run a single poll: sweep stale locks if due, then claim and execute one job.
    ///
    /// Returns [`PollOutcome::Skipped`] without touching the store if a poll of
    /// this worker is already in flight. Store errors are returned and leave
    /// the job state untouched; executor errors are recorded on the job.
    pub async fn poll_once(&self) -> Result<PollOutcome, StoreError> {
        if self.busy.swap(true, Ordering::AcqRel) {
            trace!("Previous poll still in flight, skipping");
            return Ok(PollOutcome::Skipped);
        }
        let _guard = BusyGuard(&self.busy);

        if let Some(Err(error)) = self.sweeper.sweep_if_due().await {
            warn!("Failed to recover stale jobs: {error}");
            self.report(&WorkerError::Recovery(error));
        }

        trace!("Looking for next summary job…");
        let Some(job) = self.store.claim_next(&self.options.worker_id).await? else {
            return Ok(PollOutcome::Empty);
        };

        self.run_job(job).await.map(PollOutcome::Ran)
    }

    async fn run_job(&self, job: Job) -> Result<Job, StoreError> {
        let span = info_span!(
            "job",
            job.id = %job.id,
            job.target = %job.target_id,
            job.attempt = job.attempt_count,
        );
        self.run_and_record(job).instrument(span).await
    }

    async fn run_and_record(&self, claimed: Job) -> Result<Job, StoreError> {
        let job = claimed.clone();

        debug!("Running job…");
        let result = with_sentry_transaction(self.store.kind(), move || self.execute(job)).await;

        match result {
            Ok(summary) => {
                debug!("Recording successful job…");
                let finished = self.store.mark_succeeded(&claimed, &summary).await?;
                self.cache_summary(&finished, &summary).await;
                Ok(finished)
            }
            Err(failure) => {
                let ErrorClass { retryable, code } = failure.class;
                warn!(retryable, code, "Failed to run job: {}", failure.message);

                let next_run_at = self
                    .retry_policy
                    .next_run_at(claimed.attempt_count, Utc::now());
                let finished = self
                    .store
                    .mark_failed(&claimed, retryable, code, &failure.message, next_run_at)
                    .await?;

                self.report(&WorkerError::Job {
                    job_id: claimed.id,
                    code: code.to_string(),
                    message: failure.message,
                    retryable: retryable && !finished.status.is_terminal(),
                });
                Ok(finished)
            }
        }
    }

    async fn execute(&self, job: Job) -> Result<String, ExecutionFailure> {
        let execution = catch_panic(self.executor.execute(job));
        match tokio::time::timeout(self.options.execution_timeout, execution).await {
            Ok(Ok(Ok(summary))) => Ok(summary),
            Ok(Ok(Err(error))) => Err(ExecutionFailure {
                class: self.retry_policy.classify(&error),
                message: format!("{error:#}"),
            }),
            Ok(Err(panic_message)) => Err(ExecutionFailure {
                class: ErrorClass {
                    retryable: false,
                    code: PANIC_CODE,
                },
                message: panic_message,
            }),
            Err(_elapsed) => Err(ExecutionFailure {
                class: ErrorClass {
                    retryable: true,
                    code: TIMEOUT_CODE,
                },
                message: format!(
                    "summary generation timed out after {:?}",
                    self.options.execution_timeout
                ),
            }),
        }
    }

    async fn cache_summary(&self, job: &Job, summary: &str) {
        let request = match job.request() {
            Ok(request) => request,
            Err(error) => {
                warn!("Not caching summary, job payload is not a summary request: {error}");
                return;
            }
        };

        let cached = self
            .cache
            .put(
                &job.target_id,
                &request.metadata_hash,
                &request.prompt_version,
                &self.config.provider,
                summary,
                self.config.cache_ttl(),
            )
            .await;

        if let Err(source) = cached {
            warn!("Failed to cache summary: {source}");
            self.report(&WorkerError::Cache {
                job_id: job.id,
                source,
            });
        }
    }

    fn report(&self, error: &WorkerError) {
        if let Some(on_error) = &self.options.on_error {
            call_ignoring_panics(|| on_error(error));
        }
    }

    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.options.jitter.is_zero() {
            return self.options.poll_interval;
        }

        let jitter_millis = u64::try_from(self.options.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.options.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Poll until stopped, or until the queue is empty if `shutdown_when_queue_empty` is set.
    ///
    /// After a job ran the next poll happens immediately; otherwise the worker
    /// waits for the poll interval or an explicit trigger.
    async fn run(&self, signals: &Signals) {
        while !signals.stopped.load(Ordering::Acquire) {
            match self.poll_once().await {
                Ok(PollOutcome::Ran(_)) => continue,
                Ok(PollOutcome::Empty) if self.options.shutdown_when_queue_empty => {
                    debug!("No pending summary jobs found. Shutting down the worker…");
                    break;
                }
                Ok(PollOutcome::Empty | PollOutcome::Skipped) => {}
                Err(error) => {
                    warn!("Failed to poll for jobs: {error}");
                    self.report(&WorkerError::Store(error));
                }
            }

            let sleep_duration = self.sleep_duration_with_jitter();
            trace!("Polling again in {sleep_duration:?}…");
            tokio::select! {
                () = sleep(sleep_duration) => {}
                () = signals.trigger.notified() => trace!("Poll triggered"),
                () = signals.stop.notified() => {}
            }
        }
    }

    /// Start polling in a background task.
    pub fn start(self) -> WorkerHandle {
        let worker_id = self.options.worker_id.clone();
        let signals = Arc::new(Signals::default());

        info!(worker.name = %worker_id, "Starting worker…");
        let span = info_span!("worker", worker.name = %worker_id, kind = %self.store.kind());
        let task_signals = signals.clone();
        let handle = tokio::spawn(async move { self.run(&task_signals).await }.instrument(span));

        WorkerHandle {
            worker_id,
            signals,
            handle,
        }
    }
}

#[derive(Default)]
struct Signals {
    trigger: Notify,
    stop: Notify,
    stopped: AtomicBool,
}

/// Handle to a running worker.
///
/// Dropping the handle does not stop the worker.
pub struct WorkerHandle {
    worker_id: String,
    signals: Arc<Signals>,
    handle: JoinHandle<()>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("worker_id", &self.worker_id)
            .field("stopped", &self.signals.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

impl WorkerHandle {
    /// The worker's identity.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Poll now instead of waiting for the next interval, e.g. right after an enqueue.
    ///
    /// If the worker is busy, it polls again as soon as the current job finishes.
    pub fn trigger(&self) {
        self.signals.trigger.notify_one();
    }

    /// Stop polling. A job that is already executing is allowed to finish.
    pub fn stop(&self) {
        self.signals.stopped.store(true, Ordering::Release);
        self.signals.stop.notify_one();
    }

    /// Whether the worker task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the worker to shut down.
    pub async fn wait_for_shutdown(self) {
        if let Err(error) = self.handle.await {
            warn!(worker.name = %self.worker_id, %error, "Summary worker task panicked");
        }
    }
}
