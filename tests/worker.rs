#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use chrono::Utc;
use claims::{assert_matches, assert_none, assert_some};
use serde_json::json;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use summary_queue::{
    BOOKMARK_KIND, EnqueueOutcome, ExecutorError, Job, JobStatus, PANIC_CODE, PollOutcome,
    QueueConfig, STALE_LOCK_CODE, SummaryQueue, TIMEOUT_CODE, WorkerError,
};
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::Barrier;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use summary_queue::setup_database;
    use testcontainers::runners::AsyncRunner;

    /// Set up a test database with `TestContainers` and return the pool and container
    pub(super) async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let container = Postgres::default().start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&connection_string).await?;
        setup_database(&pool).await?;

        Ok((pool, container))
    }

    /// A bookmark queue with fast polling and deterministic backoff
    pub(super) fn create_queue(pool: &PgPool) -> SummaryQueue {
        let config = QueueConfig {
            max_attempts: 3,
            poll_interval_ms: 50,
            poll_jitter_ms: 0,
            execution_timeout_ms: 5_000,
            backoff_jitter_ratio: 0.0,
            ..QueueConfig::default()
        };
        SummaryQueue::new(pool.clone(), BOOKMARK_KIND, config)
    }

    /// Enqueue a summary request for `target_id` and return its job
    pub(super) async fn enqueue(queue: &SummaryQueue, target_id: &str) -> anyhow::Result<Job> {
        let outcome = queue
            .enqueue(target_id, "meta-1", "v1", false, json!({"url": target_id}))
            .await?;
        Ok(assert_some!(outcome.job().cloned()))
    }

    /// Poll the job table until the latest job of `target_id` reaches `status`
    pub(super) async fn wait_for_status(
        queue: &SummaryQueue,
        target_id: &str,
        status: JobStatus,
    ) -> anyhow::Result<Job> {
        let wait = async {
            loop {
                if let Some(job) = queue.get_status(target_id).await? {
                    if job.status == status {
                        return Ok::<_, anyhow::Error>(job);
                    }
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait).await?
    }
}

async fn summarize(job: Job) -> anyhow::Result<String> {
    let request = job.request()?;
    Ok(format!(
        "Summary of {} ({})",
        job.target_id, request.metadata_hash
    ))
}

async fn overloaded(_job: Job) -> anyhow::Result<String> {
    Err(ExecutorError::Http {
        status: 503,
        message: "overloaded".into(),
    }
    .into())
}

async fn unauthorized(_job: Job) -> anyhow::Result<String> {
    Err(ExecutorError::Http {
        status: 401,
        message: "invalid API key".into(),
    }
    .into())
}

async fn explode(_job: Job) -> anyhow::Result<String> {
    panic!("summarizer exploded")
}

async fn hang(_job: Job) -> anyhow::Result<String> {
    tokio::time::sleep(Duration::from_secs(30)).await;
    Ok("too late".into())
}

#[tokio::test]
async fn successful_job_is_recorded_and_cached() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = test_utils::create_queue(&pool);

    let job = test_utils::enqueue(&queue, "t-1").await?;

    let worker = queue.start_worker(
        queue.worker_options("worker-1").shutdown_when_queue_empty(),
        summarize,
    );
    worker.wait_for_shutdown().await;

    let finished = assert_some!(queue.store().get_job(job.id).await?);
    assert_eq!(finished.status, JobStatus::Succeeded);
    assert_eq!(finished.attempt_count, 1);
    assert_eq!(finished.result_summary.as_deref(), Some("Summary of t-1 (meta-1)"));
    assert_none!(finished.locked_at);
    assert_none!(finished.locked_by);

    let entry = assert_some!(queue.cache().get("t-1", "meta-1", "v1", "default").await?);
    assert_eq!(entry.summary_text, "Summary of t-1 (meta-1)");

    // The next identical request is answered from the cache
    let outcome = queue
        .enqueue("t-1", "meta-1", "v1", false, json!({}))
        .await?;
    assert_matches!(outcome, EnqueueOutcome::Cached(_));

    Ok(())
}

#[tokio::test]
async fn retryable_failure_is_rescheduled() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = test_utils::create_queue(&pool);
    let reported = Arc::new(Mutex::new(Vec::new()));

    let job = test_utils::enqueue(&queue, "t-1").await?;
    let before = Utc::now();

    let options = queue
        .worker_options("worker-1")
        .shutdown_when_queue_empty()
        .on_error({
            let reported = reported.clone();
            move |error: &WorkerError| {
                if let WorkerError::Job {
                    code, retryable, ..
                } = error
                {
                    reported.lock().unwrap().push((code.clone(), *retryable));
                }
            }
        });
    queue.start_worker(options, overloaded).wait_for_shutdown().await;

    let requeued = assert_some!(queue.store().get_job(job.id).await?);
    assert_eq!(requeued.status, JobStatus::Queued);
    assert_eq!(requeued.attempt_count, 1);
    assert_eq!(requeued.error_code.as_deref(), Some("upstream_5xx"));
    assert_some!(requeued.error_message.as_deref().filter(|m| m.contains("overloaded")));
    assert!(requeued.next_run_at >= before + chrono::Duration::seconds(30));
    assert_none!(requeued.locked_by);

    assert_eq!(
        *reported.lock().unwrap(),
        vec![("upstream_5xx".to_string(), true)]
    );

    Ok(())
}

#[tokio::test]
async fn terminal_failure_fails_the_job() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = test_utils::create_queue(&pool);

    let job = test_utils::enqueue(&queue, "t-1").await?;
    queue
        .start_worker(
            queue.worker_options("worker-1").shutdown_when_queue_empty(),
            unauthorized,
        )
        .wait_for_shutdown()
        .await;

    let failed = assert_some!(queue.store().get_job(job.id).await?);
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempt_count, 1);
    assert_eq!(failed.error_code.as_deref(), Some("unauthorized"));
    assert_none!(queue.cache().get("t-1", "meta-1", "v1", "default").await?);

    Ok(())
}

#[tokio::test]
async fn unclassified_error_fails_the_job() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = test_utils::create_queue(&pool);

    let job = test_utils::enqueue(&queue, "t-1").await?;
    let executor = |_job: Job| async move {
        Err::<String, _>(anyhow::anyhow!("summary came back empty"))
    };
    queue
        .start_worker(
            queue.worker_options("worker-1").shutdown_when_queue_empty(),
            executor,
        )
        .wait_for_shutdown()
        .await;

    let failed = assert_some!(queue.store().get_job(job.id).await?);
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error_code.as_deref(), Some("unclassified"));
    assert_eq!(failed.error_message.as_deref(), Some("summary came back empty"));

    Ok(())
}

#[tokio::test]
async fn panicking_executor_fails_the_job() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = test_utils::create_queue(&pool);

    let job = test_utils::enqueue(&queue, "t-1").await?;
    let worker = queue.start_worker(
        queue.worker_options("worker-1").shutdown_when_queue_empty(),
        explode,
    );
    worker.wait_for_shutdown().await;

    let failed = assert_some!(queue.store().get_job(job.id).await?);
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error_code.as_deref(), Some(PANIC_CODE));
    assert_some!(
        failed
            .error_message
            .as_deref()
            .filter(|m| m.contains("summarizer exploded"))
    );
    assert_none!(failed.locked_at);

    Ok(())
}

#[tokio::test]
async fn executor_timeout_is_retried() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = test_utils::create_queue(&pool);

    let job = test_utils::enqueue(&queue, "t-1").await?;
    let options = queue
        .worker_options("worker-1")
        .execution_timeout(Duration::from_millis(100))
        .shutdown_when_queue_empty();
    queue.start_worker(options, hang).wait_for_shutdown().await;

    let requeued = assert_some!(queue.store().get_job(job.id).await?);
    assert_eq!(requeued.status, JobStatus::Queued);
    assert_eq!(requeued.attempt_count, 1);
    assert_eq!(requeued.error_code.as_deref(), Some(TIMEOUT_CODE));

    Ok(())
}

#[tokio::test]
async fn panicking_error_callback_is_ignored() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = test_utils::create_queue(&pool);
    let calls = Arc::new(AtomicUsize::new(0));

    test_utils::enqueue(&queue, "t-1").await?;
    test_utils::enqueue(&queue, "t-2").await?;

    let options = queue
        .worker_options("worker-1")
        .shutdown_when_queue_empty()
        .on_error({
            let calls = calls.clone();
            move |_error: &WorkerError| {
                calls.fetch_add(1, Ordering::SeqCst);
                panic!("callback exploded");
            }
        });
    let worker = queue.start_worker(options, overloaded);
    worker.wait_for_shutdown().await;

    // Both jobs were still processed
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    for target in ["t-1", "t-2"] {
        let job = assert_some!(queue.get_status(target).await?);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt_count, 1);
    }

    Ok(())
}

#[tokio::test]
async fn overlapping_polls_are_skipped() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = test_utils::create_queue(&pool);
    let started = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));

    test_utils::enqueue(&queue, "t-1").await?;
    test_utils::enqueue(&queue, "t-2").await?;

    let executor = {
        let started = started.clone();
        let release = release.clone();
        move |job: Job| {
            let started = started.clone();
            let release = release.clone();
            async move {
                started.wait().await;
                release.wait().await;
                Ok::<_, anyhow::Error>(format!("summary of {}", job.target_id))
            }
        }
    };
    let worker = Arc::new(queue.worker(queue.worker_options("worker-1"), executor));

    let first_poll = tokio::spawn({
        let worker = worker.clone();
        async move { worker.poll_once().await }
    });

    started.wait().await;
    assert_eq!(worker.poll_once().await?, PollOutcome::Skipped);
    release.wait().await;

    let outcome = first_poll.await??;
    assert_matches!(outcome, PollOutcome::Ran(job) if job.status == JobStatus::Succeeded);

    // The second job is still there for the next poll
    assert_eq!(
        assert_some!(queue.get_status("t-2").await?).status,
        JobStatus::Queued
    );

    Ok(())
}

#[tokio::test]
async fn trigger_wakes_an_idle_worker() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = test_utils::create_queue(&pool);

    let options = queue
        .worker_options("worker-1")
        .poll_interval(Duration::from_secs(3600));
    let worker = queue.start_worker(options, summarize);

    // Let the first poll find the queue empty
    tokio::time::sleep(Duration::from_millis(200)).await;

    test_utils::enqueue(&queue, "t-1").await?;
    worker.trigger();

    let job = test_utils::wait_for_status(&queue, "t-1", JobStatus::Succeeded).await?;
    assert_eq!(job.result_summary.as_deref(), Some("Summary of t-1 (meta-1)"));

    worker.stop();
    worker.wait_for_shutdown().await;

    Ok(())
}

#[tokio::test]
async fn stop_lets_the_running_job_finish() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = test_utils::create_queue(&pool);
    let started = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));

    let job = test_utils::enqueue(&queue, "t-1").await?;
    test_utils::enqueue(&queue, "t-2").await?;

    let executor = {
        let started = started.clone();
        let release = release.clone();
        move |_job: Job| {
            let started = started.clone();
            let release = release.clone();
            async move {
                started.wait().await;
                release.wait().await;
                Ok::<_, anyhow::Error>("done".to_string())
            }
        }
    };
    let worker = queue.start_worker(queue.worker_options("worker-1"), executor);
    assert_eq!(worker.worker_id(), "worker-1");

    started.wait().await;
    worker.stop();
    assert!(!worker.is_finished());
    release.wait().await;

    tokio::time::timeout(Duration::from_secs(10), worker.wait_for_shutdown()).await?;

    let finished = assert_some!(queue.store().get_job(job.id).await?);
    assert_eq!(finished.status, JobStatus::Succeeded);

    // No new job was claimed after the stop
    let untouched = assert_some!(queue.get_status("t-2").await?);
    assert_eq!(untouched.status, JobStatus::Queued);
    assert_eq!(untouched.attempt_count, 0);

    Ok(())
}

#[tokio::test]
async fn worker_recovers_jobs_of_crashed_workers() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = test_utils::create_queue(&pool);

    let job = test_utils::enqueue(&queue, "t-1").await?;
    assert_some!(queue.store().claim_next("crashed-worker").await?);
    sqlx::query("UPDATE summary_jobs SET locked_at = NOW() - INTERVAL '1 hour' WHERE id = $1")
        .bind(job.id)
        .execute(&pool)
        .await?;

    let options = queue
        .worker_options("worker-1")
        .stale_lock(Duration::from_secs(60))
        .recovery_interval(Duration::ZERO)
        .shutdown_when_queue_empty();
    queue.start_worker(options, summarize).wait_for_shutdown().await;

    let finished = assert_some!(queue.store().get_job(job.id).await?);
    assert_eq!(finished.status, JobStatus::Succeeded);
    assert_eq!(finished.attempt_count, 2);
    assert_none!(finished.locked_by);

    Ok(())
}

#[tokio::test]
async fn standalone_sweeper_recovers_stale_jobs() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = test_utils::create_queue(&pool);

    let job = test_utils::enqueue(&queue, "t-1").await?;
    assert_some!(queue.store().claim_next("crashed-worker").await?);
    sqlx::query("UPDATE summary_jobs SET locked_at = NOW() - INTERVAL '1 hour' WHERE id = $1")
        .bind(job.id)
        .execute(&pool)
        .await?;

    let sweeper = queue.spawn_sweeper();
    let recovered = test_utils::wait_for_status(&queue, "t-1", JobStatus::Queued).await?;
    sweeper.abort();

    assert_eq!(recovered.error_code.as_deref(), Some(STALE_LOCK_CODE));
    assert_none!(recovered.locked_by);

    Ok(())
}

#[tokio::test]
async fn concurrent_workers_run_each_job_once() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = test_utils::create_queue(&pool);
    let executed = Arc::new(Mutex::new(Vec::new()));

    for i in 0..20 {
        test_utils::enqueue(&queue, &format!("t-{i}")).await?;
    }

    let workers: Vec<_> = (0..3)
        .map(|i| {
            let executed = executed.clone();
            let executor = move |job: Job| {
                let executed = executed.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    executed.lock().unwrap().push(job.target_id.clone());
                    Ok::<_, anyhow::Error>(format!("summary of {}", job.target_id))
                }
            };
            let options = queue
                .worker_options(format!("worker-{i}"))
                .shutdown_when_queue_empty();
            queue.start_worker(options, executor)
        })
        .collect();

    for worker in workers {
        worker.wait_for_shutdown().await;
    }

    let executed = executed.lock().unwrap().clone();
    let unique: HashSet<_> = executed.iter().collect();
    assert_eq!(executed.len(), 20);
    assert_eq!(unique.len(), 20);

    let counts = queue.status_counts().await?;
    assert_eq!(counts.get(&JobStatus::Succeeded), Some(&20));
    assert_eq!(counts.len(), 1);

    Ok(())
}
