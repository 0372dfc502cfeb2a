use crate::schema::Job;
use std::future::Future;

/// Produces the summary for a claimed job.
///
/// The queue treats the executor as opaque: it is handed the claimed [`Job`]
/// (decode its payload with [`Job::request`]) and returns the summary text.
/// Errors are classified by the [`RetryPolicy`](crate::RetryPolicy); wrap an
/// [`ExecutorError`](crate::ExecutorError) in the returned `anyhow::Error` to
/// make the classification explicit.
///
/// Any `Fn(Job) -> impl Future<Output = anyhow::Result<String>>` closure is an executor.
pub trait Executor: Send + Sync + 'static {
    /// Summarize the content behind `job`.
    fn execute(&self, job: Job) -> impl Future<Output = anyhow::Result<String>> + Send;
}

impl<F, Fut> Executor for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send,
{
    fn execute(&self, job: Job) -> impl Future<Output = anyhow::Result<String>> + Send {
        self(job)
    }
}
