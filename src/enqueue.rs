use crate::cache::ResultCache;
use crate::config::QueueConfig;
use crate::errors::EnqueueError;
use crate::request_key::RequestKeyBuilder;
use crate::schema::{CacheEntry, Job, SummaryRequest};
use crate::storage::JobStore;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Result of asking for a summary.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// A live cached summary matched the request; no job was created.
    Cached(CacheEntry),
    /// A job was queued, revived, or an equivalent job already exists.
    Queued(Job),
}

impl EnqueueOutcome {
    /// The job behind this outcome, if one was created or found.
    pub fn job(&self) -> Option<&Job> {
        match self {
            Self::Cached(_) => None,
            Self::Queued(job) => Some(job),
        }
    }

    /// The cached summary, if the request was answered from the cache.
    pub fn cached_summary(&self) -> Option<&str> {
        match self {
            Self::Cached(entry) => Some(&entry.summary_text),
            Self::Queued(_) => None,
        }
    }
}

/// Turns summary requests into jobs.
#[derive(Debug, Clone)]
pub struct Enqueuer {
    store: JobStore,
    cache: ResultCache,
    config: Arc<QueueConfig>,
}

impl Enqueuer {
    /// Create an enqueuer writing to `store` and consulting `cache`.
    pub fn new(store: JobStore, cache: ResultCache, config: Arc<QueueConfig>) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    /// Request a summary of `target_id`.
    ///
    /// Unless `force` is set, a live cache entry for the same metadata, prompt
    /// version and provider answers the request without creating a job.
    /// Otherwise the job is upserted under its request key, so repeating a
    /// request while its job is queued or running returns that job.
    #[instrument(skip(self, input), fields(kind = %self.store.kind()))]
    pub async fn enqueue(
        &self,
        target_id: &str,
        metadata_hash: &str,
        prompt_version: &str,
        force: bool,
        input: Value,
    ) -> Result<EnqueueOutcome, EnqueueError> {
        let request_key = RequestKeyBuilder::new(self.store.kind(), target_id)
            .metadata_hash(metadata_hash)
            .prompt_version(prompt_version)
            .force(force)
            .build();

        if !force {
            let cached = self
                .cache
                .get(
                    target_id,
                    metadata_hash,
                    prompt_version,
                    &self.config.provider,
                )
                .await?;

            if let Some(entry) = cached {
                debug!("Answered from summary cache");
                return Ok(EnqueueOutcome::Cached(entry));
            }
        }

        let payload = serde_json::to_value(SummaryRequest {
            metadata_hash: metadata_hash.to_string(),
            prompt_version: prompt_version.to_string(),
            force,
            input,
        })?;

        let job = self
            .store
            .upsert_queued(
                target_id,
                &request_key,
                self.config.max_attempts,
                &payload,
                self.config.stale_lock(),
            )
            .await?;

        Ok(EnqueueOutcome::Queued(job))
    }
}
