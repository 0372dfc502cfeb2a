//! Database row types for SQLx.
//!
//! This module contains the persisted shapes of the summary job queue and the
//! summary result cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// Lifecycle state of a summary job.
///
/// ```text
/// queued -> running -> succeeded
///                   -> queued   (retryable failure, attempts left)
///                   -> dead     (retryable failure, attempts exhausted)
///                   -> failed   (terminal failure)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "summary_job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be claimed once `next_run_at` has passed
    Queued,
    /// Claimed by a worker that holds the lock
    Running,
    /// Finished with a summary
    Succeeded,
    /// Gave up after a non-retryable error
    Failed,
    /// Gave up after exhausting `max_attempts`
    Dead,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Queued,
        Self::Running,
        Self::Succeeded,
        Self::Failed,
        Self::Dead,
    ];

    /// Whether the job row will not be picked up again without a re-enqueue.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Dead)
    }

    /// The label stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a summary job record in the database
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct Job {
    /// Unique identifier for the job
    pub id: i64,
    /// Content type the job belongs to (e.g. `bookmark`, `github`)
    pub kind: String,
    /// The content item the summary is for
    pub target_id: String,
    /// Deterministic idempotency key, unique across the table
    pub request_key: String,
    /// Current lifecycle state
    pub status: JobStatus,
    /// Number of times the job has been claimed
    pub attempt_count: i32,
    /// Number of claims allowed before the job is dead-lettered
    pub max_attempts: i32,
    /// The job can only be claimed once this has passed
    pub next_run_at: DateTime<Utc>,
    /// When the current worker claimed the job
    pub locked_at: Option<DateTime<Utc>>,
    /// Identity of the worker holding the claim
    pub locked_by: Option<String>,
    /// Serialized [`SummaryRequest`]
    pub payload: Value,
    /// The summary produced by a successful run
    pub result_summary: Option<String>,
    /// Machine-readable code of the last failure
    pub error_code: Option<String>,
    /// Human-readable message of the last failure
    pub error_message: Option<String>,
    /// Timestamp when the job was created
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last state change
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Decode the [`SummaryRequest`] stored in the payload.
    pub fn request(&self) -> Result<SummaryRequest, serde_json::Error> {
        SummaryRequest::deserialize(&self.payload)
    }

    /// Whether the claim on this job is older than `stale_after`.
    pub fn is_lock_stale(&self, now: DateTime<Utc>, stale_after: std::time::Duration) -> bool {
        let Some(locked_at) = self.locked_at else {
            return false;
        };
        let stale_after = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX);
        self.status == JobStatus::Running && locked_at < now - stale_after
    }
}

/// What the executor needs to produce a summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRequest {
    /// Fingerprint of the content metadata the summary is based on
    pub metadata_hash: String,
    /// Version of the prompt used to generate the summary
    pub prompt_version: String,
    /// Whether the cache was bypassed for this request
    #[serde(default)]
    pub force: bool,
    /// Caller-supplied data, opaque to the queue
    #[serde(default)]
    pub input: Value,
}

/// Represents a cached summary for one target
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct CacheEntry {
    /// Content type the entry belongs to
    pub kind: String,
    /// The content item the summary is for
    pub target_id: String,
    /// Fingerprint of the content metadata the summary is based on
    pub metadata_hash: String,
    /// Version of the prompt used to generate the summary
    pub prompt_version: String,
    /// Name of the summarization backend
    pub provider: String,
    /// The cached summary
    pub summary_text: String,
    /// When the summary was stored
    pub generated_at: DateTime<Utc>,
    /// The entry is only served before this point
    pub expires_at: DateTime<Utc>,
    /// When the last successful summary for this target was produced
    pub last_success_at: DateTime<Utc>,
}
