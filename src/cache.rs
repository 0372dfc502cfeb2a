use crate::errors::CacheError;
use crate::schema::CacheEntry;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, instrument};

const CACHE_COLUMNS: &str = "kind, target_id, metadata_hash, prompt_version, provider, \
     summary_text, generated_at, expires_at, last_success_at";

/// The `summary_cache` table, scoped to one job kind.
///
/// Holds the most recent successful summary per target. An entry is only served
/// while it has not expired and was produced from the same metadata, prompt
/// version and provider as the request.
#[derive(Debug, Clone)]
pub struct ResultCache {
    pool: PgPool,
    kind: String,
}

impl ResultCache {
    /// Create a cache for summaries of the given kind.
    pub fn new(pool: PgPool, kind: impl Into<String>) -> Self {
        Self {
            pool,
            kind: kind.into(),
        }
    }

    /// Returns the live entry matching the request, if any.
    #[instrument(skip(self), fields(kind = %self.kind))]
    pub async fn get(
        &self,
        target_id: &str,
        metadata_hash: &str,
        prompt_version: &str,
        provider: &str,
    ) -> Result<Option<CacheEntry>, CacheError> {
        let query = format!(
            r"
            SELECT {CACHE_COLUMNS}
            FROM summary_cache
            WHERE kind = $1
              AND target_id = $2
              AND metadata_hash = $3
              AND prompt_version = $4
              AND provider = $5
              AND expires_at > NOW()
            "
        );

        let entry = sqlx::query_as::<_, CacheEntry>(&query)
            .bind(&self.kind)
            .bind(target_id)
            .bind(metadata_hash)
            .bind(prompt_version)
            .bind(provider)
            .fetch_optional(&self.pool)
            .await?;

        debug!(hit = entry.is_some(), "Summary cache lookup");
        Ok(entry)
    }

    /// Stores `summary_text` as the summary of `target_id`, replacing any previous entry.
    ///
    /// Concurrent writers for the same target resolve last-write-wins on
    /// `generated_at`.
    #[instrument(skip(self, summary_text), fields(kind = %self.kind))]
    pub async fn put(
        &self,
        target_id: &str,
        metadata_hash: &str,
        prompt_version: &str,
        provider: &str,
        summary_text: &str,
        ttl: Duration,
    ) -> Result<CacheEntry, CacheError> {
        if ttl < Duration::from_millis(1) {
            return Err(CacheError::InvalidTtl);
        }

        let query = format!(
            r"
            INSERT INTO summary_cache AS cache (
                kind, target_id, metadata_hash, prompt_version, provider,
                summary_text, generated_at, expires_at, last_success_at
            )
            VALUES (
                $1, $2, $3, $4, $5,
                $6, clock_timestamp(), clock_timestamp() + ($7::float8 * INTERVAL '1 millisecond'),
                clock_timestamp()
            )
            ON CONFLICT (kind, target_id) DO UPDATE SET
                metadata_hash = EXCLUDED.metadata_hash,
                prompt_version = EXCLUDED.prompt_version,
                provider = EXCLUDED.provider,
                summary_text = EXCLUDED.summary_text,
                generated_at = EXCLUDED.generated_at,
                expires_at = EXCLUDED.expires_at,
                last_success_at = EXCLUDED.last_success_at
            WHERE cache.generated_at <= EXCLUDED.generated_at
            RETURNING {CACHE_COLUMNS}
            "
        );

        let stored = sqlx::query_as::<_, CacheEntry>(&query)
            .bind(&self.kind)
            .bind(target_id)
            .bind(metadata_hash)
            .bind(prompt_version)
            .bind(provider)
            .bind(summary_text)
            .bind(ttl.as_secs_f64() * 1000.0)
            .fetch_optional(&self.pool)
            .await?;

        match stored {
            Some(entry) => Ok(entry),
            // A newer summary won the race; report what is stored now.
            None => Ok(self.current(target_id).await?),
        }
    }

    /// Removes the entry for a target, returning whether one existed.
    #[instrument(skip(self), fields(kind = %self.kind))]
    pub async fn invalidate(&self, target_id: &str) -> Result<bool, CacheError> {
        let result = sqlx::query("DELETE FROM summary_cache WHERE kind = $1 AND target_id = $2")
            .bind(&self.kind)
            .bind(target_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn current(&self, target_id: &str) -> Result<CacheEntry, sqlx::Error> {
        let query =
            format!("SELECT {CACHE_COLUMNS} FROM summary_cache WHERE kind = $1 AND target_id = $2");
        sqlx::query_as::<_, CacheEntry>(&query)
            .bind(&self.kind)
            .bind(target_id)
            .fetch_one(&self.pool)
            .await
    }
}
