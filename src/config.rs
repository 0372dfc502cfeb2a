//! Queue settings.
//!
//! Every setting has a default. Settings can be loaded from a TOML document and
//! individually overridden by `SUMMARY_QUEUE_*` environment variables.

use crate::errors::ConfigError;
use serde::Deserialize;
use std::time::Duration;

const ENV_PREFIX: &str = "SUMMARY_QUEUE_";

/// Tunables shared by the enqueuer, the workers and the recovery sweeper.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Version tag of the summarization prompt. Part of the request key and cache match.
    pub prompt_version: String,
    /// Name of the summarization backend. Part of the cache match.
    pub provider: String,
    /// How long a cached summary is served.
    pub cache_ttl_ms: u64,
    /// Claims allowed per job before it is dead-lettered.
    pub max_attempts: i32,
    /// A `running` job whose lock is older than this is presumed abandoned.
    ///
    /// This is also the longest a crashed worker's job stays unavailable.
    pub stale_lock_ms: u64,
    /// Delay between worker polls.
    pub poll_interval_ms: u64,
    /// Maximum random delay added to each poll.
    pub poll_jitter_ms: u64,
    /// Minimum delay between two stale lock sweeps of the same worker.
    pub recovery_interval_ms: u64,
    /// Upper bound on a single executor call.
    pub execution_timeout_ms: u64,
    /// Retry delays, indexed by attempt and clamped to the last entry.
    pub backoff_schedule_ms: Vec<u64>,
    /// Maximum jitter added to a retry delay, as a fraction of that delay.
    pub backoff_jitter_ratio: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            prompt_version: "v1".to_string(),
            provider: "default".to_string(),
            cache_ttl_ms: 7 * 24 * 60 * 60 * 1000,
            max_attempts: 5,
            stale_lock_ms: 15 * 60 * 1000,
            poll_interval_ms: 2_000,
            poll_jitter_ms: 250,
            recovery_interval_ms: 60_000,
            execution_timeout_ms: 120_000,
            backoff_schedule_ms: vec![
                30_000,
                2 * 60_000,
                10 * 60_000,
                60 * 60_000,
                6 * 60 * 60_000,
            ],
            backoff_jitter_ratio: 0.2,
        }
    }
}

impl QueueConfig {
    /// Parse a TOML document. Missing keys use their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `SUMMARY_QUEUE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, keyed by the upper-cased setting name with
    /// the `SUMMARY_QUEUE_` prefix (e.g. `SUMMARY_QUEUE_MAX_ATTEMPTS`).
    ///
    /// `SUMMARY_QUEUE_BACKOFF_SCHEDULE_MS` is a comma-separated list.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let var = |name: &str| {
            let name = format!("{ENV_PREFIX}{name}");
            lookup(&name)
                .filter(|value| !value.trim().is_empty())
                .map(|value| (name, value))
        };

        if let Some((_, value)) = var("PROMPT_VERSION") {
            self.prompt_version = value;
        }
        if let Some((_, value)) = var("PROVIDER") {
            self.provider = value;
        }
        if let Some((name, value)) = var("CACHE_TTL_MS") {
            self.cache_ttl_ms = parse(name, value)?;
        }
        if let Some((name, value)) = var("MAX_ATTEMPTS") {
            self.max_attempts = parse(name, value)?;
        }
        if let Some((name, value)) = var("STALE_LOCK_MS") {
            self.stale_lock_ms = parse(name, value)?;
        }
        if let Some((name, value)) = var("POLL_INTERVAL_MS") {
            self.poll_interval_ms = parse(name, value)?;
        }
        if let Some((name, value)) = var("POLL_JITTER_MS") {
            self.poll_jitter_ms = parse(name, value)?;
        }
        if let Some((name, value)) = var("RECOVERY_INTERVAL_MS") {
            self.recovery_interval_ms = parse(name, value)?;
        }
        if let Some((name, value)) = var("EXECUTION_TIMEOUT_MS") {
            self.execution_timeout_ms = parse(name, value)?;
        }
        if let Some((name, value)) = var("BACKOFF_SCHEDULE_MS") {
            self.backoff_schedule_ms = value
                .split(',')
                .map(|step| parse(name.clone(), step.trim().to_string()))
                .collect::<Result<_, _>>()?;
        }
        if let Some((name, value)) = var("BACKOFF_JITTER_RATIO") {
            self.backoff_jitter_ratio = parse(name, value)?;
        }

        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts < 1 {
            return Err(ConfigError::Invalid {
                name: "max_attempts",
                reason: "must be at least 1",
            });
        }
        if self.cache_ttl_ms == 0 {
            return Err(ConfigError::Invalid {
                name: "cache_ttl_ms",
                reason: "must be greater than zero",
            });
        }
        for (name, value) in [
            ("stale_lock_ms", self.stale_lock_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("execution_timeout_ms", self.execution_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    name,
                    reason: "must be greater than zero",
                });
            }
        }
        if self.backoff_schedule_ms.is_empty() {
            return Err(ConfigError::Invalid {
                name: "backoff_schedule_ms",
                reason: "must contain at least one delay",
            });
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter_ratio) {
            return Err(ConfigError::Invalid {
                name: "backoff_jitter_ratio",
                reason: "must be between 0 and 1",
            });
        }
        Ok(())
    }

    /// See [`Self::cache_ttl_ms`].
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    /// See [`Self::stale_lock_ms`].
    pub fn stale_lock(&self) -> Duration {
        Duration::from_millis(self.stale_lock_ms)
    }

    /// See [`Self::poll_interval_ms`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// See [`Self::poll_jitter_ms`].
    pub fn poll_jitter(&self) -> Duration {
        Duration::from_millis(self.poll_jitter_ms)
    }

    /// See [`Self::recovery_interval_ms`].
    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }

    /// See [`Self::execution_timeout_ms`].
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }
}

fn parse<T: std::str::FromStr>(name: String, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidVar { name, value })
}
