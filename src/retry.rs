use crate::config::QueueConfig;
use crate::errors::ExecutorError;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

/// Outcome of classifying an executor failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorClass {
    /// Whether the job should be retried while attempts remain
    pub retryable: bool,
    /// Code recorded in `error_code`
    pub code: &'static str,
}

impl ErrorClass {
    const fn retryable(code: &'static str) -> Self {
        Self {
            retryable: true,
            code,
        }
    }

    const fn terminal(code: &'static str) -> Self {
        Self {
            retryable: false,
            code,
        }
    }
}

/// Code recorded when the executor panicked.
pub const PANIC_CODE: &str = "panic";
/// Code recorded when the executor call exceeded its timeout.
pub const TIMEOUT_CODE: &str = "timeout";

const RETRYABLE_PATTERNS: &[(&str, &str)] = &[
    ("timed out", TIMEOUT_CODE),
    ("timeout", TIMEOUT_CODE),
    ("etimedout", TIMEOUT_CODE),
    ("rate limit", "rate_limited"),
    ("too many requests", "rate_limited"),
    ("connection reset", "network"),
    ("econnreset", "network"),
    ("connection refused", "network"),
    ("econnrefused", "network"),
    ("broken pipe", "network"),
    ("enotfound", "dns"),
    ("eai_again", "dns"),
    ("dns error", "dns"),
    ("failed to lookup address", "dns"),
    ("service unavailable", "upstream_unavailable"),
    ("bad gateway", "upstream_unavailable"),
];

const TERMINAL_PATTERNS: &[(&str, &str)] = &[
    ("invalid api key", "unauthorized"),
    ("invalid credentials", "unauthorized"),
    ("unauthorized", "unauthorized"),
    ("forbidden", "forbidden"),
    ("malformed", "bad_request"),
    ("invalid request", "bad_request"),
    ("bad request", "bad_request"),
    ("not found", "not_found"),
];

/// Decides when and whether a failed job runs again.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    schedule: Vec<Duration>,
    jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

impl RetryPolicy {
    /// Create a policy from an escalating list of delays.
    ///
    /// An empty schedule retries immediately.
    pub fn new(schedule: Vec<Duration>, jitter_ratio: f64) -> Self {
        Self {
            schedule,
            jitter_ratio: jitter_ratio.clamp(0.0, 1.0),
        }
    }

    /// Policy built from the backoff settings of `config`.
    pub fn from_config(config: &QueueConfig) -> Self {
        let schedule = config
            .backoff_schedule_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect();
        Self::new(schedule, config.backoff_jitter_ratio)
    }

    /// Delay before the next attempt, without jitter.
    ///
    /// `attempt_count` is the number of claims made so far; the first failure
    /// uses the first entry of the schedule.
    pub fn base_delay(&self, attempt_count: i32) -> Duration {
        let index = usize::try_from(attempt_count.saturating_sub(1)).unwrap_or(0);
        self.schedule
            .get(index)
            .or_else(|| self.schedule.last())
            .copied()
            .unwrap_or_default()
    }

    /// Delay before the next attempt, with up to `jitter_ratio` of random jitter added.
    pub fn delay(&self, attempt_count: i32) -> Duration {
        let base = self.base_delay(attempt_count);
        let max_jitter = base.mul_f64(self.jitter_ratio);
        if max_jitter.is_zero() {
            return base;
        }

        let jitter_millis = u64::try_from(max_jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        base + Duration::from_millis(random_jitter)
    }

    /// When a job that has been claimed `attempt_count` times may run again.
    pub fn next_run_at(&self, attempt_count: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay(attempt_count))
            .unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Map an executor failure to a retry decision.
    ///
    /// Typed [`ExecutorError`]s anywhere in the error chain win. Otherwise the
    /// message is matched against known transient and permanent failures.
    /// Anything unrecognized is terminal so that unknown errors never retry forever.
    pub fn classify(&self, error: &anyhow::Error) -> ErrorClass {
        if let Some(error) = error.chain().find_map(|e| e.downcast_ref::<ExecutorError>()) {
            return classify_executor_error(error);
        }

        let message = format!("{error:#}").to_lowercase();
        if let Some(status) = find_status_code(&message) {
            return classify_status(status);
        }
        if let Some((_, code)) = RETRYABLE_PATTERNS.iter().find(|(p, _)| message.contains(p)) {
            return ErrorClass::retryable(*code);
        }
        if let Some((_, code)) = TERMINAL_PATTERNS.iter().find(|(p, _)| message.contains(p)) {
            return ErrorClass::terminal(*code);
        }

        ErrorClass::terminal("unclassified")
    }
}

fn classify_executor_error(error: &ExecutorError) -> ErrorClass {
    match error {
        ExecutorError::Http { status, .. } => classify_status(*status),
        ExecutorError::Timeout => ErrorClass::retryable(TIMEOUT_CODE),
        ExecutorError::Network(_) => ErrorClass::retryable("network"),
    }
}

fn classify_status(status: u16) -> ErrorClass {
    match status {
        408 => ErrorClass::retryable(TIMEOUT_CODE),
        429 => ErrorClass::retryable("rate_limited"),
        500..=599 => ErrorClass::retryable("upstream_5xx"),
        401 => ErrorClass::terminal("unauthorized"),
        403 => ErrorClass::terminal("forbidden"),
        404 => ErrorClass::terminal("not_found"),
        400 | 422 => ErrorClass::terminal("bad_request"),
        _ => ErrorClass::terminal("http_error"),
    }
}

// Picks up messages like "status 503" or "HTTP 429" from untyped errors.
fn find_status_code(message: &str) -> Option<u16> {
    ["status code ", "status: ", "status ", "http "]
        .iter()
        .find_map(|prefix| {
            let (_, rest) = message.split_once(prefix)?;
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            let status = digits.parse::<u16>().ok()?;
            (digits.len() == 3 && (400..=599).contains(&status)).then_some(status)
        })
}
