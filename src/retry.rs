//! Retry controller for throttling-class failures.
//!
//! [`with_retry`] wraps any async operation and retries it with bounded
//! exponential backoff when the failure is a rate-limit signal. Every other
//! error propagates on the first occurrence. The controller holds no state
//! between calls; each invocation starts its own attempt counter.
//!
//! # Example
//!
//! ```
//! use llm_docflow::retry::BackoffConfig;
//! use std::time::Duration;
//!
//! let config = BackoffConfig::throttling();
//! assert_eq!(config.delay_for_attempt(0), Duration::from_secs(2));
//! assert_eq!(config.delay_for_attempt(1), Duration::from_secs(3));
//! ```

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

/// Callback invoked before each retry sleep.
///
/// Arguments: `(attempt_number, delay_before_retry, reason_for_retry)`.
pub type RetryCallback<'a> = Option<&'a mut (dyn FnMut(u32, Duration, &str) + Send)>;

/// Backoff parameters for [`with_retry`].
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Total number of calls, including the first. 1 disables retry.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Growth factor applied per retry: initial, initial * m, initial * m^2, ...
    pub multiplier: f64,

    /// Ceiling on any single delay.
    pub max_delay: Duration,

    /// Jitter strategy. Default: none, so sleeps are exactly the computed delay.
    pub jitter: JitterStrategy,

    /// HTTP statuses treated as throttling when they reach the controller
    /// as [`PipelineError::HttpError`]. Default: `[429]`.
    pub retryable_statuses: Vec<u16>,

    /// Prefer the provider's `Retry-After` hint (still capped at `max_delay`).
    pub respect_retry_after: bool,
}

/// Jitter strategy to spread retries of concurrent workers sharing one quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterStrategy {
    /// Delay is exactly the calculated value.
    None,

    /// Random value in `[0, calculated_delay]`.
    Full,

    /// `calculated_delay/2 + random in [0, calculated_delay/2]`.
    Equal,
}

impl BackoffConfig {
    /// Defaults for the hosted generative service: 3 attempts, 2s initial,
    /// 1.5x growth, 10s cap, no jitter.
    pub fn throttling() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            multiplier: 1.5,
            max_delay: Duration::from_secs(10),
            jitter: JitterStrategy::None,
            retryable_statuses: vec![429],
            respect_retry_after: true,
        }
    }

    /// Single attempt, no retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::throttling()
        }
    }

    /// Set the jitter strategy.
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (0-indexed):
    /// `min(initial_delay * multiplier^attempt, max_delay)`, then jittered.
    /// A negative or NaN product counts as zero.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64()).max(0.0);

        let jittered = match self.jitter {
            JitterStrategy::None => capped,
            JitterStrategy::Full => fastrand::f64() * capped,
            JitterStrategy::Equal => capped / 2.0 + fastrand::f64() * (capped / 2.0),
        };

        Duration::from_secs_f64(jittered)
    }

    fn delay_after(&self, attempt: u32, error: &PipelineError) -> Duration {
        let hint = match error {
            PipelineError::Throttling { retry_after, .. } => *retry_after,
            PipelineError::HttpError { retry_after, .. } => *retry_after,
            _ => None,
        };
        match hint {
            Some(ra) if self.respect_retry_after => ra.min(self.max_delay),
            _ => self.delay_for_attempt(attempt),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::throttling()
    }
}

/// Whether an error is a throttling-class signal the controller retries.
///
/// - [`PipelineError::Throttling`] always.
/// - [`PipelineError::HttpError`] with a status in `retryable_statuses`.
/// - Any other error whose message carries one of [`THROTTLING_MARKERS`],
///   which covers capability or transport errors wrapping a provider
///   message.
pub fn is_throttling(error: &PipelineError, config: &BackoffConfig) -> bool {
    match error {
        PipelineError::Throttling { .. } => true,
        PipelineError::HttpError { status, .. } => config.retryable_statuses.contains(status),
        PipelineError::Cancelled => false,
        other => mentions_rate_limit(&other.to_string()),
    }
}

/// Lowercase fragments of provider messages that signal throttling.
/// `throttling` also matches `ThrottlingException`.
pub const THROTTLING_MARKERS: &[&str] = &["throttling", "rate limit", "too many requests", "quota"];

/// Case-insensitive check for provider rate-limit wording.
pub fn mentions_rate_limit(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    THROTTLING_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Run `op` with throttling-aware retry.
///
/// `op` receives the 0-indexed attempt number. Throttling-class failures
/// are retried until `max_attempts` calls have been made; the final
/// throttling error is then returned. Other errors return immediately.
/// Sleeps observe `cancel` and end in [`PipelineError::Cancelled`].
pub async fn with_retry<T, F, Fut>(
    config: &BackoffConfig,
    cancel: Option<&CancellationToken>,
    mut on_retry: RetryCallback<'_>,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(PipelineError::Cancelled);
        }

        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !is_throttling(&error, config) {
            return Err(error);
        }
        if attempt + 1 >= attempts {
            warn!(attempts, error = %error, "throttling retries exhausted");
            return Err(error);
        }

        let delay = config.delay_after(attempt, &error);
        let reason = error.to_string();
        debug!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, %reason, "throttled, backing off");
        if let Some(ref mut cb) = on_retry {
            cb(attempt + 1, delay, &reason);
        }

        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => return Err(PipelineError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => tokio::time::sleep(delay).await,
        }

        attempt += 1;
    }
}
