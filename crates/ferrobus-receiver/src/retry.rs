//! Retry policy for transient broker and transport failures.

use std::time::Duration;

use crate::error::ReceiverError;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 10).
    pub max_retries: u32,
    /// Initial backoff duration (default: 100ms).
    pub initial_backoff: Duration,
    /// Maximum backoff duration (default: 30 seconds).
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_multiplier: f64,
    /// Whether to add random jitter to backoff (default: true).
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Decides whether and when a failed operation is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Creates a policy from the given configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the interval to wait before attempt `attempt` (zero-based),
    /// or `None` when the error is not transient, the retry budget is
    /// exhausted, or the remaining time cannot fit another attempt.
    pub fn next_retry_interval(
        &self,
        error: &ReceiverError,
        attempt: u32,
        remaining: Duration,
    ) -> Option<Duration> {
        if !error.is_transient() {
            return None;
        }
        if attempt >= self.config.max_retries {
            return None;
        }
        let backoff = self.compute_backoff(attempt);
        if backoff >= remaining {
            return None;
        }
        Some(backoff)
    }

    /// Computes `initial_backoff * multiplier^attempt`, capped at
    /// `max_backoff`, with optional jitter of up to half the delay.
    fn compute_backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.config.initial_backoff.as_millis() as f64;
        let max_ms = self.config.max_backoff.as_millis() as f64;
        let computed = base_ms * self.config.backoff_multiplier.powi(attempt as i32);
        let capped = computed.min(max_ms) as u64;

        if self.config.jitter {
            Duration::from_millis(capped.saturating_add(simple_jitter(capped / 2)))
        } else {
            Duration::from_millis(capped)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// Cheap jitter from system time entropy.
fn simple_jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    nanos % max_ms
}
