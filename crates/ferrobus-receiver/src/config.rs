//! Receiver configuration.

use std::time::Duration;

use ferrobus_amqp::link::SettleModePair;

use crate::retry::RetryConfig;

/// Options for creating a [`MessageReceiver`](crate::MessageReceiver).
#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    /// Number of messages prefetched ahead of the application; bounds
    /// outstanding link credit.
    pub prefetch_count: u32,
    /// Deadline for open, close, dispositions, and management requests.
    pub operation_timeout: Duration,
    /// Default deadline for `receive` when no explicit timeout is given.
    pub receive_timeout: Duration,
    /// Settle mode pair the link is opened with.
    pub settle_mode: SettleModePair,
    /// Retry behavior for transient failures.
    pub retry: RetryConfig,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            prefetch_count: 100,
            operation_timeout: Duration::from_secs(30),
            receive_timeout: Duration::from_secs(30),
            settle_mode: SettleModePair::peek_lock(),
            retry: RetryConfig::default(),
        }
    }
}

impl ReceiverOptions {
    /// Sets the prefetch count.
    pub fn with_prefetch_count(mut self, prefetch_count: u32) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    /// Sets the operation timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Sets the default receive timeout.
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Sets the settle mode pair.
    pub fn with_settle_mode(mut self, settle_mode: SettleModePair) -> Self {
        self.settle_mode = settle_mode;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let options = ReceiverOptions::default();
        assert_eq!(options.prefetch_count, 100);
        assert_eq!(options.operation_timeout, Duration::from_secs(30));
        assert_eq!(options.receive_timeout, options.operation_timeout);
    }

    #[test]
    fn builders_override_fields() {
        let options = ReceiverOptions::default()
            .with_prefetch_count(10)
            .with_receive_timeout(Duration::from_millis(250));
        assert_eq!(options.prefetch_count, 10);
        assert_eq!(options.receive_timeout, Duration::from_millis(250));
        assert_eq!(options.operation_timeout, Duration::from_secs(30));
    }
}
