//! Error type for the protocol seam.

use thiserror::Error;

use crate::condition::ErrorCondition;

/// Errors surfaced by the link layer and the wire codec.
#[derive(Debug, Error, Clone)]
pub enum AmqpError {
    /// Payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A request on the paired request/response channel did not complete in time.
    #[error("request timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// The channel or link is gone and cannot carry more work.
    #[error("channel closed")]
    ChannelClosed,

    /// The peer reported an error condition.
    #[error("{0}")]
    Condition(ErrorCondition),
}

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, AmqpError>;
