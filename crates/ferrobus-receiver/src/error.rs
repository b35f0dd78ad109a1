//! Receiver error taxonomy.

use thiserror::Error;

use ferrobus_amqp::condition::ErrorCondition;
use ferrobus_amqp::error::AmqpError;

/// Errors surfaced by receiver operations.
///
/// Errors are `Clone` because a single link failure fans out to every
/// pending work item.
#[derive(Debug, Error, Clone)]
pub enum ReceiverError {
    /// Programmer error on the API surface.
    #[error("invalid argument: {msg}")]
    InvalidArgument {
        /// What was wrong.
        msg: String,
    },

    /// An operation did not complete within its deadline.
    #[error("{op} operation timed out after {timeout_ms}ms")]
    Timeout {
        /// The operation that timed out.
        op: &'static str,
        /// The deadline that elapsed, in milliseconds.
        timeout_ms: u64,
        /// Last known link error, when one was recorded.
        #[source]
        cause: Option<Box<ReceiverError>>,
    },

    /// The broker released the delivery instead of applying the disposition.
    #[error("operation cancelled by the broker: {description}")]
    OperationCancelled {
        /// Broker-provided detail.
        description: String,
    },

    /// A disposition was requested for a tag the link does not hold.
    #[error("delivery not found on the receive link")]
    DeliveryNotFound,

    /// A job could not be submitted to the reactor.
    #[error("{op} failed while dispatching to the reactor")]
    Scheduling {
        /// The operation being dispatched.
        op: &'static str,
    },

    /// The broker or transport reported an error condition.
    #[error("broker error [{condition}]: {description}")]
    Broker {
        /// Symbolic condition.
        condition: String,
        /// Description, possibly empty.
        description: String,
        /// Whether retrying can help.
        transient: bool,
    },

    /// A session receiver opened without the session filter echoed back.
    #[error("session filter not set on the remote source")]
    SessionFilterMissing,

    /// The receiver has been closed.
    #[error("receiver is closed")]
    Closed {
        /// Last known link error, when one was recorded.
        #[source]
        cause: Option<Box<ReceiverError>>,
    },

    /// A payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ReceiverError {
    /// Whether retrying the operation can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ReceiverError::Timeout { .. } => true,
            ReceiverError::Broker { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Shorthand for [`ReceiverError::InvalidArgument`].
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        ReceiverError::InvalidArgument { msg: msg.into() }
    }
}

impl From<ErrorCondition> for ReceiverError {
    fn from(condition: ErrorCondition) -> Self {
        let transient = condition.is_transient();
        ReceiverError::Broker {
            description: condition.description.unwrap_or_default(),
            condition: condition.condition,
            transient,
        }
    }
}

impl From<AmqpError> for ReceiverError {
    fn from(error: AmqpError) -> Self {
        match error {
            AmqpError::Serialization(msg) => ReceiverError::Serialization(msg),
            AmqpError::RequestTimeout { timeout_ms } => ReceiverError::Timeout {
                op: "request",
                timeout_ms,
                cause: None,
            },
            AmqpError::ChannelClosed => ReceiverError::Broker {
                condition: ferrobus_amqp::constants::CONDITION_DETACH_FORCED.into(),
                description: "request/response channel closed".into(),
                transient: true,
            },
            AmqpError::Condition(condition) => condition.into(),
        }
    }
}

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, ReceiverError>;

#[cfg(test)]
mod tests {
    use super::*;
    use ferrobus_amqp::constants::{CONDITION_NOT_FOUND, CONDITION_SERVER_BUSY};

    #[test]
    fn transience_classification() {
        let busy: ReceiverError = ErrorCondition::new(CONDITION_SERVER_BUSY).into();
        assert!(busy.is_transient());

        let missing: ReceiverError = ErrorCondition::new(CONDITION_NOT_FOUND).into();
        assert!(!missing.is_transient());

        assert!(ReceiverError::Timeout {
            op: "receive",
            timeout_ms: 10,
            cause: None
        }
        .is_transient());
        assert!(!ReceiverError::DeliveryNotFound.is_transient());
        assert!(!ReceiverError::Closed { cause: None }.is_transient());
    }

    #[test]
    fn timeout_carries_cause_in_chain() {
        let cause = ReceiverError::Broker {
            condition: CONDITION_SERVER_BUSY.into(),
            description: "busy".into(),
            transient: true,
        };
        let err = ReceiverError::Timeout {
            op: "open",
            timeout_ms: 30_000,
            cause: Some(Box::new(cause)),
        };
        let source = std::error::Error::source(&err).expect("source present");
        assert!(source.to_string().contains("server-busy"));
    }

    #[test]
    fn condition_conversion_keeps_description() {
        let err: ReceiverError =
            ErrorCondition::with_description(CONDITION_NOT_FOUND, "no such queue").into();
        match err {
            ReceiverError::Broker {
                condition,
                description,
                transient,
            } => {
                assert_eq!(condition, CONDITION_NOT_FOUND);
                assert_eq!(description, "no such queue");
                assert!(!transient);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
