//! Terminal delivery outcomes.

use serde::{Deserialize, Serialize};

use crate::condition::ErrorCondition;
use crate::value::ValueMap;

/// A terminal outcome conveyed in a disposition frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Delivery was processed; remove the message.
    Accepted,
    /// Delivery was rejected, optionally with an error condition.
    Rejected {
        /// Why the delivery was rejected. The dead-letter flow carries the
        /// dead-letter condition plus reason/description in its info map.
        error: Option<ErrorCondition>,
    },
    /// Delivery was released back to the broker unprocessed.
    Released,
    /// Delivery was not processed; the broker may redeliver with changes.
    Modified {
        /// Count the delivery as a failed attempt.
        delivery_failed: bool,
        /// Do not redeliver on this link (defer).
        undeliverable_here: bool,
        /// Annotations to merge onto the message.
        message_annotations: ValueMap,
    },
}

/// Structural discriminator for [`Outcome`], used to match a remote outcome
/// against the locally intended one without comparing payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeKind {
    /// [`Outcome::Accepted`].
    Accepted,
    /// [`Outcome::Rejected`].
    Rejected,
    /// [`Outcome::Released`].
    Released,
    /// [`Outcome::Modified`].
    Modified,
}

impl Outcome {
    /// The variant discriminator of this outcome.
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Accepted => OutcomeKind::Accepted,
            Outcome::Rejected { .. } => OutcomeKind::Rejected,
            Outcome::Released => OutcomeKind::Released,
            Outcome::Modified { .. } => OutcomeKind::Modified,
        }
    }

    /// An abandon outcome: modified without the defer flag.
    pub fn abandon(message_annotations: ValueMap) -> Self {
        Outcome::Modified {
            delivery_failed: false,
            undeliverable_here: false,
            message_annotations,
        }
    }

    /// A defer outcome: modified with `undeliverable_here` set.
    pub fn defer(message_annotations: ValueMap) -> Self {
        Outcome::Modified {
            delivery_failed: false,
            undeliverable_here: true,
            message_annotations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_ignore_payload_differences() {
        let a = Outcome::Rejected { error: None };
        let b = Outcome::Rejected {
            error: Some(ErrorCondition::new("amqp:internal-error")),
        };
        assert_eq!(a.kind(), b.kind());
        assert_ne!(a.kind(), Outcome::Accepted.kind());
    }

    #[test]
    fn defer_sets_undeliverable_here() {
        match Outcome::defer(ValueMap::new()) {
            Outcome::Modified {
                undeliverable_here, ..
            } => assert!(undeliverable_here),
            other => panic!("unexpected outcome {other:?}"),
        }
        match Outcome::abandon(ValueMap::new()) {
            Outcome::Modified {
                undeliverable_here, ..
            } => assert!(!undeliverable_here),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
