//! Error conditions reported by the peer.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::is_transient_condition;
use crate::value::ValueMap;

/// An error condition carried on a detach, close, or rejected outcome.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorCondition {
    /// Symbolic condition name, e.g. `amqp:link:detach-forced`.
    pub condition: String,
    /// Human-readable description.
    pub description: Option<String>,
    /// Extra key/value context (dead-letter reason, tracking ids).
    pub info: ValueMap,
}

impl ErrorCondition {
    /// Creates a condition with no description or info.
    pub fn new(condition: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            description: None,
            info: ValueMap::new(),
        }
    }

    /// Creates a condition with a description.
    pub fn with_description(condition: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            description: Some(description.into()),
            info: ValueMap::new(),
        }
    }

    /// Attaches an info map.
    pub fn with_info(mut self, info: ValueMap) -> Self {
        self.info = info;
        self
    }

    /// Whether this condition names a transient failure.
    pub fn is_transient(&self) -> bool {
        is_transient_condition(&self.condition)
    }
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(desc) => write!(f, "{}: {}", self.condition, desc),
            None => write!(f, "{}", self.condition),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{CONDITION_NOT_FOUND, CONDITION_SERVER_BUSY};

    #[test]
    fn display_includes_description_when_present() {
        let bare = ErrorCondition::new(CONDITION_NOT_FOUND);
        assert_eq!(bare.to_string(), "amqp:not-found");

        let described = ErrorCondition::with_description(CONDITION_NOT_FOUND, "no such entity");
        assert_eq!(described.to_string(), "amqp:not-found: no such entity");
    }

    #[test]
    fn transience_follows_condition_table() {
        assert!(ErrorCondition::new(CONDITION_SERVER_BUSY).is_transient());
        assert!(!ErrorCondition::new(CONDITION_NOT_FOUND).is_transient());
    }
}
