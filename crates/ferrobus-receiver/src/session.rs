//! Session facet of a receiver.

use std::time::SystemTime;

use ferrobus_amqp::constants::{LOCKED_UNTIL_UTC, SESSION_FILTER};
use ferrobus_amqp::link::Source;
use ferrobus_amqp::time::ticks_to_system_time;
use ferrobus_amqp::value::ValueMap;

use crate::error::{ReceiverError, Result};

/// Session state of a receiver. Disabled for plain receivers.
#[derive(Debug, Clone)]
pub(crate) struct SessionState {
    pub enabled: bool,
    pub browsable: bool,
    /// Unset until the remote source echoes the session filter.
    pub id: Option<String>,
    /// `None` means unknown.
    pub locked_until: Option<SystemTime>,
}

impl SessionState {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            browsable: false,
            id: None,
            locked_until: None,
        }
    }

    pub fn new(id: Option<String>, browsable: bool) -> Self {
        Self {
            enabled: true,
            browsable,
            id,
            locked_until: None,
        }
    }

    /// Applies the remote open: the echoed session filter is authoritative
    /// for the session id, and the locked-until property (broker ticks) is
    /// decoded when present. A session receiver whose filter is not echoed
    /// fails the open.
    pub fn confirm_open(
        &mut self,
        remote_source: Option<&Source>,
        remote_properties: &ValueMap,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let echoed = remote_source
            .and_then(|source| source.filter.get(SESSION_FILTER))
            .ok_or(ReceiverError::SessionFilterMissing)?;
        if let Some(id) = echoed.as_str() {
            self.id = Some(id.to_string());
        }

        self.locked_until = remote_properties
            .get(LOCKED_UNTIL_UTC)
            .and_then(|value| value.as_i64())
            .map(ticks_to_system_time);

        Ok(())
    }
}
