//! Tracker for in-flight disposition requests.
//!
//! The only structure shared between the reactor task (matching inbound
//! terminal outcomes) and the reaper task (expiring overdue items), hence
//! the mutex-guarded map.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use ferrobus_amqp::message::DeliveryTag;
use ferrobus_amqp::outcome::Outcome;

use crate::error::ReceiverError;
use crate::work::UpdateStateWorkItem;

/// Pending update-state operations keyed by delivery tag; at most one per
/// tag.
#[derive(Clone, Default)]
pub(crate) struct DispositionTracker {
    inner: Arc<Mutex<HashMap<DeliveryTag, UpdateStateWorkItem>>>,
}

impl DispositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an item unless one is already pending for the tag, in which
    /// case the new item is handed back.
    pub fn try_insert(
        &self,
        tag: DeliveryTag,
        item: UpdateStateWorkItem,
    ) -> std::result::Result<(), UpdateStateWorkItem> {
        let mut map = self.inner.lock();
        if map.contains_key(&tag) {
            return Err(item);
        }
        map.insert(tag, item);
        Ok(())
    }

    pub fn contains(&self, tag: &DeliveryTag) -> bool {
        self.inner.lock().contains_key(tag)
    }

    /// The outcome the caller intended for `tag`, if an item is pending.
    pub fn intended_outcome(&self, tag: &DeliveryTag) -> Option<Outcome> {
        self.inner.lock().get(tag).map(|item| item.outcome().clone())
    }

    /// Remaining deadline of the pending item for `tag`.
    pub fn remaining(&self, tag: &DeliveryTag) -> Option<std::time::Duration> {
        self.inner.lock().get(tag).map(|item| item.timeout().remaining())
    }

    /// Records the latest broker error on a pending item, returning whether
    /// the item was still present.
    pub fn set_last_error(&self, tag: &DeliveryTag, error: ReceiverError) -> bool {
        match self.inner.lock().get_mut(tag) {
            Some(item) => {
                item.set_last_error(error);
                true
            }
            None => false,
        }
    }

    pub fn take(&self, tag: &DeliveryTag) -> Option<UpdateStateWorkItem> {
        self.inner.lock().remove(tag)
    }

    /// Removes and returns every item whose deadline has passed.
    pub fn take_expired(&self) -> Vec<(DeliveryTag, UpdateStateWorkItem)> {
        let mut map = self.inner.lock();
        let expired: Vec<DeliveryTag> = map
            .iter()
            .filter(|(_, item)| item.timeout().is_expired())
            .map(|(tag, _)| tag.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|tag| map.remove(&tag).map(|item| (tag, item)))
            .collect()
    }

    /// Removes and returns everything, used when the link dies.
    pub fn drain(&self) -> Vec<(DeliveryTag, UpdateStateWorkItem)> {
        self.inner.lock().drain().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}
