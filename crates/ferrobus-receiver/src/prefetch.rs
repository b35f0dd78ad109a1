//! Prefetch buffer and unsettled-delivery registry.

use std::collections::{HashSet, VecDeque};

use ferrobus_amqp::message::{DeliveryTag, MessageWithDeliveryTag};

/// FIFO buffer of decoded messages awaiting a caller.
#[derive(Default)]
pub(crate) struct PrefetchQueue {
    messages: VecDeque<MessageWithDeliveryTag>,
}

impl PrefetchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: MessageWithDeliveryTag) {
        self.messages.push_back(message);
    }

    pub fn poll(&mut self) -> Option<MessageWithDeliveryTag> {
        self.messages.pop_front()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

/// Delivery tags the link still holds unsettled. Every tag here is either
/// still in the prefetch queue or already handed to the caller and awaiting
/// disposition.
#[derive(Default)]
pub(crate) struct DeliveryRegistry {
    tags: HashSet<DeliveryTag>,
}

impl DeliveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: DeliveryTag) -> bool {
        self.tags.insert(tag)
    }

    pub fn contains(&self, tag: &DeliveryTag) -> bool {
        self.tags.contains(tag)
    }

    pub fn remove(&mut self, tag: &DeliveryTag) -> bool {
        self.tags.remove(tag)
    }

    pub fn clear(&mut self) {
        self.tags.clear();
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }
}
