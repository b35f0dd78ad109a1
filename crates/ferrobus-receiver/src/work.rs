//! Pending work items and their deadlines.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use ferrobus_amqp::message::MessageWithDeliveryTag;
use ferrobus_amqp::outcome::Outcome;

use crate::error::{ReceiverError, Result};

/// Tracks how much of an operation's deadline is left.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimeoutTracker {
    timeout: Duration,
    deadline: Instant,
}

impl TimeoutTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    /// The original timeout this tracker was armed with.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Time left until the deadline, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

/// A receive call that could not be served from the prefetch queue.
pub(crate) struct ReceiveWorkItem {
    id: u64,
    tx: oneshot::Sender<Result<Vec<MessageWithDeliveryTag>>>,
    max_count: u32,
    timeout: TimeoutTracker,
    timer: Option<JoinHandle<()>>,
}

impl ReceiveWorkItem {
    pub fn new(
        id: u64,
        tx: oneshot::Sender<Result<Vec<MessageWithDeliveryTag>>>,
        max_count: u32,
        timeout: Duration,
        timer: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            tx,
            max_count,
            timeout: TimeoutTracker::new(timeout),
            timer: Some(timer),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn max_count(&self) -> u32 {
        self.max_count
    }

    pub fn remaining(&self) -> Duration {
        self.timeout.remaining()
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Fulfills the receive with a batch; an empty batch is a timeout, not an
    /// error.
    pub fn complete(mut self, messages: Vec<MessageWithDeliveryTag>) {
        self.cancel_timer();
        let _ = self.tx.send(Ok(messages));
    }

    pub fn fail(mut self, error: ReceiverError) {
        self.cancel_timer();
        let _ = self.tx.send(Err(error));
    }
}

/// FIFO queue of pending receives; the head is served first.
#[derive(Default)]
pub(crate) struct ReceiveQueue {
    items: VecDeque<ReceiveWorkItem>,
}

impl ReceiveQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, item: ReceiveWorkItem) {
        self.items.push_back(item);
    }

    pub fn pop_front(&mut self) -> Option<ReceiveWorkItem> {
        self.items.pop_front()
    }

    /// Removes a specific item; used by its own timeout timer.
    pub fn remove(&mut self, id: u64) -> Option<ReceiveWorkItem> {
        let index = self.items.iter().position(|item| item.id() == id)?;
        self.items.remove(index)
    }

    pub fn drain(&mut self) -> Vec<ReceiveWorkItem> {
        self.items.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Remaining time of the head receive, if any.
    pub fn head_remaining(&self) -> Option<Duration> {
        self.items.front().map(|item| item.remaining())
    }
}

/// One in-flight disposition, completed when the matching terminal outcome
/// arrives from the broker.
pub(crate) struct UpdateStateWorkItem {
    tx: oneshot::Sender<Result<()>>,
    outcome: Outcome,
    timeout: TimeoutTracker,
    last_error: Option<ReceiverError>,
}

impl std::fmt::Debug for UpdateStateWorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateStateWorkItem")
            .field("outcome", &self.outcome)
            .field("timeout", &self.timeout)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

impl UpdateStateWorkItem {
    pub fn new(tx: oneshot::Sender<Result<()>>, outcome: Outcome, timeout: Duration) -> Self {
        Self {
            tx,
            outcome,
            timeout: TimeoutTracker::new(timeout),
            last_error: None,
        }
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    pub fn timeout(&self) -> &TimeoutTracker {
        &self.timeout
    }

    pub fn set_last_error(&mut self, error: ReceiverError) {
        self.last_error = Some(error);
    }

    pub fn complete(self) {
        let _ = self.tx.send(Ok(()));
    }

    pub fn fail(self, error: ReceiverError) {
        let _ = self.tx.send(Err(error));
    }

    /// Fails with the last broker error seen for this item, or a timeout
    /// error when none was recorded. Used by the reaper.
    pub fn fail_with_timeout(self) {
        let error = match &self.last_error {
            Some(err) => err.clone(),
            None => ReceiverError::Timeout {
                op: "updateState",
                timeout_ms: self.timeout.timeout().as_millis() as u64,
                cause: None,
            },
        };
        self.fail(error);
    }
}
