//! Trait seams between the receiver core and the transport.
//!
//! The reactor loop, frame codec, and connection machinery live in the
//! transport; the receiver only needs these interfaces. All `ReceiveLink`
//! methods must be called from the reactor task that owns the link — the
//! transport delivers inbound activity as [`LinkEvent`]s on the channel
//! handed to [`LinkFactory::open_receive_link`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::condition::ErrorCondition;
use crate::error::Result;
use crate::message::{DeliveryTag, Message};
use crate::outcome::Outcome;
use crate::value::ValueMap;

/// Sender-side settle mode of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderSettleMode {
    /// Sender waits for the receiver's disposition.
    Unsettled,
    /// Sender settles before sending; deliveries arrive pre-settled.
    Settled,
    /// Sender may do either per delivery.
    Mixed,
}

/// Receiver-side settle mode of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverSettleMode {
    /// Receiver settles as soon as it issues a disposition.
    First,
    /// Receiver settles only after the sender settles.
    Second,
}

/// The settle mode pair a link is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleModePair {
    /// Sender-side mode.
    pub sender: SenderSettleMode,
    /// Receiver-side mode.
    pub receiver: ReceiverSettleMode,
}

impl SettleModePair {
    /// Peek-lock consumption: unsettled sender, second-settling receiver.
    pub fn peek_lock() -> Self {
        Self {
            sender: SenderSettleMode::Unsettled,
            receiver: ReceiverSettleMode::Second,
        }
    }

    /// Receive-and-delete consumption: deliveries arrive settled.
    pub fn receive_and_delete() -> Self {
        Self {
            sender: SenderSettleMode::Settled,
            receiver: ReceiverSettleMode::First,
        }
    }
}

/// Endpoint state of one side of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Not yet opened.
    Uninitialized,
    /// Open and usable.
    Active,
    /// Closed or detached.
    Closed,
}

/// The source terminus of a link: address plus filter map.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Source {
    /// Node address (entity path).
    pub address: String,
    /// Filter map; session receivers carry the session filter here.
    pub filter: ValueMap,
}

/// Everything needed to open a receive link.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Link name, unique per connection.
    pub name: String,
    /// Source terminus.
    pub source: Source,
    /// Link properties (operation timeout hint, peek mode).
    pub properties: ValueMap,
    /// Settle mode pair.
    pub settle_mode: SettleModePair,
}

/// An inbound link event, produced on the transport side and consumed on the
/// reactor task.
#[derive(Debug)]
pub enum LinkEvent {
    /// The open handshake finished, successfully or not.
    OpenComplete {
        /// Error when the open failed.
        error: Option<ErrorCondition>,
    },
    /// A delivery finished arriving and is ready to read.
    Delivery {
        /// Tag of the delivery.
        tag: DeliveryTag,
        /// Number of payload bytes pending on the link.
        pending: usize,
    },
    /// The remote peer updated the state of a previously seen delivery.
    DispositionUpdate {
        /// Tag of the delivery.
        tag: DeliveryTag,
        /// Terminal outcome, or `None` for a non-terminal state change.
        outcome: Option<Outcome>,
    },
    /// The link closed, locally acknowledged or remotely forced.
    Closed {
        /// Error condition when the close was an error.
        error: Option<ErrorCondition>,
    },
}

/// A link event tagged with the epoch of the link instance that produced it.
/// Re-created links get a new epoch, letting the consumer drop stale events.
#[derive(Debug)]
pub struct LinkEventEnvelope {
    /// Epoch of the producing link instance.
    pub epoch: u64,
    /// The event.
    pub event: LinkEvent,
}

/// Channel on which a link instance reports its events.
pub type LinkEvents = mpsc::UnboundedSender<LinkEventEnvelope>;

/// The receiving half of one link. Not thread-safe by design: owned and
/// driven exclusively by the reactor task.
pub trait ReceiveLink: Send {
    /// The link name.
    fn name(&self) -> &str;
    /// Local endpoint state.
    fn local_state(&self) -> EndpointState;
    /// Remote endpoint state.
    fn remote_state(&self) -> EndpointState;
    /// The source terminus echoed by the remote peer, once open.
    fn remote_source(&self) -> Option<Source>;
    /// Link properties echoed by the remote peer, once open.
    fn remote_properties(&self) -> ValueMap;
    /// Credit currently granted to the peer.
    fn credit(&self) -> u32;
    /// Grants `credit` more deliveries to the peer. `flow(0)` re-sends the
    /// current flow state without granting anything.
    fn flow(&mut self, credit: u32);
    /// Reads the payload of the delivery most recently announced via
    /// [`LinkEvent::Delivery`] into `buf`, returning the bytes copied.
    fn recv(&mut self, buf: &mut [u8]) -> usize;
    /// Advances the link past the current delivery, keeping it unsettled.
    fn advance(&mut self);
    /// Sends a disposition for an unsettled delivery.
    fn disposition(&mut self, tag: &DeliveryTag, outcome: &Outcome);
    /// Settles a delivery, releasing link-side state for it.
    fn settle(&mut self, tag: &DeliveryTag);
    /// Starts the local close handshake.
    fn close(&mut self);
}

/// The paired request/response channel used for management operations.
#[async_trait]
pub trait RequestResponseChannel: Send + Sync {
    /// Sends `request` and waits up to `timeout` for the correlated response.
    async fn request(&self, request: Message, timeout: Duration) -> Result<Message>;
    /// Closes the channel.
    async fn close(&self);
}

/// Factory for links and channels, owned by the connection layer.
#[async_trait]
pub trait LinkFactory: Send + Sync {
    /// Opens a receive link. Construction is synchronous; the open handshake
    /// completes asynchronously via [`LinkEvent::OpenComplete`] on `events`,
    /// tagged with `epoch`.
    fn open_receive_link(
        &self,
        settings: LinkSettings,
        events: LinkEvents,
        epoch: u64,
    ) -> Result<Box<dyn ReceiveLink>>;

    /// Opens (or connects to) the request/response node at `path`.
    async fn open_request_response_channel(
        &self,
        path: &str,
    ) -> Result<Arc<dyn RequestResponseChannel>>;

    /// Container id advertised by the remote peer, when known.
    fn remote_container(&self) -> Option<String>;

    /// Endpoint host, for diagnostics.
    fn endpoint(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settle_mode_presets() {
        let peek = SettleModePair::peek_lock();
        assert_eq!(peek.sender, SenderSettleMode::Unsettled);
        assert_eq!(peek.receiver, ReceiverSettleMode::Second);

        let destructive = SettleModePair::receive_and_delete();
        assert_eq!(destructive.sender, SenderSettleMode::Settled);
        assert_eq!(destructive.receiver, ReceiverSettleMode::First);
    }
}
