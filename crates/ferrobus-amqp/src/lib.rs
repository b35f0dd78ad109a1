#![warn(missing_docs)]

//! AMQP-flavored primitives for the ferrobus broker client.
//!
//! This crate holds the pieces of the protocol surface the receiver core
//! needs without owning the transport itself:
//! - Dynamic value and message model used for filters, link properties,
//!   and management request/response bodies
//! - Delivery outcomes and error conditions
//! - Trait seams for the receive link, link factory, and the paired
//!   request/response channel (implemented by the real transport, and by
//!   the in-memory mock here for tests)
//! - Vendor property constants and broker tick-time conversion

pub mod condition;
pub mod constants;
pub mod error;
pub mod link;
pub mod message;
pub mod mock;
pub mod outcome;
pub mod time;
pub mod value;

pub use condition::ErrorCondition;
pub use error::{AmqpError, Result};
pub use link::{
    EndpointState, LinkEvent, LinkEventEnvelope, LinkEvents, LinkFactory, LinkSettings,
    ReceiveLink, ReceiverSettleMode, RequestResponseChannel, SenderSettleMode, SettleModePair,
    Source,
};
pub use message::{
    decode_message, encode_message, Body, DeliveryTag, Message, MessageWithDeliveryTag,
    MessageWithLockToken,
};
pub use outcome::{Outcome, OutcomeKind};
pub use value::{Value, ValueMap};
