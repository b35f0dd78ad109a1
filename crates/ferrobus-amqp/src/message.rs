//! Message model and wire helpers.
//!
//! Messages are serialized with bincode at the link boundary; the real frame
//! codec beneath is owned by the transport, so this is the representation
//! the receiver decodes inbound delivery payloads into.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AmqpError, Result};
use crate::value::{Value, ValueMap};

/// The body of a message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Body {
    /// No body.
    #[default]
    Empty,
    /// Opaque data section.
    Data(Bytes),
    /// A single structured value (management bodies are value maps).
    Value(Value),
}

/// A decoded message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Message {
    /// Broker- and client-set annotations.
    pub message_annotations: ValueMap,
    /// Application properties (status codes live here on management responses).
    pub application_properties: ValueMap,
    /// Message body.
    pub body: Body,
}

impl Message {
    /// A message with an opaque data body.
    pub fn with_data(data: impl Into<Bytes>) -> Self {
        Self {
            body: Body::Data(data.into()),
            ..Self::default()
        }
    }

    /// A message whose body is a value map.
    pub fn with_map_body(map: ValueMap) -> Self {
        Self {
            body: Body::Value(Value::Map(map)),
            ..Self::default()
        }
    }

    /// The body as a value map, if it is one.
    pub fn body_map(&self) -> Option<&ValueMap> {
        match &self.body {
            Body::Value(Value::Map(map)) => Some(map),
            _ => None,
        }
    }

    /// An application property by key.
    pub fn application_property(&self, key: &str) -> Option<&Value> {
        self.application_properties.get(key)
    }
}

/// Serialize a message to its wire payload.
pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    bincode::serialize(message).map_err(|e| AmqpError::Serialization(e.to_string()))
}

/// Deserialize a message from its wire payload.
pub fn decode_message(payload: &[u8]) -> Result<Message> {
    bincode::deserialize(payload).map_err(|e| AmqpError::Serialization(e.to_string()))
}

/// An immutable delivery tag, unique within one link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryTag(Bytes);

impl DeliveryTag {
    /// Wraps raw tag bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// The raw tag bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether the tag is empty (settled-by-sender deliveries carry none).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<&[u8]> for DeliveryTag {
    fn from(bytes: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(bytes))
    }
}

/// A message paired with the delivery tag it arrived under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageWithDeliveryTag {
    /// The decoded message.
    pub message: Message,
    /// The tag identifying its delivery on the link.
    pub delivery_tag: DeliveryTag,
}

impl MessageWithDeliveryTag {
    /// Pairs a message with its delivery tag.
    pub fn new(message: Message, delivery_tag: DeliveryTag) -> Self {
        Self {
            message,
            delivery_tag,
        }
    }
}

/// A message paired with the broker lock token that guards it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageWithLockToken {
    /// The decoded message.
    pub message: Message,
    /// Lock token for the management channel; nil when the broker sent none.
    pub lock_token: Uuid,
}

impl MessageWithLockToken {
    /// Pairs a message with its lock token.
    pub fn new(message: Message, lock_token: Uuid) -> Self {
        Self {
            message,
            lock_token,
        }
    }
}
