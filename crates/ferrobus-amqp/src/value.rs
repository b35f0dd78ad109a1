//! Dynamic value model for filter maps, link properties, and management bodies.
//!
//! The broker protocol carries loosely typed maps in several places: source
//! filters, link properties, message annotations, and the bodies of
//! management requests and responses. `Value` is the small common currency
//! for all of them.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An ordered string-keyed map of values.
pub type ValueMap = BTreeMap<String, Value>;

/// A dynamically typed protocol value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// 32-bit signed integer.
    Int(i32),
    /// 64-bit signed integer.
    Long(i64),
    /// 32-bit unsigned integer.
    UInt(u32),
    /// 64-bit unsigned integer.
    ULong(u64),
    /// UTF-8 string.
    String(String),
    /// Symbolic constant (conditions, property keys).
    Symbol(String),
    /// UUID (lock tokens).
    Uuid(Uuid),
    /// Opaque binary.
    Binary(Bytes),
    /// Milliseconds since the UNIX epoch.
    Timestamp(i64),
    /// Ordered sequence of values.
    Array(Vec<Value>),
    /// Nested map.
    Map(ValueMap),
}

impl Value {
    /// Returns the string content for `String` and `Symbol` values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Symbol(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the boolean content, if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns a signed 64-bit view of any integer variant.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            Value::UInt(v) => Some(i64::from(*v)),
            Value::ULong(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Returns an unsigned 64-bit view of any non-negative integer variant.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Int(v) => u64::try_from(*v).ok(),
            Value::Long(v) => u64::try_from(*v).ok(),
            Value::UInt(v) => Some(u64::from(*v)),
            Value::ULong(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the UUID content, if this is a `Uuid`.
    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    /// Returns the binary content, if this is a `Binary`.
    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the timestamp in epoch milliseconds, if this is a `Timestamp`.
    pub fn as_timestamp(&self) -> Option<i64> {
        match self {
            Value::Timestamp(ms) => Some(*ms),
            _ => None,
        }
    }

    /// Returns the element slice, if this is an `Array`.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the nested map, if this is a `Map`.
    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Returns `true` for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::ULong(v)
    }
}

impl From<Uuid> for Value {
    fn from(u: Uuid) -> Self {
        Value::Uuid(u)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Binary(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<ValueMap> for Value {
    fn from(map: ValueMap) -> Self {
        Value::Map(map)
    }
}
