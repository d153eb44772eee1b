//! The `message` module defines what travels through the bus.
//!
//! - `Message`: a received message (decoded content, broker delivery fields,
//!   properties and, when acknowledgment is active, a retry handle)
//! - `CallOptions`: the typed per-call options accepted by `send`, `listen`,
//!   `publish` and `subscribe`
//! - `QueueOptions`: call options resolved against the bus settings
//! - `Codec`: the pluggable payload serializer, JSON by default

pub mod codec;
pub mod options;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::middleware::retry::RetryHandle;

pub use codec::{Codec, JsonCodec};
pub use options::{CallOptions, QueueKind, QueueOptions};

/// Broker-assigned metadata for a single delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFields {
    pub delivery_tag: u64,
    pub consumer_tag: String,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

/// Properties set by the publisher and carried with the payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub message_type: Option<String>,
    pub persistent: bool,
    pub headers: Map<String, Value>,
}

/// A message as seen by incoming middleware and application handlers.
#[derive(Debug, Clone)]
pub struct Message {
    /// Decoded payload plus injected fields (`cid`, `type`, `datetime`, `retriesRemaining`)
    pub content: Value,
    pub fields: DeliveryFields,
    pub properties: MessageProperties,
    /// Present only when the retry middleware instrumented this delivery
    pub handle: Option<RetryHandle>,
}

impl Message {
    pub fn new(content: Value, fields: DeliveryFields, properties: MessageProperties) -> Self {
        Self {
            content,
            fields,
            properties,
            handle: None,
        }
    }

    /// The correlation id injected by the correlate middleware, if any.
    pub fn cid(&self) -> Option<String> {
        content_str(&self.content, "cid")
    }

    /// The message type from the content envelope, if any.
    pub fn message_type(&self) -> Option<String> {
        content_str(&self.content, "type")
    }

    pub fn retries_remaining(&self) -> Option<u64> {
        self.content.get("retriesRemaining").and_then(Value::as_u64)
    }
}

/// Read a field of a JSON object as a string, rendering numbers as text.
pub(crate) fn content_str(content: &Value, key: &str) -> Option<String> {
    match content.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests;
