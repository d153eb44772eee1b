use serde_json::Value;

use crate::utils::Result;

/// Pluggable payload serializer used by queues.
pub trait Codec: Send + Sync + std::fmt::Debug {
    /// MIME type advertised in message properties.
    fn content_type(&self) -> &str;

    fn serialize(&self, value: &Value) -> Result<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Value>;
}

/// The default structured-text codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &str {
        "application/json"
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
