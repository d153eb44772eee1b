use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::middleware::{MessageContext, Middleware, OutgoingHandler, OutgoingMessage};
use crate::utils::Result;

/// Assigns a `cid` to outgoing object payloads that do not carry one.
#[derive(Debug, Clone, Copy, Default)]
pub struct Correlate;

pub fn correlate() -> Middleware {
    Middleware::new().with_outgoing(Correlate)
}

#[async_trait]
impl OutgoingHandler for Correlate {
    async fn handle_outgoing(
        &self,
        _ctx: &mut MessageContext,
        mut outgoing: OutgoingMessage,
    ) -> Result<OutgoingMessage> {
        if let Value::Object(content) = &mut outgoing.content {
            let missing = match content.get("cid") {
                None | Some(Value::Null) => true,
                Some(Value::String(cid)) => cid.is_empty(),
                Some(_) => false,
            };
            if missing {
                content.insert("cid".to_string(), Value::String(Uuid::new_v4().to_string()));
            }
        }
        Ok(outgoing)
    }
}
