use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use crate::message::content_str;
use crate::middleware::{
    IncomingHandler, IncomingMessage, MessageContext, Middleware, OutgoingHandler,
    OutgoingMessage,
};
use crate::utils::Result;

/// HTTP-date style timestamp used in envelopes.
const DATETIME_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Wraps outgoing payloads as `{data, datetime, type}`; on the way in,
/// the `type` property, when present, overrides the envelope's type.
#[derive(Debug, Clone, Copy, Default)]
pub struct Package;

pub fn package() -> Middleware {
    Middleware::both(Package)
}

#[async_trait]
impl OutgoingHandler for Package {
    async fn handle_outgoing(
        &self,
        _ctx: &mut MessageContext,
        mut outgoing: OutgoingMessage,
    ) -> Result<OutgoingMessage> {
        let datetime = content_str(&outgoing.content, "datetime")
            .unwrap_or_else(|| Utc::now().format(DATETIME_FORMAT).to_string());
        let message_type =
            content_str(&outgoing.content, "type").unwrap_or_else(|| outgoing.target.clone());

        outgoing.content = json!({
            "data": outgoing.content,
            "datetime": datetime,
            "type": message_type,
        });
        Ok(outgoing)
    }
}

#[async_trait]
impl IncomingHandler for Package {
    async fn handle_incoming(
        &self,
        _ctx: &mut MessageContext,
        mut incoming: IncomingMessage,
    ) -> Result<IncomingMessage> {
        if let Some(message_type) = incoming.message.properties.message_type.clone() {
            if let Value::Object(content) = &mut incoming.message.content {
                content.insert("type".to_string(), Value::String(message_type));
            }
        }
        Ok(incoming)
    }
}
