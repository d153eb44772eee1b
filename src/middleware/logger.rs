use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::message::Message;
use crate::middleware::{
    IncomingHandler, IncomingMessage, MessageContext, Middleware, OutgoingHandler,
    OutgoingMessage,
};
use crate::utils::Result;

type IncomingLogFn = Arc<dyn Fn(&str, &Message) + Send + Sync>;
type OutgoingLogFn = Arc<dyn Fn(&str, &Value, &str) + Send + Sync>;

/// Logs every message in both directions.
///
/// Custom formatting closures receive the label first.
#[derive(Clone)]
pub struct Logger {
    label: String,
    incoming_fn: Option<IncomingLogFn>,
    outgoing_fn: Option<OutgoingLogFn>,
}

impl Default for Logger {
    fn default() -> Self {
        Self {
            label: "servicebus".to_string(),
            incoming_fn: None,
            outgoing_fn: None,
        }
    }
}

impl Logger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn on_incoming<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &Message) + Send + Sync + 'static,
    {
        self.incoming_fn = Some(Arc::new(f));
        self
    }

    pub fn on_outgoing<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &Value, &str) + Send + Sync + 'static,
    {
        self.outgoing_fn = Some(Arc::new(f));
        self
    }

    pub fn into_middleware(self) -> Middleware {
        Middleware::both(self)
    }
}

pub fn logger() -> Middleware {
    Logger::new().into_middleware()
}

#[async_trait]
impl IncomingHandler for Logger {
    async fn handle_incoming(
        &self,
        _ctx: &mut MessageContext,
        incoming: IncomingMessage,
    ) -> Result<IncomingMessage> {
        match &self.incoming_fn {
            Some(f) => f(&self.label, &incoming.message),
            None => info!(
                label = %self.label,
                "received {} via routingKey {}",
                incoming.message.content,
                incoming.message.fields.routing_key
            ),
        }
        Ok(incoming)
    }
}

#[async_trait]
impl OutgoingHandler for Logger {
    async fn handle_outgoing(
        &self,
        _ctx: &mut MessageContext,
        outgoing: OutgoingMessage,
    ) -> Result<OutgoingMessage> {
        match &self.outgoing_fn {
            Some(f) => f(&self.label, &outgoing.content, &outgoing.target),
            None => info!(
                label = %self.label,
                "sending {} to {}",
                outgoing.content,
                outgoing.target
            ),
        }
        Ok(outgoing)
    }
}
