use std::sync::Arc;

use async_trait::async_trait;

use crate::message::Message;
use crate::middleware::{
    ErrorSink, IncomingHandler, IncomingMessage, MessageContext, Middleware,
};
use crate::utils::{BusError, Result};

/// Seeds each incoming message's context.
///
/// The context picks up the delivery's `correlation_id` property, and,
/// when `on_error` is set, handler failures for the message go to that
/// sink instead of the bus error stream.
#[derive(Clone, Default)]
pub struct MessageContextUnit {
    on_error: Option<ErrorSink>,
}

impl MessageContextUnit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_error<F>(mut self, sink: F) -> Self
    where
        F: Fn(&BusError, &Message) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(sink));
        self
    }

    pub fn into_middleware(self) -> Middleware {
        Middleware::new().with_incoming(self)
    }
}

pub fn message_context() -> Middleware {
    MessageContextUnit::new().into_middleware()
}

#[async_trait]
impl IncomingHandler for MessageContextUnit {
    async fn handle_incoming(
        &self,
        ctx: &mut MessageContext,
        incoming: IncomingMessage,
    ) -> Result<IncomingMessage> {
        if let Some(sink) = &self.on_error {
            ctx.set_error_sink(sink.clone());
        }
        if let Some(cid) = &incoming.message.properties.correlation_id {
            ctx.set_correlation_id(cid.clone());
        }
        Ok(incoming)
    }
}
