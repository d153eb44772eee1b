//! The `middleware` module holds the bidirectional message pipeline.
//!
//! A [`Middleware`] unit carries an optional incoming and an optional
//! outgoing handler. Outgoing handlers run in registration order before a
//! message is written; incoming handlers run in reverse registration order
//! after a message is read, so paired units wrap and unwrap like a stack.
//!
//! Built-in units:
//! - `correlate`: assigns a `cid` to outgoing messages that lack one
//! - `package`: wraps outgoing payloads in a `{data, datetime, type}` envelope
//! - `message_context`: seeds the per-message context from the delivery
//! - `logger`: logs traffic through `tracing`
//! - `retry`: bounded retry with dead-lettering for acknowledged queues

pub mod context;
pub mod correlate;
pub mod logger;
pub mod message_context;
pub mod package;
pub mod pipeline;
pub mod retry;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::message::{Message, QueueOptions};
use crate::transport::Channel;
use crate::utils::Result;

pub use context::{ErrorSink, MessageContext};
pub use pipeline::Pipeline;

/// A message on its way to the broker.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Logical queue or topic name the caller addressed
    pub target: String,
    pub content: Value,
    pub options: QueueOptions,
}

/// A message on its way from the broker to a handler.
#[derive(Clone)]
pub struct IncomingMessage {
    pub channel: Arc<dyn Channel>,
    pub message: Message,
    pub options: QueueOptions,
}

impl fmt::Debug for IncomingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingMessage")
            .field("message", &self.message)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait OutgoingHandler: Send + Sync {
    async fn handle_outgoing(
        &self,
        ctx: &mut MessageContext,
        outgoing: OutgoingMessage,
    ) -> Result<OutgoingMessage>;
}

#[async_trait]
pub trait IncomingHandler: Send + Sync {
    async fn handle_incoming(
        &self,
        ctx: &mut MessageContext,
        incoming: IncomingMessage,
    ) -> Result<IncomingMessage>;
}

/// A pipeline unit with optional incoming and outgoing capabilities.
#[derive(Clone, Default)]
pub struct Middleware {
    pub incoming: Option<Arc<dyn IncomingHandler>>,
    pub outgoing: Option<Arc<dyn OutgoingHandler>>,
}

impl Middleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_incoming(mut self, handler: impl IncomingHandler + 'static) -> Self {
        self.incoming = Some(Arc::new(handler));
        self
    }

    pub fn with_outgoing(mut self, handler: impl OutgoingHandler + 'static) -> Self {
        self.outgoing = Some(Arc::new(handler));
        self
    }

    /// A unit whose single handler serves both directions.
    pub fn both<H>(handler: H) -> Self
    where
        H: IncomingHandler + OutgoingHandler + 'static,
    {
        let handler = Arc::new(handler);
        Self {
            incoming: Some(handler.clone()),
            outgoing: Some(handler),
        }
    }

    /// Wraps a synchronous closure as an outgoing-only unit.
    pub fn outgoing_fn<F>(f: F) -> Self
    where
        F: Fn(&mut MessageContext, OutgoingMessage) -> Result<OutgoingMessage>
            + Send
            + Sync
            + 'static,
    {
        Self::new().with_outgoing(OutgoingFn(f))
    }

    /// Wraps a synchronous closure as an incoming-only unit.
    pub fn incoming_fn<F>(f: F) -> Self
    where
        F: Fn(&mut MessageContext, IncomingMessage) -> Result<IncomingMessage>
            + Send
            + Sync
            + 'static,
    {
        Self::new().with_incoming(IncomingFn(f))
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Middleware")
            .field("incoming", &self.incoming.is_some())
            .field("outgoing", &self.outgoing.is_some())
            .finish()
    }
}

struct OutgoingFn<F>(F);

#[async_trait]
impl<F> OutgoingHandler for OutgoingFn<F>
where
    F: Fn(&mut MessageContext, OutgoingMessage) -> Result<OutgoingMessage> + Send + Sync,
{
    async fn handle_outgoing(
        &self,
        ctx: &mut MessageContext,
        outgoing: OutgoingMessage,
    ) -> Result<OutgoingMessage> {
        (self.0)(ctx, outgoing)
    }
}

struct IncomingFn<F>(F);

#[async_trait]
impl<F> IncomingHandler for IncomingFn<F>
where
    F: Fn(&mut MessageContext, IncomingMessage) -> Result<IncomingMessage> + Send + Sync,
{
    async fn handle_incoming(
        &self,
        ctx: &mut MessageContext,
        incoming: IncomingMessage,
    ) -> Result<IncomingMessage> {
        (self.0)(ctx, incoming)
    }
}
