//! The `transport` module abstracts the AMQP-style broker connection.
//!
//! The bus talks to the broker through three traits:
//! - `Transport`: a connection that hands out plain and confirm channels
//!   and broadcasts connection/channel lifecycle events
//! - `Channel`: queue/exchange declaration, publishing, consuming,
//!   acknowledgment and rejection
//! - `Consumer`: the callback side of `Channel::consume`
//!
//! `memory` provides an in-process broker with topic routing, prefetch,
//! requeue-on-reject and auto-delete queues. It backs the test-suite and
//! embedded use.

pub mod memory;
pub mod topic;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::message::{DeliveryFields, MessageProperties};
use crate::utils::Result;

pub use memory::{MemoryBroker, MemoryConnection};

/// Flags used when declaring a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDeclare {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

/// Flags used when declaring an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDeclare {
    pub kind: String,
    pub durable: bool,
    pub auto_delete: bool,
}

/// A raw delivery handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub fields: DeliveryFields,
    pub properties: MessageProperties,
}

/// Lifecycle notifications from the connection and its channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectionClosed,
    ConnectionError(String),
    ChannelClosed { confirm: bool },
    ChannelError { confirm: bool, reason: String },
}

/// Receives deliveries for one consumer tag.
///
/// `None` signals that the broker cancelled the consumer.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn deliver(&self, delivery: Option<Delivery>);
}

#[async_trait]
pub trait Channel: Send + Sync {
    /// Whether publishes on this channel wait for broker confirmation.
    fn is_confirm(&self) -> bool;

    /// Limit unacknowledged deliveries per consumer started after this call.
    async fn prefetch(&self, count: u16) -> Result<()>;

    async fn assert_queue(&self, name: &str, declare: &QueueDeclare) -> Result<()>;

    async fn assert_exchange(&self, name: &str, declare: &ExchangeDeclare) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()>;

    /// Start consuming `queue`, returning the consumer tag.
    async fn consume(&self, queue: &str, no_ack: bool, consumer: Arc<dyn Consumer>)
    -> Result<String>;

    async fn send_to_queue(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()>;

    async fn ack(&self, fields: &DeliveryFields) -> Result<()>;

    async fn reject(&self, fields: &DeliveryFields, requeue: bool) -> Result<()>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn delete_queue(&self, name: &str, if_empty: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// A broker connection.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>>;

    async fn create_confirm_channel(&self) -> Result<Arc<dyn Channel>>;

    /// Subscribe to lifecycle events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    async fn close(&self) -> Result<()>;
}
