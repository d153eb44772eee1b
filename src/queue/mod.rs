//! Lifecycle managers for point-to-point queues and topic subscriptions.
//!
//! - [`Queue`]: one named queue with competing consumers
//! - [`TopicQueue`]: an exchange plus one bound queue per subscription
//!
//! Both declare what they need on creation, feed deliveries through the
//! incoming pipeline and hand the result to the application handler.

pub mod consumer;
pub mod point;
pub mod topic_queue;

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::bus::BusEvent;
use crate::message::QueueOptions;
use crate::middleware::Pipeline;
use crate::transport::{Channel, QueueDeclare};

pub use consumer::{Cancellation, Handler, Received, handler};
pub use point::Queue;
pub use topic_queue::TopicQueue;

/// Channels and shared state handed to every lifecycle manager.
#[derive(Clone)]
pub struct QueueContext {
    pub listen_channel: Arc<dyn Channel>,
    pub send_channel: Arc<dyn Channel>,
    pub confirm_channel: Option<Arc<dyn Channel>>,
    pub pipeline: Arc<Pipeline>,
    pub events: broadcast::Sender<BusEvent>,
}

pub(crate) fn queue_declare(options: &QueueOptions) -> QueueDeclare {
    QueueDeclare {
        durable: options.durable,
        auto_delete: options.auto_delete,
        exclusive: options.exclusive,
    }
}

pub(crate) fn error_queue_declare(options: &QueueOptions) -> QueueDeclare {
    QueueDeclare {
        auto_delete: options.auto_delete_error_queue,
        ..queue_declare(options)
    }
}
