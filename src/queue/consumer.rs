use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::bus::BusEvent;
use crate::message::{Message, QueueOptions};
use crate::middleware::{IncomingMessage, MessageContext, Pipeline};
use crate::transport::{Channel, Consumer, Delivery};
use crate::utils::{BusError, Result};

/// What an application handler receives for each message.
#[derive(Clone)]
pub struct Received {
    /// The message content after incoming middleware
    pub content: Value,
    pub message: Message,
    pub channel: Arc<dyn Channel>,
    /// Context the incoming pipeline built for this message
    pub context: MessageContext,
}

impl fmt::Debug for Received {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Received")
            .field("content", &self.content)
            .field("message", &self.message)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// An application message handler.
pub type Handler = Arc<dyn Fn(Received) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Boxes an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Received) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |received| f(received).boxed())
}

/// Feeds deliveries for one consumer through the incoming pipeline into
/// the application handler.
pub(crate) struct Dispatcher {
    pub options: QueueOptions,
    pub channel: Arc<dyn Channel>,
    pub pipeline: Arc<Pipeline>,
    pub events: broadcast::Sender<BusEvent>,
    pub handler: Handler,
}

#[async_trait]
impl Consumer for Dispatcher {
    async fn deliver(&self, delivery: Option<Delivery>) {
        let Some(delivery) = delivery else {
            debug!(queue = %self.options.queue_name, "consumer cancelled by broker");
            return;
        };

        let mut ctx = MessageContext::for_bus(self.events.clone());
        let content = match self.options.codec.deserialize(&delivery.body) {
            Ok(content) => content,
            Err(err) => {
                warn!(queue = %self.options.queue_name, "Dropping undecodable message: {}", err);
                ctx.emit_error(err);
                return;
            }
        };

        let incoming = IncomingMessage {
            channel: self.channel.clone(),
            message: Message::new(content, delivery.fields, delivery.properties),
            options: self.options.clone(),
        };
        let incoming = match self.pipeline.handle_incoming(&mut ctx, incoming).await {
            Ok(incoming) => incoming,
            Err(err) => {
                ctx.emit_error(err);
                return;
            }
        };

        let message = incoming.message.clone();
        let received = Received {
            content: incoming.message.content.clone(),
            message: incoming.message,
            channel: incoming.channel,
            context: ctx.clone(),
        };
        if let Err(err) = run_handler(&self.handler, received).await {
            ctx.report_handler_error(err, &message);
        }
    }
}

/// Invokes the handler, turning panics into errors.
async fn run_handler(handler: &Handler, received: Received) -> Result<()> {
    let future = std::panic::catch_unwind(AssertUnwindSafe(|| handler(received)))
        .map_err(|panic| BusError::HandlerPanicked(panic_message(panic)))?;
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(|panic| BusError::HandlerPanicked(panic_message(panic)))?
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Debug, Default)]
struct RegistrationState {
    tags: Vec<String>,
    pending: usize,
    cancel_requested: bool,
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancellation {
    /// This many consumers were cancelled
    Cancelled(usize),
    /// Registration is still in flight; it is cancelled once it completes
    Deferred,
    /// Nothing was consuming
    Idle,
}

/// Consumer tags owned by one listener, tolerant of a cancel that arrives
/// before `consume` has returned.
#[derive(Debug, Default)]
pub(crate) struct ConsumerRegistration {
    state: Mutex<RegistrationState>,
}

impl ConsumerRegistration {
    fn state(&self) -> Result<std::sync::MutexGuard<'_, RegistrationState>> {
        self.state
            .lock()
            .map_err(|_| BusError::LockPoisoned("consumer registration"))
    }

    pub fn begin(&self) -> Result<()> {
        self.state()?.pending += 1;
        Ok(())
    }

    pub fn abandon(&self) -> Result<()> {
        let mut state = self.state()?;
        state.pending = state.pending.saturating_sub(1);
        if state.pending == 0 {
            state.cancel_requested = false;
        }
        Ok(())
    }

    /// Records a registered consumer. Returns `false` when a cancel was
    /// requested meanwhile, in which case the consumer has been cancelled.
    pub async fn complete(&self, channel: &dyn Channel, tag: String) -> Result<bool> {
        let cancel = {
            let mut state = self.state()?;
            state.pending = state.pending.saturating_sub(1);
            let cancel = state.cancel_requested;
            if state.pending == 0 {
                state.cancel_requested = false;
            }
            if !cancel {
                state.tags.push(tag.clone());
            }
            cancel
        };
        if cancel {
            debug!(consumer_tag = %tag, "cancelling consumer registered after unlisten");
            channel.cancel(&tag).await?;
        }
        Ok(!cancel)
    }

    pub async fn cancel(&self, channel: &dyn Channel) -> Result<Cancellation> {
        let tags = {
            let mut state = self.state()?;
            if state.tags.is_empty() {
                if state.pending > 0 {
                    state.cancel_requested = true;
                    return Ok(Cancellation::Deferred);
                }
                return Ok(Cancellation::Idle);
            }
            std::mem::take(&mut state.tags)
        };
        for tag in &tags {
            channel.cancel(tag).await?;
        }
        Ok(Cancellation::Cancelled(tags.len()))
    }

    pub fn is_active(&self) -> bool {
        self.state().map(|s| !s.tags.is_empty()).unwrap_or(false)
    }
}
