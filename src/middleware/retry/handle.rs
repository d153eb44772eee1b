use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::bus::BusEvent;
use crate::message::{DeliveryFields, QueueOptions};
use crate::middleware::context::emit_error;
use crate::middleware::retry::CounterStore;
use crate::transport::Channel;
use crate::utils::{BusError, Result};

/// Acknowledgment capability attached to a delivery on an acknowledged queue.
///
/// `ack` may be called once and `reject` at most `max_retries` times per
/// delivery (once when `max_retries` is zero); further calls fail with `HandleAlreadyCalled` before touching
/// the broker or the counter store. Clones share the same counters.
#[derive(Clone)]
pub struct RetryHandle {
    inner: Arc<HandleState>,
}

struct HandleState {
    channel: Arc<dyn Channel>,
    fields: DeliveryFields,
    content: Value,
    options: QueueOptions,
    store: Arc<dyn CounterStore>,
    key: String,
    cid: String,
    message_type: String,
    max_retries: u32,
    acks: AtomicU32,
    rejects: AtomicU32,
    events: Option<broadcast::Sender<BusEvent>>,
}

pub(crate) struct HandleParts {
    pub channel: Arc<dyn Channel>,
    pub fields: DeliveryFields,
    pub content: Value,
    pub options: QueueOptions,
    pub store: Arc<dyn CounterStore>,
    pub key: String,
    pub cid: String,
    pub max_retries: u32,
    pub events: Option<broadcast::Sender<BusEvent>>,
}

impl RetryHandle {
    pub(crate) fn new(parts: HandleParts) -> Self {
        let message_type = crate::message::content_str(&parts.content, "type")
            .unwrap_or_else(|| "undefined".to_string());
        Self {
            inner: Arc::new(HandleState {
                channel: parts.channel,
                fields: parts.fields,
                content: parts.content,
                options: parts.options,
                store: parts.store,
                key: parts.key,
                cid: parts.cid,
                message_type,
                max_retries: parts.max_retries,
                acks: AtomicU32::new(0),
                rejects: AtomicU32::new(0),
                events: parts.events,
            }),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.inner.max_retries
    }

    /// Counter store key for this message.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Acknowledges the delivery and clears its retry record.
    pub async fn ack(&self) -> Result<()> {
        let state = &self.inner;
        state.only("ack", &state.acks, 1)?;

        debug!(cid = %state.cid, "acking message");
        if let Err(err) = state.channel.ack(&state.fields).await {
            return Err(state.surface(err));
        }
        if let Err(err) = state.store.clear(&state.key).await {
            state.surface(err);
        }
        Ok(())
    }

    pub async fn acknowledge(&self) -> Result<()> {
        self.ack().await
    }

    /// Rejects the delivery.
    ///
    /// Below the limit the broker redelivers the message. Once the stored
    /// count exceeds `max_retries` the content goes to `<queue>.error`
    /// with a `rejected` header, the delivery is dropped and the record is
    /// cleared.
    pub async fn reject(&self) -> Result<()> {
        let state = &self.inner;
        // With no retries allowed the single reject dead-letters.
        state.only("reject", &state.rejects, state.max_retries.max(1))?;

        let count = state
            .store
            .increment(&state.key)
            .await
            .map_err(|err| state.surface(err))?;

        if u64::from(state.max_retries) < count {
            state.dead_letter(count).await
        } else {
            info!(cid = %state.cid, attempt = count, "retrying message");
            state
                .channel
                .reject(&state.fields, true)
                .await
                .map_err(|err| state.surface(err))
        }
    }
}

impl HandleState {
    fn only(&self, method: &'static str, calls: &AtomicU32, max: u32) -> Result<()> {
        let called = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if called > max {
            return Err(BusError::HandleAlreadyCalled {
                message_type: self.message_type.clone(),
                cid: self.cid.clone(),
                method,
            });
        }
        Ok(())
    }

    async fn dead_letter(&self, count: u64) -> Result<()> {
        let error_queue = self.options.error_queue_name();
        info!(cid = %self.cid, queue = %error_queue, rejected = count, "sending message to error queue");

        let body = self
            .options
            .codec
            .serialize(&self.content)
            .map_err(|err| self.surface(err))?;
        let mut properties = self.options.properties();
        properties
            .headers
            .insert("rejected".to_string(), Value::from(count));

        self.channel
            .send_to_queue(&error_queue, body, properties)
            .await
            .map_err(|err| self.surface(err))?;
        self.channel
            .reject(&self.fields, false)
            .await
            .map_err(|err| self.surface(err))?;
        self.store
            .clear(&self.key)
            .await
            .map_err(|err| self.surface(err))
    }

    /// Emits the error on the bus and hands it back to the caller.
    fn surface(&self, err: BusError) -> BusError {
        emit_error(self.events.as_ref(), Arc::new(err.mirror()));
        err
    }
}

impl fmt::Debug for RetryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryHandle")
            .field("key", &self.inner.key)
            .field("max_retries", &self.inner.max_retries)
            .field("acks", &self.inner.acks.load(Ordering::SeqCst))
            .field("rejects", &self.inner.rejects.load(Ordering::SeqCst))
            .finish()
    }
}
