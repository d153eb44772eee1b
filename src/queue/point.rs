use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::bus::BusEvent;
use crate::message::{QueueKind, QueueOptions};
use crate::queue::consumer::{Cancellation, ConsumerRegistration, Dispatcher, Handler};
use crate::queue::{QueueContext, error_queue_declare, queue_declare};
use crate::transport::Channel;
use crate::utils::{BusError, Result};

use std::sync::Arc;

/// A point-to-point queue.
pub struct Queue {
    options: QueueOptions,
    context: QueueContext,
    send_channel: Arc<dyn Channel>,
    registration: Arc<ConsumerRegistration>,
}

impl Queue {
    /// Declares the queue and, for acknowledged queues, its `.error` sibling.
    ///
    /// Sends go through the confirm channel when `confirmed` is set.
    pub async fn create(
        mut options: QueueOptions,
        context: &QueueContext,
        confirmed: bool,
    ) -> Result<Self> {
        options.queue_kind = QueueKind::Queue;
        let send_channel = if confirmed {
            context
                .confirm_channel
                .clone()
                .ok_or(BusError::ConfirmsNotEnabled)?
        } else {
            context.send_channel.clone()
        };

        if options.assert_queue {
            let channel = &context.listen_channel;
            debug!(queue = %options.queue_name, "asserting queue");
            if let Err(err) = channel
                .assert_queue(&options.queue_name, &queue_declare(&options))
                .await
            {
                error!(queue = %options.queue_name, "error asserting queue: {}", err);
                return Err(err);
            }
            if options.ack {
                let error_queue = options.error_queue_name();
                debug!(queue = %error_queue, "asserting error queue");
                channel
                    .assert_queue(&error_queue, &error_queue_declare(&options))
                    .await?;
            }
        }

        Ok(Self {
            options,
            context: context.clone(),
            send_channel,
            registration: Arc::new(ConsumerRegistration::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.options.queue_name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn is_listening(&self) -> bool {
        self.registration.is_active()
    }

    /// Starts a consumer, returning its tag.
    ///
    /// `options` are the listen call's own: with `ack` the consumer runs in
    /// manual-ack mode and the error queue is asserted if needed.
    pub async fn listen(&self, handler: Handler, options: &QueueOptions) -> Result<String> {
        info!(queue = %self.name(), "listening to queue");
        let mut options = options.clone();
        options.queue_kind = QueueKind::Queue;
        if options.ack && options.assert_queue && !self.options.ack {
            self.context
                .listen_channel
                .assert_queue(&options.error_queue_name(), &error_queue_declare(&options))
                .await?;
        }

        let no_ack = !options.ack;
        let dispatcher = Arc::new(Dispatcher {
            options,
            channel: self.context.listen_channel.clone(),
            pipeline: self.context.pipeline.clone(),
            events: self.context.events.clone(),
            handler,
        });

        self.registration.begin()?;
        let tag = match self
            .context
            .listen_channel
            .consume(self.name(), no_ack, dispatcher)
            .await
        {
            Ok(tag) => tag,
            Err(err) => {
                self.registration.abandon()?;
                return Err(err);
            }
        };

        if self
            .registration
            .complete(self.context.listen_channel.as_ref(), tag.clone())
            .await?
        {
            let _ = self.context.events.send(BusEvent::Listening {
                queue: self.name().to_string(),
            });
        }
        Ok(tag)
    }

    pub async fn unlisten(&self) -> Result<Cancellation> {
        let outcome = self
            .registration
            .cancel(self.context.listen_channel.as_ref())
            .await?;
        match outcome {
            Cancellation::Cancelled(_) => {
                info!(queue = %self.name(), "unlistened");
                let _ = self.context.events.send(BusEvent::Unlistened {
                    queue: self.name().to_string(),
                });
            }
            Cancellation::Deferred => {
                debug!(queue = %self.name(), "unlisten deferred until consumer is registered")
            }
            Cancellation::Idle => {}
        }
        Ok(outcome)
    }

    /// Deletes the queue and, for acknowledged queues, tries to delete the
    /// error queue as well.
    ///
    /// An error queue still holding dead letters is kept and only logged.
    pub async fn destroy(&self) -> Result<()> {
        info!(queue = %self.name(), "deleting queue");
        let channel = &self.context.listen_channel;
        channel.delete_queue(self.name(), false).await?;
        if self.options.ack {
            let error_queue = self.options.error_queue_name();
            if let Err(err) = channel.delete_queue(&error_queue, true).await {
                warn!(queue = %error_queue, "keeping error queue: {}", err);
            }
        }
        Ok(())
    }

    /// Serializes `content` and writes it to the queue, or to the routing
    /// key when one was given.
    pub async fn send(&self, content: &Value, options: &QueueOptions) -> Result<()> {
        let body = options.codec.serialize(content)?;
        let mut properties = options.properties();
        properties.persistent = options.persistent || self.options.ack;

        let target = options
            .routing_key
            .as_deref()
            .unwrap_or_else(|| self.options.target());
        self.send_channel
            .send_to_queue(target, body, properties)
            .await
    }
}
