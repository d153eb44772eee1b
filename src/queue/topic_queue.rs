use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::bus::{BusEvent, SubscribeReceipt};
use crate::correlator::Correlator;
use crate::message::{QueueKind, QueueOptions};
use crate::queue::consumer::{ConsumerRegistration, Dispatcher, Handler};
use crate::queue::{QueueContext, error_queue_declare, queue_declare};
use crate::transport::{Channel, ExchangeDeclare};
use crate::utils::{BusError, Result};

/// A topic on the bus exchange.
///
/// Publishing routes by the routing key, or the topic name without one.
/// Each subscription binds its own physical queue, named by the
/// correlator.
pub struct TopicQueue {
    options: QueueOptions,
    context: QueueContext,
    publish_channel: Arc<dyn Channel>,
    correlator: Arc<Correlator>,
}

impl TopicQueue {
    /// Declares the exchange on the publishing channels.
    pub async fn create(
        mut options: QueueOptions,
        context: &QueueContext,
        correlator: Arc<Correlator>,
        confirmed: bool,
    ) -> Result<Self> {
        options.queue_kind = QueueKind::PubSubQueue;
        let publish_channel = if confirmed {
            context
                .confirm_channel
                .clone()
                .ok_or(BusError::ConfirmsNotEnabled)?
        } else {
            context.send_channel.clone()
        };

        let declare = exchange_declare(&options);
        debug!(exchange = %options.exchange_name, "asserting exchange");
        context
            .send_channel
            .assert_exchange(&options.exchange_name, &declare)
            .await?;
        if let Some(confirm) = &context.confirm_channel {
            confirm
                .assert_exchange(&options.exchange_name, &declare)
                .await?;
        }

        Ok(Self {
            options,
            context: context.clone(),
            publish_channel,
            correlator,
        })
    }

    pub fn name(&self) -> &str {
        &self.options.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.options.exchange_name
    }

    /// Publishes with the call's routing key, else the topic's own target.
    pub async fn publish(&self, content: &Value, options: &QueueOptions) -> Result<()> {
        let body = options.codec.serialize(content)?;
        let routing_key = options
            .routing_key
            .as_deref()
            .unwrap_or_else(|| self.options.target());
        self.publish_channel
            .publish(
                &self.options.exchange_name,
                routing_key,
                body,
                options.properties(),
            )
            .await
    }

    /// Declares and binds the subscription queue, then starts consuming.
    ///
    /// `options` are the subscribe call's own options: they decide
    /// acknowledgment, durability and the binding pattern.
    pub async fn subscribe(
        &self,
        options: &QueueOptions,
        handler: Handler,
    ) -> Result<SubscribeReceipt> {
        let mut options = options.clone();
        options.queue_kind = QueueKind::PubSubQueue;
        let channel = self.context.listen_channel.clone();

        let physical = self.correlator.resolve(&options).await?;
        let pattern = options.target().to_string();
        info!(topic = %options.queue_name, queue = %physical, routing_key = %pattern, "subscribing");

        channel
            .assert_queue(&physical, &queue_declare(&options))
            .await?;
        channel
            .bind_queue(&physical, &options.exchange_name, &pattern)
            .await?;
        if options.ack {
            let error_queue = options.error_queue_name();
            debug!(queue = %error_queue, "asserting error queue");
            channel
                .assert_queue(&error_queue, &error_queue_declare(&options))
                .await?;
        }

        let registration = Arc::new(ConsumerRegistration::default());
        let dispatcher = Arc::new(Dispatcher {
            options: options.clone(),
            channel: channel.clone(),
            pipeline: self.context.pipeline.clone(),
            events: self.context.events.clone(),
            handler,
        });

        registration.begin()?;
        let tag = match channel.consume(&physical, !options.ack, dispatcher).await {
            Ok(tag) => tag,
            Err(err) => {
                registration.abandon()?;
                return Err(err);
            }
        };
        registration.complete(channel.as_ref(), tag).await?;

        let _ = self.context.events.send(BusEvent::Subscribed {
            queue: physical.clone(),
        });
        Ok(SubscribeReceipt::new(
            physical,
            registration,
            channel,
            self.context.events.clone(),
        ))
    }
}

fn exchange_declare(options: &QueueOptions) -> ExchangeDeclare {
    ExchangeDeclare {
        kind: options.exchange.kind.clone(),
        durable: options.exchange.durable,
        auto_delete: options.exchange.auto_delete,
    }
}
