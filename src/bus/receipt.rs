use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use crate::bus::BusEvent;
use crate::queue::Cancellation;
use crate::queue::consumer::ConsumerRegistration;
use crate::transport::Channel;
use crate::utils::Result;

/// Returned by `subscribe`; cancels that one subscription.
#[derive(Clone)]
pub struct SubscribeReceipt {
    queue: String,
    registration: Arc<ConsumerRegistration>,
    channel: Arc<dyn Channel>,
    events: broadcast::Sender<BusEvent>,
}

impl SubscribeReceipt {
    pub(crate) fn new(
        queue: String,
        registration: Arc<ConsumerRegistration>,
        channel: Arc<dyn Channel>,
        events: broadcast::Sender<BusEvent>,
    ) -> Self {
        Self {
            queue,
            registration,
            channel,
            events,
        }
    }

    /// Physical queue backing this subscription.
    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn is_subscribed(&self) -> bool {
        self.registration.is_active()
    }

    pub async fn unsubscribe(&self) -> Result<Cancellation> {
        let outcome = self.registration.cancel(self.channel.as_ref()).await?;
        if let Cancellation::Cancelled(_) = outcome {
            info!(queue = %self.queue, "unsubscribed");
            let _ = self.events.send(BusEvent::Unlistened {
                queue: self.queue.clone(),
            });
        }
        Ok(outcome)
    }
}

impl fmt::Debug for SubscribeReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeReceipt")
            .field("queue", &self.queue)
            .field("subscribed", &self.is_subscribed())
            .finish()
    }
}
