use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard, broadcast};
use tracing::{debug, error, info, warn};

use crate::bus::{BusEvent, SubscribeReceipt};
use crate::config::BusSettings;
use crate::correlator::Correlator;
use crate::message::{CallOptions, Codec, JsonCodec, QueueOptions};
use crate::middleware::context::emit_error;
use crate::middleware::retry::{MemoryStore, RedisStore, RetryMiddleware};
use crate::middleware::{
    MessageContext, Middleware, OutgoingMessage, Pipeline, correlate, logger, message_context,
    package,
};
use crate::queue::{Cancellation, Queue, QueueContext, Received, TopicQueue, handler};
use crate::transport::{Transport, TransportEvent};
use crate::utils::{BusError, Result};

const EVENT_CAPACITY: usize = 256;

/// The public entry point: point-to-point `send`/`listen`, topic
/// `publish`/`subscribe`, and the middleware pipeline they share.
///
/// Operations issued before [`Bus::initialize`] completes wait for it and
/// then run in the order they were called.
pub struct Bus {
    settings: BusSettings,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    pipeline: Arc<Pipeline>,
    correlator: Arc<Correlator>,
    events: broadcast::Sender<BusEvent>,
    gate: Arc<Mutex<()>>,
    startup: StdMutex<Option<OwnedMutexGuard<()>>>,
    context: OnceLock<QueueContext>,
    queues: Mutex<HashMap<String, Arc<Queue>>>,
    topics: Mutex<HashMap<String, Arc<TopicQueue>>>,
    closed: AtomicBool,
}

impl Bus {
    /// Creates a bus that is not yet connected; call [`Bus::initialize`].
    pub fn new(settings: BusSettings, transport: Arc<dyn Transport>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let gate = Arc::new(Mutex::new(()));
        let startup = gate.clone().try_lock_owned().ok();
        let correlator = Arc::new(Correlator::new(&settings));

        Self {
            settings,
            transport,
            codec: Arc::new(JsonCodec),
            pipeline: Arc::new(Pipeline::new()),
            correlator,
            events,
            gate,
            startup: StdMutex::new(startup),
            context: OnceLock::new(),
            queues: Mutex::new(HashMap::new()),
            topics: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Creates and initializes a bus.
    pub async fn connect(settings: BusSettings, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        let bus = Arc::new(Self::new(settings, transport));
        bus.initialize().await?;
        Ok(bus)
    }

    /// Replaces the payload codec used for queues created afterwards.
    pub fn with_codec(mut self, codec: impl Codec + 'static) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Opens the send, listen and (when enabled) confirm channels, then
    /// releases the operations waiting for readiness.
    pub async fn initialize(&self) -> Result<()> {
        let Some(startup) = self
            .startup
            .lock()
            .map_err(|_| BusError::LockPoisoned("bus startup"))?
            .take()
        else {
            return Ok(());
        };

        info!(url = %self.settings.redacted_broker_url(), "connecting to broker");
        let transport_events = self.transport.events();
        let result = self.open_channels().await;
        match &result {
            Ok(()) => {
                self.forward_transport_events(transport_events);
                info!("connected to broker");
                let _ = self.events.send(BusEvent::Ready);
            }
            Err(err) => {
                error!("error connecting to broker: {}", err);
                emit_error(Some(&self.events), Arc::new(err.mirror()));
            }
        }
        drop(startup);
        result
    }

    async fn open_channels(&self) -> Result<()> {
        let send_channel = self.transport.create_channel().await?;
        let listen_channel = self.transport.create_channel().await?;
        let confirm_channel = if self.settings.enable_confirms {
            Some(self.transport.create_confirm_channel().await?)
        } else {
            None
        };

        if let Some(prefetch) = self.settings.prefetch {
            send_channel.prefetch(prefetch).await?;
            listen_channel.prefetch(prefetch).await?;
            if let Some(confirm) = &confirm_channel {
                confirm.prefetch(prefetch).await?;
            }
        }

        let _ = self.context.set(QueueContext {
            listen_channel,
            send_channel,
            confirm_channel,
            pipeline: self.pipeline.clone(),
            events: self.events.clone(),
        });
        Ok(())
    }

    fn forward_transport_events(&self, mut transport_events: broadcast::Receiver<TransportEvent>) {
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                let event = match transport_events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "transport events lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let done = matches!(event, TransportEvent::ConnectionClosed);
                let forwarded = match event {
                    TransportEvent::ConnectionClosed => BusEvent::ConnectionClose,
                    TransportEvent::ConnectionError(reason) => BusEvent::ConnectionError(reason),
                    TransportEvent::ChannelClosed { confirm } => BusEvent::ChannelClose { confirm },
                    TransportEvent::ChannelError { confirm, reason } => {
                        warn!(confirm, "channel error: {}", reason);
                        BusEvent::Error(Arc::new(BusError::Transport(reason)))
                    }
                };
                let _ = events.send(forwarded);
                if done {
                    break;
                }
            }
        });
    }

    /// Waits for initialization and returns the shared queue context.
    async fn ready(&self) -> Result<&QueueContext> {
        drop(self.gate.lock().await);
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        self.context
            .get()
            .ok_or_else(|| BusError::transport("bus is not connected"))
    }

    /// Whether the bus has opened its channels and has not been closed
    /// Operations issued while this is false wait for initialization,
    /// or fail once the bus is closed
    pub fn is_ready(&self) -> bool {
        self.context.get().is_some() && !self.closed.load(Ordering::SeqCst)
    }

    /// The settings this bus was created with
    /// Queue options for every call are resolved against these
    pub fn settings(&self) -> &BusSettings {
        &self.settings
    }

    /// The correlator naming this bus's subscription queues
    /// Its map file is shared with every other bus in the same scope,
    /// so a subscription keeps its physical queue across restarts
    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Subscribes to lifecycle and error events
    /// Events sent before this call are not replayed, so subscribe before
    /// `initialize` to observe `Ready` or a failed connection
    pub fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    /// Registers a middleware unit
    /// Outgoing handlers run in registration order, incoming handlers in
    /// reverse order. Returns the bus so registrations can be chained
    pub fn use_middleware(&self, middleware: Middleware) -> Result<&Self> {
        self.pipeline.register(middleware)?;
        Ok(self)
    }

    /// A unit that stamps a `cid` on outgoing messages lacking one
    pub fn correlate(&self) -> Middleware {
        correlate::correlate()
    }

    /// A unit that wraps outgoing content in a `{data, datetime, type}` envelope
    pub fn package(&self) -> Middleware {
        package::package()
    }

    /// A unit that logs messages in both directions through `tracing`
    pub fn logger(&self) -> Middleware {
        logger::logger()
    }

    /// A unit that seeds each incoming message's context with its
    /// correlation id, see [`Bus::create_correlation_id`]
    pub fn message_context(&self) -> Middleware {
        message_context::message_context()
    }

    /// Retry unit configured from the bus settings, counting in memory.
    pub fn retry(&self) -> Middleware {
        RetryMiddleware::from_settings(
            &self.settings.retry,
            Arc::new(MemoryStore::new()),
        )
        .into_middleware()
    }

    /// Retry unit configured from the bus settings, counting in redis.
    pub async fn retry_with_redis(&self) -> Result<Middleware> {
        let store = RedisStore::connect(&self.settings.redis).await?;
        Ok(RetryMiddleware::from_settings(&self.settings.retry, Arc::new(store)).into_middleware())
    }

    /// The context's correlation id unless absent or `force_new`, else a fresh id.
    pub fn create_correlation_id(&self, ctx: Option<&MessageContext>, force_new: bool) -> String {
        ctx.cloned()
            .unwrap_or_default()
            .create_correlation_id(force_new)
    }

    fn resolve(&self, name: &str, call: &CallOptions) -> QueueOptions {
        QueueOptions::resolve(name, call, &self.settings, self.codec.clone())
    }

    fn surface(&self, err: BusError) -> BusError {
        emit_error(Some(&self.events), Arc::new(err.mirror()));
        err
    }

    fn outgoing_context(&self, call: &CallOptions) -> MessageContext {
        let ctx = MessageContext::for_bus(self.events.clone());
        match &call.correlation_id {
            Some(cid) => ctx.with_correlation_id(cid.clone()),
            None => ctx,
        }
    }

    async fn queue(
        &self,
        key: &str,
        options: &QueueOptions,
        confirmed: bool,
        context: &QueueContext,
    ) -> Result<Arc<Queue>> {
        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get(key) {
            return Ok(queue.clone());
        }
        debug!(queue = %options.queue_name, "creating queue");
        let queue = Queue::create(options.clone(), context, confirmed)
            .await
            .map_err(|err| self.surface(err))?;
        let queue = Arc::new(queue);
        queues.insert(key.to_string(), queue.clone());
        Ok(queue)
    }

    async fn topic(
        &self,
        key: &str,
        options: &QueueOptions,
        confirmed: bool,
        context: &QueueContext,
    ) -> Result<Arc<TopicQueue>> {
        let mut topics = self.topics.lock().await;
        if let Some(topic) = topics.get(key) {
            return Ok(topic.clone());
        }
        debug!(topic = %options.queue_name, "creating topic queue");
        let topic = TopicQueue::create(options.clone(), context, self.correlator.clone(), confirmed)
            .await
            .map_err(|err| self.surface(err))?;
        let topic = Arc::new(topic);
        topics.insert(key.to_string(), topic.clone());
        Ok(topic)
    }

    /// Sends `content` to the named queue.
    pub async fn send(&self, queue_name: &str, content: impl Serialize, options: CallOptions) -> Result<()> {
        self.send_inner(queue_name, serde_json::to_value(content)?, options, false)
            .await
    }

    /// Like [`Bus::send`] but resolves only once the broker has confirmed
    /// the message. Requires `enable_confirms`.
    pub async fn send_confirmed(
        &self,
        queue_name: &str,
        content: impl Serialize,
        options: CallOptions,
    ) -> Result<()> {
        self.send_inner(queue_name, serde_json::to_value(content)?, options, true)
            .await
    }

    async fn send_inner(
        &self,
        queue_name: &str,
        content: Value,
        call: CallOptions,
        confirmed: bool,
    ) -> Result<()> {
        let context = self.ready().await?;
        if confirmed && context.confirm_channel.is_none() {
            return Err(BusError::ConfirmsNotEnabled);
        }

        let options = self.resolve(queue_name, &call);
        let key = if confirmed {
            format!("{}.confirm", queue_name)
        } else {
            queue_name.to_string()
        };
        let queue = self.queue(&key, &options, confirmed, context).await?;

        let mut ctx = self.outgoing_context(&call);
        let outgoing = self
            .pipeline
            .handle_outgoing(
                &mut ctx,
                OutgoingMessage {
                    target: queue_name.to_string(),
                    content,
                    options,
                },
            )
            .await?;
        queue
            .send(&outgoing.content, &outgoing.options)
            .await
            .map_err(|err| self.surface(err))
    }

    /// Consumes the named queue, calling `f` for each message
    /// The queue is created on first use. With `ack` in `options` the
    /// consumer acknowledges manually: register the retry unit so each
    /// message carries a handle to `ack` or `reject` it.
    /// Errors and panics from `f` go to the context error sink when one is
    /// installed, otherwise to the bus `Error` event
    pub async fn listen<F, Fut>(&self, queue_name: &str, options: CallOptions, f: F) -> Result<()>
    where
        F: Fn(Received) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let context = self.ready().await?;
        info!(queue = %queue_name, "listen on queue");
        let options = self.resolve(queue_name, &options);
        let queue = self.queue(queue_name, &options, false, context).await?;
        queue
            .listen(handler(f), &options)
            .await
            .map_err(|err| self.surface(err))?;
        Ok(())
    }

    /// Stops consuming the named queue
    /// The queue itself is kept, and messages sent meanwhile wait in it.
    /// Fails with `NoListener` when this bus never listened to the queue
    pub async fn unlisten(&self, queue_name: &str) -> Result<Cancellation> {
        self.ready().await?;
        let queue = self
            .queues
            .lock()
            .await
            .remove(queue_name)
            .ok_or_else(|| BusError::NoListener(queue_name.to_string()))?;
        queue.unlisten().await
    }

    /// Deletes the named queue. With `force`, a queue this bus does not
    /// know about is deleted as well.
    pub async fn destroy_listener(&self, queue_name: &str, force: bool) -> Result<()> {
        let context = self.ready().await?;
        let queue = self.queues.lock().await.remove(queue_name);
        match queue {
            Some(queue) => queue.destroy().await,
            None if force => context.listen_channel.delete_queue(queue_name, false).await,
            None => Err(BusError::NoListener(queue_name.to_string())),
        }
    }

    /// Publishes `content` on the bus exchange.
    pub async fn publish(&self, topic: &str, content: impl Serialize, options: CallOptions) -> Result<()> {
        self.publish_inner(topic, serde_json::to_value(content)?, options, false)
            .await
    }

    /// Like [`Bus::publish`] but waits for broker confirmation. Requires
    /// `enable_confirms`.
    pub async fn publish_confirmed(
        &self,
        topic: &str,
        content: impl Serialize,
        options: CallOptions,
    ) -> Result<()> {
        self.publish_inner(topic, serde_json::to_value(content)?, options, true)
            .await
    }

    async fn publish_inner(
        &self,
        topic_name: &str,
        content: Value,
        call: CallOptions,
        confirmed: bool,
    ) -> Result<()> {
        let context = self.ready().await?;
        if confirmed && context.confirm_channel.is_none() {
            return Err(BusError::ConfirmsNotEnabled);
        }

        let options = self.resolve(topic_name, &call);
        let key = if confirmed {
            format!("{}.confirm", topic_name)
        } else {
            topic_name.to_string()
        };
        let topic = self.topic(&key, &options, confirmed, context).await?;

        let mut ctx = self.outgoing_context(&call);
        let outgoing = self
            .pipeline
            .handle_outgoing(
                &mut ctx,
                OutgoingMessage {
                    target: topic_name.to_string(),
                    content,
                    options,
                },
            )
            .await?;
        topic
            .publish(&outgoing.content, &outgoing.options)
            .await
            .map_err(|err| self.surface(err))
    }

    /// Subscribes to a topic
    /// Each subscription gets its own queue bound to the exchange. Without a
    /// routing key the queue name comes from the correlator and stays the
    /// same across restarts; with one the topic name is used directly and
    /// the routing key becomes the binding pattern
    pub async fn subscribe<F, Fut>(
        &self,
        topic_name: &str,
        options: CallOptions,
        f: F,
    ) -> Result<SubscribeReceipt>
    where
        F: Fn(Received) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let context = self.ready().await?;
        info!(topic = %topic_name, "subscribe on topic");
        let options = self.resolve(topic_name, &options);
        let topic = self.topic(topic_name, &options, false, context).await?;
        topic
            .subscribe(&options, handler(f))
            .await
            .map_err(|err| self.surface(err))
    }

    /// Closes the channels and the connection. Further operations fail
    /// with `Closed`.
    pub async fn close(&self) -> Result<()> {
        drop(self.gate.lock().await);
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("closing channels and connection");
        self.queues.lock().await.clear();
        self.topics.lock().await.clear();

        if let Some(context) = self.context.get() {
            let channels = [Some(&context.send_channel), Some(&context.listen_channel)]
                .into_iter()
                .chain([context.confirm_channel.as_ref()])
                .flatten();
            for channel in channels {
                if let Err(err) = channel.close().await {
                    warn!(confirm = channel.is_confirm(), "error closing channel: {}", err);
                }
            }
        }
        self.transport.close().await
    }
}
