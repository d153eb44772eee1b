use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::message::{DeliveryFields, MessageProperties};
use crate::transport::topic::Exchange;
use crate::transport::{
    Channel, Consumer, Delivery, ExchangeDeclare, QueueDeclare, Transport, TransportEvent,
};
use crate::utils::{BusError, Result};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    properties: MessageProperties,
    exchange: String,
    routing_key: String,
    redelivered: bool,
}

struct ConsumerSlot {
    tag: String,
    channel_id: u64,
    no_ack: bool,
    prefetch: Option<u16>,
    in_flight: usize,
    tx: mpsc::UnboundedSender<Option<Delivery>>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.no_ack
            || self
                .prefetch
                .is_none_or(|limit| limit == 0 || self.in_flight < limit as usize)
    }
}

struct QueueState {
    declare: QueueDeclare,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

impl QueueState {
    fn new(declare: QueueDeclare) -> Self {
        Self {
            declare,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    channel_id: u64,
    message: StoredMessage,
}

/// Queues, exchanges and in-flight deliveries of the in-memory broker.
///
/// All mutation happens under one lock; deliveries leave through each
/// consumer's unbounded sender so no callback runs while it is held.
struct BrokerState {
    queues: HashMap<String, QueueState>,
    exchanges: HashMap<String, Exchange>,
    unacked: HashMap<u64, Unacked>,
    next_delivery_tag: u64,
}

impl Default for BrokerState {
    fn default() -> Self {
        let mut exchanges = HashMap::new();
        for (name, kind) in [
            ("amq.topic", "topic"),
            ("amq.direct", "direct"),
            ("amq.fanout", "fanout"),
        ] {
            let declare = ExchangeDeclare {
                kind: kind.to_string(),
                durable: true,
                auto_delete: false,
            };
            exchanges.insert(name.to_string(), Exchange::new(name, declare));
        }

        Self {
            queues: HashMap::new(),
            exchanges,
            unacked: HashMap::new(),
            next_delivery_tag: 0,
        }
    }
}

impl BrokerState {
    fn assert_queue(&mut self, name: &str, declare: &QueueDeclare) -> Result<()> {
        match self.queues.get(name) {
            Some(existing) if existing.declare != *declare => Err(BusError::declare(
                name,
                format!(
                    "PRECONDITION_FAILED - inequivalent arg for queue '{}': declared {:?}, requested {:?}",
                    name, existing.declare, declare
                ),
            )),
            Some(_) => Ok(()),
            None => {
                debug!("Declared queue {} {:?}", name, declare);
                self.queues
                    .insert(name.to_string(), QueueState::new(*declare));
                Ok(())
            }
        }
    }

    fn assert_exchange(&mut self, name: &str, declare: &ExchangeDeclare) -> Result<()> {
        if !matches!(declare.kind.as_str(), "topic" | "direct" | "fanout") {
            return Err(BusError::declare(
                name,
                format!("COMMAND_INVALID - unknown exchange type '{}'", declare.kind),
            ));
        }
        match self.exchanges.get(name) {
            Some(existing) if existing.declare != *declare => Err(BusError::declare(
                name,
                format!(
                    "PRECONDITION_FAILED - inequivalent arg for exchange '{}': declared {:?}, requested {:?}",
                    name, existing.declare, declare
                ),
            )),
            Some(_) => Ok(()),
            None => {
                self.exchanges
                    .insert(name.to_string(), Exchange::new(name, declare.clone()));
                Ok(())
            }
        }
    }

    fn bind(&mut self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        if !self.queues.contains_key(queue) {
            return Err(BusError::transport(format!(
                "NOT_FOUND - no queue '{}'",
                queue
            )));
        }
        let exchange = self.exchanges.get_mut(exchange).ok_or_else(|| {
            BusError::transport(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;
        exchange.bind(queue, pattern);
        Ok(())
    }

    fn enqueue(&mut self, queue: &str, message: StoredMessage) {
        match self.queues.get_mut(queue) {
            Some(q) => {
                q.ready.push_back(message);
                self.dispatch(queue);
            }
            None => debug!("Dropping unroutable message for missing queue {}", queue),
        }
    }

    fn publish(&mut self, exchange: &str, message: StoredMessage) -> Result<()> {
        if exchange.is_empty() {
            let queue = message.routing_key.clone();
            self.enqueue(&queue, message);
            return Ok(());
        }
        let targets = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BusError::transport(format!("NOT_FOUND - no exchange '{}'", exchange)))?
            .route(&message.routing_key);
        if targets.is_empty() {
            debug!(
                "No binding on {} matched routing key {}",
                exchange, message.routing_key
            );
        }
        for queue in targets {
            self.enqueue(&queue, message.clone());
        }
        Ok(())
    }

    /// Hand ready messages to consumers with spare capacity, round robin.
    fn dispatch(&mut self, queue: &str) {
        let BrokerState {
            queues,
            unacked,
            next_delivery_tag,
            ..
        } = self;
        let Some(q) = queues.get_mut(queue) else {
            return;
        };

        while !q.ready.is_empty() {
            let count = q.consumers.len();
            let Some(idx) = (0..count)
                .map(|offset| (q.next_consumer + offset) % count)
                .find(|&idx| q.consumers[idx].has_capacity())
            else {
                break;
            };
            q.next_consumer = (idx + 1) % count;

            let Some(message) = q.ready.pop_front() else {
                break;
            };
            *next_delivery_tag += 1;
            let tag = *next_delivery_tag;
            let slot = &mut q.consumers[idx];
            let delivery = Delivery {
                body: message.body.clone(),
                fields: DeliveryFields {
                    delivery_tag: tag,
                    consumer_tag: slot.tag.clone(),
                    redelivered: message.redelivered,
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                },
                properties: message.properties.clone(),
            };

            if slot.tx.send(Some(delivery)).is_err() {
                warn!("Consumer {} on {} is gone, requeueing", slot.tag, queue);
                q.ready.push_front(message);
                q.consumers.remove(idx);
                q.next_consumer = 0;
                continue;
            }
            if !slot.no_ack {
                slot.in_flight += 1;
                unacked.insert(
                    tag,
                    Unacked {
                        queue: queue.to_string(),
                        consumer_tag: slot.tag.clone(),
                        channel_id: slot.channel_id,
                        message,
                    },
                );
            }
        }
    }

    fn settle(&mut self, delivery_tag: u64) -> Result<Unacked> {
        let entry = self.unacked.remove(&delivery_tag).ok_or_else(|| {
            BusError::transport(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            ))
        })?;
        if let Some(q) = self.queues.get_mut(&entry.queue) {
            if let Some(slot) = q
                .consumers
                .iter_mut()
                .find(|slot| slot.tag == entry.consumer_tag)
            {
                slot.in_flight = slot.in_flight.saturating_sub(1);
            }
        }
        Ok(entry)
    }

    fn ack(&mut self, delivery_tag: u64) -> Result<()> {
        let entry = self.settle(delivery_tag)?;
        self.dispatch(&entry.queue);
        Ok(())
    }

    fn reject(&mut self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut entry = self.settle(delivery_tag)?;
        if requeue {
            if let Some(q) = self.queues.get_mut(&entry.queue) {
                entry.message.redelivered = true;
                q.ready.push_front(entry.message);
            }
        }
        self.dispatch(&entry.queue);
        Ok(())
    }

    fn cancel(&mut self, consumer_tag: &str) {
        let owner = self.queues.iter_mut().find_map(|(name, q)| {
            let idx = q.consumers.iter().position(|slot| slot.tag == consumer_tag)?;
            q.consumers.remove(idx);
            q.next_consumer = 0;
            Some(name.clone())
        });
        if let Some(queue) = owner {
            debug!("Cancelled consumer {} on {}", consumer_tag, queue);
            self.auto_delete(&queue);
        }
    }

    fn auto_delete(&mut self, queue: &str) {
        let unused = self
            .queues
            .get(queue)
            .is_some_and(|q| q.declare.auto_delete && q.consumers.is_empty());
        if unused {
            debug!("Auto-deleting queue {}", queue);
            self.remove_queue(queue);
        }
    }

    fn delete_queue(&mut self, name: &str, if_empty: bool) -> Result<()> {
        let Some(q) = self.queues.get(name) else {
            return Ok(());
        };
        if if_empty && !q.ready.is_empty() {
            return Err(BusError::transport(format!(
                "PRECONDITION_FAILED - queue '{}' not empty",
                name
            )));
        }
        self.remove_queue(name);
        Ok(())
    }

    /// Drop a queue, its bindings and its in-flight deliveries; remaining
    /// consumers are told they were cancelled.
    fn remove_queue(&mut self, name: &str) {
        if let Some(q) = self.queues.remove(name) {
            for slot in q.consumers {
                let _ = slot.tx.send(None);
            }
        }
        for exchange in self.exchanges.values_mut() {
            exchange.unbind_queue(name);
        }
        self.unacked.retain(|_, entry| entry.queue != name);
    }

    /// Cancel the channel's consumers and requeue what it left unacknowledged.
    fn close_channel(&mut self, channel_id: u64) {
        let mut touched = Vec::new();
        for (name, q) in self.queues.iter_mut() {
            let before = q.consumers.len();
            q.consumers.retain(|slot| slot.channel_id != channel_id);
            if q.consumers.len() != before {
                q.next_consumer = 0;
                touched.push(name.clone());
            }
        }

        let mut orphaned: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, entry)| entry.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        orphaned.sort_unstable_by(|a, b| b.cmp(a));
        for tag in orphaned {
            if let Some(mut entry) = self.unacked.remove(&tag) {
                if let Some(q) = self.queues.get_mut(&entry.queue) {
                    entry.message.redelivered = true;
                    q.ready.push_front(entry.message);
                }
                if !touched.contains(&entry.queue) {
                    touched.push(entry.queue);
                }
            }
        }

        for queue in touched {
            self.auto_delete(&queue);
            self.dispatch(&queue);
        }
    }
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    next_id: AtomicU64,
}

/// An in-process AMQP-style broker.
///
/// Cloning yields another handle to the same broker. Each `connect` call
/// opens an independent connection, as separate processes would.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Opens a new connection to this broker.
    pub fn connect(&self) -> MemoryConnection {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        MemoryConnection {
            broker: self.clone(),
            closed: Arc::new(AtomicBool::new(false)),
            events,
            channels: Mutex::new(Vec::new()),
        }
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.state()
            .map(|s| s.queues.contains_key(name))
            .unwrap_or(false)
    }

    /// Number of messages ready for delivery, `None` if the queue is absent.
    pub fn message_count(&self, name: &str) -> Option<usize> {
        self.state().ok()?.queues.get(name).map(|q| q.ready.len())
    }

    pub fn consumer_count(&self, name: &str) -> Option<usize> {
        self.state().ok()?.queues.get(name).map(|q| q.consumers.len())
    }

    /// Declaration flags of an existing queue.
    pub fn queue_declare(&self, name: &str) -> Option<QueueDeclare> {
        self.state().ok()?.queues.get(name).map(|q| q.declare)
    }

    /// Pops one ready message without acknowledgment tracking.
    pub fn get(&self, queue: &str) -> Result<Option<Delivery>> {
        let mut state = self.state()?;
        let Some(message) = state
            .queues
            .get_mut(queue)
            .and_then(|q| q.ready.pop_front())
        else {
            return Ok(None);
        };
        state.next_delivery_tag += 1;
        Ok(Some(Delivery {
            body: message.body,
            fields: DeliveryFields {
                delivery_tag: state.next_delivery_tag,
                consumer_tag: String::new(),
                redelivered: message.redelivered,
                exchange: message.exchange,
                routing_key: message.routing_key,
            },
            properties: message.properties,
        }))
    }

    fn state(&self) -> Result<MutexGuard<'_, BrokerState>> {
        self.inner
            .state
            .lock()
            .map_err(|_| BusError::LockPoisoned("broker state"))
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// A connection to a `MemoryBroker`.
pub struct MemoryConnection {
    broker: MemoryBroker,
    closed: Arc<AtomicBool>,
    events: broadcast::Sender<TransportEvent>,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
}

impl MemoryConnection {
    /// The broker this connection belongs to.
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    /// Simulates the broker dropping the connection with an error.
    pub fn force_close(&self, reason: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self
            .events
            .send(TransportEvent::ConnectionError(reason.to_string()));
        self.shutdown()
    }

    fn open_channel(&self, confirm: bool) -> Result<Arc<dyn Channel>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let channel = Arc::new(MemoryChannel {
            id: self.broker.next_id(),
            confirm,
            broker: self.broker.clone(),
            prefetch: Mutex::new(None),
            closed: AtomicBool::new(false),
            connection_closed: self.closed.clone(),
            events: self.events.clone(),
        });
        self.channels
            .lock()
            .map_err(|_| BusError::LockPoisoned("connection channels"))?
            .push(channel.clone());
        debug!("Opened channel {} (confirm: {})", channel.id, confirm);
        Ok(channel)
    }

    fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let channels: Vec<_> = self
            .channels
            .lock()
            .map_err(|_| BusError::LockPoisoned("connection channels"))?
            .drain(..)
            .collect();
        for channel in channels {
            channel.shutdown()?;
        }
        let _ = self.events.send(TransportEvent::ConnectionClosed);
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>> {
        self.open_channel(false)
    }

    async fn create_confirm_channel(&self) -> Result<Arc<dyn Channel>> {
        self.open_channel(true)
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.shutdown()
    }
}

struct MemoryChannel {
    id: u64,
    confirm: bool,
    broker: MemoryBroker,
    prefetch: Mutex<Option<u16>>,
    closed: AtomicBool,
    connection_closed: Arc<AtomicBool>,
    events: broadcast::Sender<TransportEvent>,
}

impl MemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>> {
        if self.closed.load(Ordering::SeqCst) || self.connection_closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        self.broker.state()
    }

    fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.broker.state()?.close_channel(self.id);
        let _ = self.events.send(TransportEvent::ChannelClosed {
            confirm: self.confirm,
        });
        Ok(())
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn is_confirm(&self) -> bool {
        self.confirm
    }

    async fn prefetch(&self, count: u16) -> Result<()> {
        *self
            .prefetch
            .lock()
            .map_err(|_| BusError::LockPoisoned("channel prefetch"))? = Some(count);
        Ok(())
    }

    async fn assert_queue(&self, name: &str, declare: &QueueDeclare) -> Result<()> {
        self.open_state()?.assert_queue(name, declare)
    }

    async fn assert_exchange(&self, name: &str, declare: &ExchangeDeclare) -> Result<()> {
        self.open_state()?.assert_exchange(name, declare)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.open_state()?.bind(queue, exchange, pattern)
    }

    async fn consume(
        &self,
        queue: &str,
        no_ack: bool,
        consumer: Arc<dyn Consumer>,
    ) -> Result<String> {
        let prefetch = *self
            .prefetch
            .lock()
            .map_err(|_| BusError::LockPoisoned("channel prefetch"))?;
        let tag = format!("amq.ctag-{}", Uuid::new_v4().simple());
        let (tx, mut rx) = mpsc::unbounded_channel::<Option<Delivery>>();

        {
            let mut state = self.open_state()?;
            let q = state.queues.get_mut(queue).ok_or_else(|| {
                BusError::transport(format!("NOT_FOUND - no queue '{}'", queue))
            })?;
            q.consumers.push(ConsumerSlot {
                tag: tag.clone(),
                channel_id: self.id,
                no_ack,
                prefetch,
                in_flight: 0,
                tx,
            });
            state.dispatch(queue);
        }

        let consumer_tag = tag.clone();
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let cancelled = delivery.is_none();
                consumer.deliver(delivery).await;
                if cancelled {
                    break;
                }
            }
            debug!("Consumer {} stopped", consumer_tag);
        });

        Ok(tag)
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()> {
        self.open_state()?.publish(
            "",
            StoredMessage {
                body,
                properties,
                exchange: String::new(),
                routing_key: queue.to_string(),
                redelivered: false,
            },
        )
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()> {
        self.open_state()?.publish(
            exchange,
            StoredMessage {
                body,
                properties,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                redelivered: false,
            },
        )
    }

    async fn ack(&self, fields: &DeliveryFields) -> Result<()> {
        self.open_state()?.ack(fields.delivery_tag)
    }

    async fn reject(&self, fields: &DeliveryFields, requeue: bool) -> Result<()> {
        self.open_state()?.reject(fields.delivery_tag, requeue)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.open_state()?.cancel(consumer_tag);
        Ok(())
    }

    async fn delete_queue(&self, name: &str, if_empty: bool) -> Result<()> {
        self.open_state()?.delete_queue(name, if_empty)
    }

    async fn close(&self) -> Result<()> {
        self.shutdown()
    }
}
