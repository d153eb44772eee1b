use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::config::{BusSettings, ExchangeSettings};

use super::codec::{Codec, JsonCodec};
use super::MessageProperties;

/// Options accepted by a single `send`/`listen`/`publish`/`subscribe` call.
///
/// Deserializing rejects unknown fields, so options read from external
/// sources fail loudly instead of being ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CallOptions {
    pub ack: Option<bool>,
    pub acknowledge: Option<bool>,
    pub auto_delete: Option<bool>,
    pub exclusive: Option<bool>,
    pub persistent: Option<bool>,
    pub max_retries: Option<u32>,
    pub namespace: Option<String>,
    pub set_retries_remaining: Option<bool>,
    pub routing_key: Option<String>,
    pub correlation_id: Option<String>,
    pub headers: Option<Map<String, Value>>,
    pub content_type: Option<String>,
    pub message_type: Option<String>,
    pub auto_delete_error_queue: Option<bool>,
}

impl CallOptions {
    /// Options requesting manual acknowledgment.
    pub fn ack() -> Self {
        Self {
            ack: Some(true),
            ..Self::default()
        }
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: Value) -> Self {
        self.headers
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    pub fn with_auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = Some(auto_delete);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Whether either `ack` or `acknowledge` was requested.
    pub fn wants_ack(&self) -> bool {
        self.ack.unwrap_or(false) || self.acknowledge.unwrap_or(false)
    }
}

/// Which lifecycle manager a message travelled through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Queue,
    PubSubQueue,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::Queue => write!(f, "queue"),
            QueueKind::PubSubQueue => write!(f, "pubsubqueue"),
        }
    }
}

/// Call options merged with bus defaults.
///
/// Durability and persistence follow acknowledgment: `durable` and
/// `persistent` are set only when acknowledgment is requested (or
/// persistence explicitly asked for), and `auto_delete` defaults to the
/// opposite of acknowledgment unless overridden.
#[derive(Clone)]
pub struct QueueOptions {
    /// Logical name as given by the caller
    pub queue_name: String,
    pub routing_key: Option<String>,
    pub queue_kind: QueueKind,
    pub ack: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub persistent: bool,
    pub auto_delete_error_queue: bool,
    pub content_type: String,
    pub codec: Arc<dyn Codec>,
    pub max_retries: Option<u32>,
    pub namespace: Option<String>,
    pub set_retries_remaining: Option<bool>,
    pub correlation_id: Option<String>,
    pub message_type: Option<String>,
    pub headers: Map<String, Value>,
    pub exchange_name: String,
    pub exchange: ExchangeSettings,
    pub assert_queue: bool,
}

impl QueueOptions {
    /// Resolve call options for `queue_name` against the bus settings.
    pub fn resolve(
        queue_name: &str,
        call: &CallOptions,
        settings: &BusSettings,
        codec: Arc<dyn Codec>,
    ) -> Self {
        let ack = call.wants_ack();

        Self {
            queue_name: queue_name.to_string(),
            routing_key: call.routing_key.clone(),
            queue_kind: QueueKind::Queue,
            ack,
            durable: ack,
            auto_delete: call.auto_delete.unwrap_or(!ack),
            exclusive: call.exclusive.unwrap_or(false),
            persistent: ack || call.persistent.unwrap_or(false),
            auto_delete_error_queue: call.auto_delete_error_queue.unwrap_or(false),
            content_type: call
                .content_type
                .clone()
                .unwrap_or_else(|| codec.content_type().to_string()),
            codec,
            max_retries: call.max_retries,
            namespace: call.namespace.clone(),
            set_retries_remaining: call.set_retries_remaining,
            correlation_id: call.correlation_id.clone(),
            message_type: call.message_type.clone(),
            headers: call.headers.clone().unwrap_or_default(),
            exchange_name: settings.exchange_name.clone(),
            exchange: settings.exchange.clone(),
            assert_queue: settings.assert_queues_on_first_send,
        }
    }

    /// Resolve with the default JSON codec.
    pub fn with_defaults(queue_name: &str, call: &CallOptions, settings: &BusSettings) -> Self {
        Self::resolve(queue_name, call, settings, Arc::new(JsonCodec))
    }

    /// Sibling dead-letter queue name.
    pub fn error_queue_name(&self) -> String {
        format!("{}.error", self.queue_name)
    }

    /// Routing target for sends and publishes.
    pub fn target(&self) -> &str {
        self.routing_key.as_deref().unwrap_or(&self.queue_name)
    }

    /// Properties attached to outgoing messages.
    pub fn properties(&self) -> MessageProperties {
        MessageProperties {
            content_type: Some(self.content_type.clone()),
            correlation_id: self.correlation_id.clone(),
            message_type: self.message_type.clone(),
            persistent: self.persistent,
            headers: self.headers.clone(),
        }
    }
}

impl fmt::Debug for QueueOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueOptions")
            .field("queue_name", &self.queue_name)
            .field("routing_key", &self.routing_key)
            .field("queue_kind", &self.queue_kind)
            .field("ack", &self.ack)
            .field("durable", &self.durable)
            .field("auto_delete", &self.auto_delete)
            .field("exclusive", &self.exclusive)
            .field("persistent", &self.persistent)
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}
