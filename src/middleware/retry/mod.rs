//! Bounded retry with dead-lettering for acknowledged queues.
//!
//! Every delivery on a queue listened to with `ack` gets a [`RetryHandle`].
//! Rejections are counted in a [`CounterStore`] under
//! `<namespace>-<cid>` (or just `<cid>`), so the count survives
//! redeliveries and, with [`RedisStore`], other processes.

pub mod handle;
pub mod memory_store;
pub mod redis_store;
pub mod store;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::RetrySettings;
use crate::middleware::{IncomingHandler, IncomingMessage, MessageContext, Middleware};
use crate::utils::Result;

pub use handle::RetryHandle;
pub use memory_store::MemoryStore;
pub use redis_store::RedisStore;
pub use store::CounterStore;

use handle::HandleParts;

#[derive(Clone)]
pub struct RetryMiddleware {
    store: Arc<dyn CounterStore>,
    max_retries: u32,
    namespace: Option<String>,
    set_retries_remaining: bool,
}

impl Default for RetryMiddleware {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default(), Arc::new(MemoryStore::new()))
    }
}

impl RetryMiddleware {
    /// Three retries, no namespace, in-process counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &RetrySettings, store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            max_retries: settings.max_retries,
            namespace: settings.namespace.clone(),
            set_retries_remaining: settings.set_retries_remaining,
        }
    }

    pub fn with_store(mut self, store: impl CounterStore + 'static) -> Self {
        self.store = Arc::new(store);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn set_retries_remaining(mut self, enabled: bool) -> Self {
        self.set_retries_remaining = enabled;
        self
    }

    pub fn into_middleware(self) -> Middleware {
        Middleware::new().with_incoming(self)
    }
}

pub fn retry() -> Middleware {
    RetryMiddleware::new().into_middleware()
}

fn namespaced(namespace: Option<&str>, cid: &str) -> String {
    match namespace {
        Some(namespace) => format!("{}-{}", namespace, cid),
        None => cid.to_string(),
    }
}

#[async_trait]
impl IncomingHandler for RetryMiddleware {
    async fn handle_incoming(
        &self,
        ctx: &mut MessageContext,
        mut incoming: IncomingMessage,
    ) -> Result<IncomingMessage> {
        if !incoming.options.ack {
            return Ok(incoming);
        }

        let options = &incoming.options;
        let max_retries = options.max_retries.unwrap_or(self.max_retries);
        let namespace = options.namespace.as_deref().or(self.namespace.as_deref());
        let cid = incoming
            .message
            .cid()
            .or_else(|| incoming.message.properties.correlation_id.clone())
            .unwrap_or_default();
        if cid.is_empty() {
            warn!(
                queue = %options.queue_name,
                "message has no cid or correlation id; retries share one counter (register correlate before retry)"
            );
        }
        let key = namespaced(namespace, &cid);

        if options
            .set_retries_remaining
            .unwrap_or(self.set_retries_remaining)
        {
            let remaining = if incoming.message.fields.redelivered {
                let count = self.store.get(&key).await?;
                i64::from(max_retries) - count as i64
            } else {
                i64::from(max_retries)
            };
            if let Value::Object(content) = &mut incoming.message.content {
                content.insert("retriesRemaining".to_string(), Value::from(remaining));
            }
        }

        debug!(cid = %cid, key = %key, max_retries, "instrumenting retry handle");
        incoming.message.handle = Some(RetryHandle::new(HandleParts {
            channel: incoming.channel.clone(),
            fields: incoming.message.fields.clone(),
            content: incoming.message.content.clone(),
            options: incoming.options.clone(),
            store: self.store.clone(),
            key,
            cid,
            max_retries,
            events: ctx.events(),
        }));
        Ok(incoming)
    }
}

#[cfg(test)]
mod tests;
