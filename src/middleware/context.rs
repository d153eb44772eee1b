use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::bus::BusEvent;
use crate::message::Message;
use crate::utils::BusError;

/// Receives handler failures for one message instead of the bus error stream.
pub type ErrorSink = Arc<dyn Fn(&BusError, &Message) + Send + Sync>;

/// Per-message context threaded through every pipeline call.
///
/// Carries the correlation id of the work in progress, an optional error
/// sink installed by the `message_context` unit, and the owning bus's
/// event stream.
#[derive(Clone, Default)]
pub struct MessageContext {
    correlation_id: Option<String>,
    error_sink: Option<ErrorSink>,
    events: Option<broadcast::Sender<BusEvent>>,
}

impl MessageContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn for_bus(events: broadcast::Sender<BusEvent>) -> Self {
        Self {
            events: Some(events),
            ..Self::default()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn set_correlation_id(&mut self, correlation_id: impl Into<String>) {
        self.correlation_id = Some(correlation_id.into());
    }

    /// The context correlation id unless absent or `force_new`, else a fresh one.
    pub fn create_correlation_id(&self, force_new: bool) -> String {
        match &self.correlation_id {
            Some(cid) if !force_new => cid.clone(),
            _ => Uuid::new_v4().to_string(),
        }
    }

    pub fn set_error_sink(&mut self, sink: ErrorSink) {
        self.error_sink = Some(sink);
    }

    pub fn has_error_sink(&self) -> bool {
        self.error_sink.is_some()
    }

    pub(crate) fn events(&self) -> Option<broadcast::Sender<BusEvent>> {
        self.events.clone()
    }

    /// Emits `err` on the bus event stream.
    pub fn emit_error(&self, err: BusError) -> Arc<BusError> {
        let err = Arc::new(err);
        emit_error(self.events.as_ref(), err.clone());
        err
    }

    /// Routes a handler failure to the error sink, or to the bus when none is set.
    pub fn report_handler_error(&self, err: BusError, message: &Message) {
        match &self.error_sink {
            Some(sink) => sink(&err, message),
            None => {
                self.emit_error(err);
            }
        }
    }
}

pub(crate) fn emit_error(events: Option<&broadcast::Sender<BusEvent>>, err: Arc<BusError>) {
    match events {
        Some(events) if events.receiver_count() > 0 => {
            let _ = events.send(BusEvent::Error(err));
        }
        _ => warn!("Unobserved bus error: {}", err),
    }
}

impl fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageContext")
            .field("correlation_id", &self.correlation_id)
            .field("error_sink", &self.error_sink.is_some())
            .finish()
    }
}
