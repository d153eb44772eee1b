//! The `error` module defines the error type used throughout `servicebus`.
//!
//! Errors fall into four groups:
//! - **contract violations**: a handler misused its retry handle
//!   (`HandleAlreadyCalled`); returned immediately, before any I/O
//! - **transport/store errors**: declaration, publish and counter store
//!   failures; these are also emitted as bus `Error` events
//! - **capability misuse**: `ConfirmsNotEnabled`
//! - **handler failures**: errors and panics raised by application handlers

use thiserror::Error;

/// Errors produced by the bus, its middleware and its collaborators.
#[derive(Error, Debug)]
pub enum BusError {
    /// Configuration could not be loaded or deserialized
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// The transport rejected an operation
    #[error("Transport error: {0}")]
    Transport(String),

    /// A queue or exchange declaration was refused by the broker
    #[error("Failed to declare {name}: {reason}")]
    Declare { name: String, reason: String },

    /// Payload (de)serialization failed
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The redis counter store failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A counter store failed for a reason other than redis
    #[error("Store error: {0}")]
    Store(String),

    /// The correlator's queue map could not be read or written
    #[error("Persistence error: {0}")]
    Persistence(#[from] sled::Error),

    /// A retry handle method was called more often than allowed
    #[error("message type: {message_type} cid: {cid} handle already called with {method}")]
    HandleAlreadyCalled {
        message_type: String,
        cid: String,
        method: &'static str,
    },

    /// A confirmed send/publish was requested on a bus without confirms
    #[error("confirmed sends are only supported when the bus is created with enable_confirms")]
    ConfirmsNotEnabled,

    /// No queue is currently listening under the given name
    #[error("no queue currently listening at {0}")]
    NoListener(String),

    /// An application handler returned an error
    #[error("Handler error: {0}")]
    Handler(String),

    /// An application handler panicked
    #[error("Handler panicked: {0}")]
    HandlerPanicked(String),

    /// Shared state was poisoned by a panicking thread
    #[error("lock poisoned during {0}")]
    LockPoisoned(&'static str),

    /// The bus or transport has been closed
    #[error("bus is closed")]
    Closed,
}

impl BusError {
    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        BusError::Transport(message.into())
    }

    /// Create a handler error, typically returned from application callbacks
    pub fn handler(message: impl Into<String>) -> Self {
        BusError::Handler(message.into())
    }

    /// Create a declaration error for the named queue or exchange
    pub fn declare(name: impl Into<String>, reason: impl Into<String>) -> Self {
        BusError::Declare {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// A copy for fan-out to event observers. Variants wrapping foreign
    /// error types are carried over as their message.
    pub(crate) fn mirror(&self) -> BusError {
        match self {
            BusError::Transport(reason) => BusError::Transport(reason.clone()),
            BusError::Declare { name, reason } => BusError::declare(name.clone(), reason.clone()),
            BusError::HandleAlreadyCalled {
                message_type,
                cid,
                method,
            } => BusError::HandleAlreadyCalled {
                message_type: message_type.clone(),
                cid: cid.clone(),
                method: *method,
            },
            BusError::ConfirmsNotEnabled => BusError::ConfirmsNotEnabled,
            BusError::NoListener(queue) => BusError::NoListener(queue.clone()),
            BusError::Handler(reason) => BusError::Handler(reason.clone()),
            BusError::HandlerPanicked(reason) => BusError::HandlerPanicked(reason.clone()),
            BusError::LockPoisoned(what) => BusError::LockPoisoned(*what),
            BusError::Store(reason) => BusError::Store(reason.clone()),
            BusError::Closed => BusError::Closed,
            other => BusError::Store(other.to_string()),
        }
    }

    /// Whether this error signals a programming error in a handler
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, BusError::HandleAlreadyCalled { .. })
    }
}

pub type Result<T> = std::result::Result<T, BusError>;
