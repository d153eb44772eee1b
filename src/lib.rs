//! # ServiceBus
//!
//! `servicebus` is a messaging layer over an AMQP-style broker. It offers
//! point-to-point queues (`send`/`listen`) and topic publish/subscribe
//! (`publish`/`subscribe`) behind one [`Bus`], with a middleware pipeline
//! around every message.
//!
//! ## Core Modules
//!
//! The library is structured into several modules, each with a distinct responsibility:
//!
//! - `bus`: The public facade, named buses and lifecycle events.
//! - `config`: Handles loading and managing bus configuration.
//! - `correlator`: Stable physical queue names for subscriptions, persisted across restarts.
//! - `message`: Messages, per-call and resolved queue options, payload codecs.
//! - `middleware`: The bidirectional pipeline and its built-in units, including retry.
//! - `persistence`: The on-disk queue map backing the correlator.
//! - `queue`: Lifecycle managers for queues and topic subscriptions.
//! - `transport`: Broker abstraction and an in-memory broker.
//! - `utils`: Shared utilities, such as error handling and logging.

pub mod bus;
pub mod config;
pub mod correlator;
pub mod message;
pub mod middleware;
pub mod persistence;
pub mod queue;
pub mod transport;
pub mod utils;

pub use bus::{Bus, BusEvent, BusRegistry, SubscribeReceipt};
pub use message::{CallOptions, Message};
pub use middleware::Middleware;
pub use queue::Received;
pub use utils::{BusError, Result};

#[cfg(test)]
mod tests;
