//! The `bus` module is the public face of `servicebus`.
//!
//! - [`Bus`]: send/listen, publish/subscribe and middleware registration
//! - [`BusRegistry`]: process-wide named buses
//! - [`BusEvent`]: lifecycle and error notifications
//! - [`SubscribeReceipt`]: handle to cancel one subscription

pub mod engine;
pub mod events;
pub mod receipt;
pub mod registry;

pub use engine::Bus;
pub use events::BusEvent;
pub use receipt::SubscribeReceipt;
pub use registry::BusRegistry;

#[cfg(test)]
mod tests;
