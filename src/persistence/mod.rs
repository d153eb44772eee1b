//! The `persistence` module stores the correlator's queue map.
//!
//! Each bus scope (a process, or a clustered worker) keeps its logical to
//! physical queue names in its own `sled` database so that restarts reuse
//! the queues created by previous runs.

pub mod sled_store;

pub use sled_store::{QueueMapStore, StoredMapping};
