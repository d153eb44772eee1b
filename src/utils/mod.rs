//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `servicebus` crate.
//!
//! This module centralizes the error taxonomy shared by every layer and the
//! tracing bootstrap used by applications and tests.

pub mod error;
pub mod logging;

pub use error::{BusError, Result};
