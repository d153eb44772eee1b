use async_trait::async_trait;

use crate::utils::Result;

/// Keyed reject counters shared by redeliveries of the same message.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current count, zero when the key is absent.
    async fn get(&self, key: &str) -> Result<u64>;

    /// Adds one and returns the new count.
    async fn increment(&self, key: &str) -> Result<u64>;

    async fn clear(&self, key: &str) -> Result<()>;
}
