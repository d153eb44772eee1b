use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::middleware::retry::CounterStore;
use crate::utils::{BusError, Result};

/// Process-local counters. Entries live until cleared.
#[derive(Debug, Default)]
pub struct MemoryStore {
    counts: Mutex<HashMap<String, u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<u64> {
        let counts = self
            .counts
            .lock()
            .map_err(|_| BusError::LockPoisoned("retry counters"))?;
        Ok(counts.get(key).copied().unwrap_or(0))
    }

    async fn increment(&self, key: &str) -> Result<u64> {
        let mut counts = self
            .counts
            .lock()
            .map_err(|_| BusError::LockPoisoned("retry counters"))?;
        let count = counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn clear(&self, key: &str) -> Result<()> {
        self.counts
            .lock()
            .map_err(|_| BusError::LockPoisoned("retry counters"))?
            .remove(key);
        Ok(())
    }
}
