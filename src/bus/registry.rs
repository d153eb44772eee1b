use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::bus::Bus;
use crate::utils::Result;

/// Buses shared by name within a process.
///
/// The first lookup of a name connects a bus; later lookups return it.
#[derive(Default)]
pub struct BusRegistry {
    buses: Mutex<HashMap<String, Arc<Bus>>>,
}

impl BusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the bus registered as `name`, creating it with `connect`
    /// when absent. A failed `connect` registers nothing.
    pub async fn named<F, Fut>(&self, name: &str, connect: F) -> Result<Arc<Bus>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<Bus>>>,
    {
        let mut buses = self.buses.lock().await;
        if let Some(bus) = buses.get(name) {
            return Ok(bus.clone());
        }
        debug!(bus = %name, "creating named bus");
        let bus = connect().await?;
        buses.insert(name.to_string(), bus.clone());
        Ok(bus)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Bus>> {
        self.buses.lock().await.get(name).cloned()
    }

    /// Forgets the named bus, returning it so the caller can close it.
    pub async fn remove(&self, name: &str) -> Option<Arc<Bus>> {
        self.buses.lock().await.remove(name)
    }
}
