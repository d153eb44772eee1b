//! Stable physical queue names for logical subscriptions.
//!
//! A subscription without a routing key gets `<logical>.<uuid>` the first
//! time it is seen; later subscriptions with the same logical name, in this
//! process or a restarted one sharing the same map file, reuse that name.
//! Subscriptions with a routing key are named after the logical name and
//! never touch the map.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::BusSettings;
use crate::message::QueueOptions;
use crate::persistence::QueueMapStore;
use crate::utils::{BusError, Result};

#[derive(Debug)]
pub struct Correlator {
    queues: Mutex<HashMap<String, String>>,
    store: Option<Arc<QueueMapStore>>,
    path: PathBuf,
}

impl Correlator {
    /// Opens the queue map for the scope described by `settings`.
    ///
    /// A map that cannot be opened only costs durability: the correlator
    /// keeps working in memory.
    pub fn new(settings: &BusSettings) -> Self {
        Self::open(Self::store_path(settings))
    }

    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (store, queues) = match QueueMapStore::shared(&path) {
            Ok(store) => match store.load() {
                Ok(queues) => (Some(store), queues),
                Err(err) => {
                    warn!(path = %path.display(), "Failed to read queue map: {}", err);
                    (Some(store), HashMap::new())
                }
            },
            Err(err) => {
                warn!(path = %path.display(), "Failed to open queue map, names will not persist: {}", err);
                (None, HashMap::new())
            }
        };
        debug!(path = %path.display(), known = queues.len(), "Correlator ready");

        Self {
            queues: Mutex::new(queues),
            store,
            path,
        }
    }

    /// Where the queue map lives: `queues_file` when configured, otherwise
    /// a per-worker file for clustered workers, otherwise `.queues`, all
    /// relative to the working directory.
    pub fn store_path(settings: &BusSettings) -> PathBuf {
        let file = match (&settings.queues_file, &settings.worker_id) {
            (Some(file), _) => file.clone(),
            (None, Some(worker)) => {
                warn!(
                    worker = %worker,
                    "Clustered worker without a queues_file; set one such as '.queues.worker.<n>' to keep subscription names stable"
                );
                format!(".queues.worker.{}", worker)
            }
            (None, None) => ".queues".to_string(),
        };
        std::env::current_dir()
            .map(|dir| dir.join(&file))
            .unwrap_or_else(|_| PathBuf::from(file))
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Physical queue name for `options`.
    pub async fn resolve(&self, options: &QueueOptions) -> Result<String> {
        self.queue_name(&options.queue_name, options.routing_key.as_deref())
            .await
    }

    pub async fn queue_name(&self, logical: &str, routing_key: Option<&str>) -> Result<String> {
        if routing_key.is_some() {
            return Ok(logical.to_string());
        }

        let minted = {
            let mut queues = self
                .queues
                .lock()
                .map_err(|_| BusError::LockPoisoned("correlator queues"))?;
            if let Some(existing) = queues.get(logical) {
                return Ok(existing.clone());
            }
            let candidate = format!("{}.{}", logical, Uuid::new_v4());
            // Another correlator sharing the map may have named it first.
            let physical = match &self.store {
                Some(store) => store.claim(logical, &candidate).unwrap_or_else(|err| {
                    warn!(path = %self.path.display(), "Failed to record queue name: {}", err);
                    candidate
                }),
                None => candidate,
            };
            queues.insert(logical.to_string(), physical.clone());
            physical
        };

        debug!(logical = %logical, physical = %minted, "Resolved queue name");
        if let Some(store) = &self.store {
            if let Err(err) = store.flush().await {
                warn!(path = %self.path.display(), "Failed to persist queue map: {}", err);
            }
        }
        Ok(minted)
    }
}
