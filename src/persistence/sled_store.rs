use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, Weak};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::utils::{BusError, Result};

const QUEUES_TREE: &str = "queues";

/// Stores opened in this process, keyed by resolved path. sled locks its
/// directory, so every correlator on one path must share the handle.
static OPEN_STORES: LazyLock<Mutex<HashMap<PathBuf, Weak<QueueMapStore>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredMapping {
    pub physical: String,
    pub created_at: i64,
}

/// Logical to physical queue name map backed by `sled`.
#[derive(Clone)]
pub struct QueueMapStore {
    db: Db,
    tree: Tree,
    path: PathBuf,
}

impl QueueMapStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let db = sled::open(&path)?;
        let tree = db.open_tree(QUEUES_TREE)?;
        Ok(Self { db, tree, path })
    }

    /// The store for `path`, reusing the handle another owner in this
    /// process already holds.
    pub fn shared(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref();
        let key = resolved(path);
        let mut stores = OPEN_STORES
            .lock()
            .map_err(|_| BusError::LockPoisoned("open queue maps"))?;
        if let Some(store) = stores.get(&key).and_then(Weak::upgrade) {
            return Ok(store);
        }
        let store = Arc::new(Self::open(path)?);
        stores.retain(|_, store| store.strong_count() > 0);
        stores.insert(key, Arc::downgrade(&store));
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every stored mapping. Entries that fail to decode are skipped.
    pub fn load(&self) -> Result<HashMap<String, String>> {
        let mut queues = HashMap::new();
        for entry in self.tree.iter() {
            let (key, value) = entry?;
            let Ok(logical) = String::from_utf8(key.to_vec()) else {
                continue;
            };
            if let Ok(mapping) = serde_json::from_slice::<StoredMapping>(&value) {
                queues.insert(logical, mapping.physical);
            }
        }
        Ok(queues)
    }

    pub fn get(&self, logical: &str) -> Result<Option<StoredMapping>> {
        match self.tree.get(logical)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Records `physical` for `logical` unless a mapping exists, returning
    /// the name that is stored afterwards. Not flushed; see [`Self::flush`].
    pub fn claim(&self, logical: &str, physical: &str) -> Result<String> {
        let mapping = StoredMapping {
            physical: physical.to_string(),
            created_at: Utc::now().timestamp(),
        };
        let value = serde_json::to_vec(&mapping)?;
        match self
            .tree
            .compare_and_swap(logical, None as Option<&[u8]>, Some(value))?
        {
            Ok(()) => Ok(physical.to_string()),
            Err(conflict) => match conflict.current {
                Some(current) => Ok(serde_json::from_slice::<StoredMapping>(&current)?.physical),
                None => Ok(physical.to_string()),
            },
        }
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

/// `path` with its parent directory canonicalized, so spellings of one
/// location share a key even before the store exists on disk.
fn resolved(path: &Path) -> PathBuf {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    match (std::fs::canonicalize(parent), path.file_name()) {
        (Ok(parent), Some(name)) => parent.join(name),
        _ => path.to_path_buf(),
    }
}

impl std::fmt::Debug for QueueMapStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueMapStore")
            .field("db", &"sled::Db")
            .field("path", &self.path)
            .finish()
    }
}
