//! KV store client abstraction
//!
//! The shared key-value store is the single source of truth for every
//! record the orchestrator owns. Supports an in-memory backend (tests,
//! single-host runs) and sled.

use crate::common::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::common::config::{KvBackend, KvConfig};

/// Trait for key-value storage backends
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Deleting a missing key is not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// Atomic create; `Error::AlreadyExists` if the key is present
    async fn create_if_absent(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Values of every key starting with `prefix`, in key order
    async fn list(&self, prefix: &str) -> Result<Vec<Vec<u8>>>;
}

/// In-memory store (default)
pub struct MemStore {
    map: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.map.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.map.lock().remove(key);
        Ok(())
    }

    async fn create_if_absent(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut map = self.map.lock();
        if map.contains_key(key) {
            return Err(Error::AlreadyExists(key.to_string()));
        }
        map.insert(key.to_string(), value);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .map
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v.clone())
            .collect())
    }
}

/// Sled store
#[cfg(feature = "sled-backend")]
pub struct SledStore {
    db: sled::Db,
}

#[cfg(feature = "sled-backend")]
impl SledStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }
}

#[cfg(feature = "sled-backend")]
#[async_trait]
impl KvStore for SledStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?.map(|ivec| ivec.to_vec()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.db.insert(key, value)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.db.remove(key)?;
        Ok(())
    }

    async fn create_if_absent(&self, key: &str, value: Vec<u8>) -> Result<()> {
        match self
            .db
            .compare_and_swap(key, None as Option<&[u8]>, Some(value))?
        {
            Ok(()) => Ok(()),
            Err(_) => Err(Error::AlreadyExists(key.to_string())),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Vec<u8>>> {
        let mut values = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (_, value) = item?;
            values.push(value.to_vec());
        }
        Ok(values)
    }
}

/// Build the configured store
pub fn open_store(config: &KvConfig) -> Result<Arc<dyn KvStore>> {
    match config.backend {
        #[cfg(feature = "sled-backend")]
        KvBackend::Sled => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| Error::InvalidConfig("kv.path is required for sled".into()))?;
            Ok(Arc::new(SledStore::open(path)?))
        }
        #[cfg(not(feature = "sled-backend"))]
        KvBackend::Sled => Err(Error::InvalidConfig(
            "built without the sled-backend feature".into(),
        )),
        KvBackend::Memory => Ok(Arc::new(MemStore::new())),
    }
}
