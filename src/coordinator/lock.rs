//! Distributed named locks over the shared KV store
//!
//! A lock is a single key created with the store's atomic
//! create-if-absent and removed on unlock. Locks are not reentrant and have
//! no lease: a holder that dies leaves the key in place until an operator
//! removes it.
//!
//! Whenever an operation needs more than one lock, it takes them in the
//! order given by [`names`]: source volume before clone target, CPG before
//! FPG, FPG before backend metadata.

use crate::common::{encode_key, timestamp_now, Error, KvStore, LockConfig, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Value stored under a held lock key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEntry {
    pub holder: String,
    pub acquired_at: u64,
}

/// Canonical lock names
pub mod names {
    pub fn volume(name: &str) -> String {
        format!("volume:{}", name)
    }

    pub fn share(name: &str) -> String {
        format!("share:{}", name)
    }

    pub fn backend(backend: &str) -> String {
        format!("backend:{}", backend)
    }

    pub fn cpg(backend: &str, cpg: &str) -> String {
        format!("cpg:{}:{}", backend, cpg)
    }

    pub fn fpg(backend: &str, cpg: &str, fpg: &str) -> String {
        format!("fpg:{}:{}:{}", backend, cpg, fpg)
    }

    pub fn rcg(backend: &str, rcg: &str) -> String {
        format!("rcg:{}:{}", backend, rcg)
    }
}

pub struct LockManager {
    kv: Arc<dyn KvStore>,
    namespace: String,
    holder: String,
    retry_interval: Duration,
    acquire_timeout: Duration,
}

impl LockManager {
    pub fn new(
        kv: Arc<dyn KvStore>,
        namespace: impl Into<String>,
        holder: impl Into<String>,
        config: &LockConfig,
    ) -> Self {
        Self {
            kv,
            namespace: namespace.into(),
            holder: holder.into(),
            retry_interval: config.retry_interval(),
            acquire_timeout: config.acquire_timeout(),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}/{}", self.namespace, encode_key(name))
    }

    /// Take the lock or fail immediately with `Error::Busy`
    pub async fn try_lock(&self, name: &str) -> Result<()> {
        let entry = LockEntry {
            holder: self.holder.clone(),
            acquired_at: timestamp_now(),
        };
        let value = serde_json::to_vec(&entry)?;

        match self.kv.create_if_absent(&self.key(name), value).await {
            Ok(()) => {
                tracing::debug!("Lock {} acquired by {}", name, self.holder);
                Ok(())
            }
            Err(Error::AlreadyExists(_)) => Err(Error::Busy(name.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Release the lock. Unlocking a free name is not an error.
    pub async fn unlock(&self, name: &str) -> Result<()> {
        self.kv.delete(&self.key(name)).await?;
        tracing::debug!("Lock {} released by {}", name, self.holder);
        Ok(())
    }

    /// Current holder, if any
    pub async fn holder_of(&self, name: &str) -> Result<Option<LockEntry>> {
        match self.kv.get(&self.key(name)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Poll `try_lock` until it succeeds or the acquire timeout elapses
    pub async fn acquire(&self, name: &str) -> Result<()> {
        let deadline = Instant::now() + self.acquire_timeout;
        loop {
            match self.try_lock(name).await {
                Ok(()) => return Ok(()),
                Err(Error::Busy(_)) if Instant::now() < deadline => {
                    tokio::time::sleep(self.retry_interval).await;
                }
                Err(Error::Busy(_)) => {
                    return Err(Error::Timeout(format!("waiting for lock {}", name)))
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Acquire every name in order; on failure, release what was taken
    pub async fn acquire_ordered(&self, names: &[String]) -> Result<()> {
        for (idx, name) in names.iter().enumerate() {
            if let Err(e) = self.acquire(name).await {
                self.release_all(&names[..idx]).await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Unlock, logging rather than surfacing failures
    pub async fn release(&self, name: &str) {
        if let Err(e) = self.unlock(name).await {
            tracing::warn!("Failed to release lock {}: {}", name, e);
        }
    }

    /// Release in reverse acquisition order
    pub async fn release_all(&self, names: &[String]) {
        for name in names.iter().rev() {
            self.release(name).await;
        }
    }

    /// Run `fut` while holding `name` (waiting acquire)
    pub async fn with_lock<T, F>(&self, name: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.acquire(name).await?;
        let result = fut.await;
        self.release(name).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::MemStore;

    fn manager(kv: Arc<dyn KvStore>, holder: &str) -> LockManager {
        let config = LockConfig {
            acquire_timeout_secs: 1,
            retry_interval_ms: 100,
        };
        LockManager::new(kv, "locks", holder, &config)
    }

    #[tokio::test]
    async fn test_try_lock_is_exclusive() {
        let kv: Arc<dyn KvStore> = Arc::new(MemStore::new());
        let a = manager(kv.clone(), "node-a");
        let b = manager(kv, "node-b");

        a.try_lock("volume:v1").await.unwrap();
        assert!(matches!(b.try_lock("volume:v1").await, Err(Error::Busy(_))));
        assert_eq!(b.holder_of("volume:v1").await.unwrap().unwrap().holder, "node-a");

        a.unlock("volume:v1").await.unwrap();
        b.try_lock("volume:v1").await.unwrap();
    }

    #[tokio::test]
    async fn test_not_reentrant() {
        let kv: Arc<dyn KvStore> = Arc::new(MemStore::new());
        let a = manager(kv, "node-a");
        a.try_lock("x").await.unwrap();
        assert!(matches!(a.try_lock("x").await, Err(Error::Busy(_))));
    }

    #[tokio::test]
    async fn test_unlock_unheld_is_ok() {
        let kv: Arc<dyn KvStore> = Arc::new(MemStore::new());
        let a = manager(kv, "node-a");
        a.unlock("never-held").await.unwrap();
        a.unlock("never-held").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out() {
        let kv: Arc<dyn KvStore> = Arc::new(MemStore::new());
        let a = manager(kv.clone(), "node-a");
        let b = manager(kv, "node-b");

        a.try_lock("x").await.unwrap();
        assert!(matches!(b.acquire("x").await, Err(Error::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_release() {
        let kv: Arc<dyn KvStore> = Arc::new(MemStore::new());
        let a = Arc::new(manager(kv.clone(), "node-a"));
        let b = manager(kv, "node-b");

        a.try_lock("x").await.unwrap();
        let releaser = a.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            releaser.unlock("x").await.unwrap();
        });

        b.acquire("x").await.unwrap();
        assert_eq!(b.holder_of("x").await.unwrap().unwrap().holder, "node-b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_ordered_rolls_back() {
        let kv: Arc<dyn KvStore> = Arc::new(MemStore::new());
        let a = manager(kv.clone(), "node-a");
        let b = manager(kv, "node-b");

        b.try_lock("fpg:b1:cpg:Fpg_1").await.unwrap();
        let order = vec![names::cpg("b1", "cpg"), names::fpg("b1", "cpg", "Fpg_1")];
        assert!(a.acquire_ordered(&order).await.is_err());

        // The CPG lock taken first must have been released again
        assert!(a.holder_of(&order[0]).await.unwrap().is_none());
    }
}
