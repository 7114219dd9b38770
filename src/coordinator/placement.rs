//! File-persona placement: FPG, VFS and IP allocation
//!
//! Every share lives in an FPG (capacity container) fronted by a VFS that
//! owns one IP address. This module hands out FPGs with spare share slots,
//! generates unique FPG/VFS names and reserves addresses from the backend's
//! configured pool. All bookkeeping is read-modify-write on KV records under
//! the owning record's lock.
//!
//! Capacity conditions (`FpgFull`, `NoDefaultFpg`, `PoolExhausted`) are
//! returned to the caller, which falls back to creating a fresh FPG.

use crate::backend::mediator::ArrayFpg;
use crate::common::{Error, Result};
use crate::coordinator::lock::{names, LockManager};
use crate::coordinator::metadata::{BackendMetadata, FpgMetadata, MetadataStore};
use rand::seq::IteratorRandom;
use std::collections::BTreeSet;
use std::sync::Arc;

pub struct PoolAllocator {
    backend: String,
    meta: Arc<MetadataStore>,
    locks: Arc<LockManager>,
    ip_pool: Vec<String>,
    netmask: String,
}

impl PoolAllocator {
    pub fn new(
        backend: impl Into<String>,
        meta: Arc<MetadataStore>,
        locks: Arc<LockManager>,
        ip_pool: Vec<String>,
        netmask: impl Into<String>,
    ) -> Self {
        Self {
            backend: backend.into(),
            meta,
            locks,
            ip_pool,
            netmask: netmask.into(),
        }
    }

    pub fn netmask(&self) -> &str {
        &self.netmask
    }

    /// Backend metadata, bootstrapped empty on first use
    async fn load_backend_metadata(&self) -> Result<BackendMetadata> {
        match self.meta.get_backend_metadata(&self.backend).await? {
            Some(meta) => Ok(meta),
            None => {
                tracing::info!("Bootstrapping allocator metadata for backend {}", self.backend);
                Ok(BackendMetadata::default())
            }
        }
    }

    /// Read-modify-write of the backend metadata under the backend lock
    async fn update_backend_metadata<T, F>(&self, update: F) -> Result<T>
    where
        F: FnOnce(&mut BackendMetadata) -> Result<T> + Send,
        T: Send,
    {
        self.locks
            .with_lock(&names::backend(&self.backend), async {
                let mut meta = self.load_backend_metadata().await?;
                let value = update(&mut meta)?;
                self.meta.put_backend_metadata(&self.backend, &meta).await?;
                Ok(value)
            })
            .await
    }

    /// The CPG's default FPG, provided it still has room for a share
    pub async fn get_default_fpg(&self, cpg: &str) -> Result<FpgMetadata> {
        let backend_meta = self
            .meta
            .get_backend_metadata(&self.backend)
            .await?
            .ok_or_else(|| Error::NoDefaultFpg(cpg.to_string()))?;
        let fpg_name = backend_meta
            .default_fpgs
            .get(cpg)
            .ok_or_else(|| Error::NoDefaultFpg(cpg.to_string()))?;

        let fpg = match self.meta.get_fpg(&self.backend, cpg, fpg_name).await? {
            Some(fpg) => fpg,
            None => {
                tracing::warn!(
                    "Default FPG {} of CPG {} has no metadata, ignoring it",
                    fpg_name,
                    cpg
                );
                return Err(Error::NoDefaultFpg(cpg.to_string()));
            }
        };

        if fpg.is_full() {
            return Err(Error::FpgFull {
                fpg: fpg.fpg,
                limit: crate::coordinator::metadata::MAX_SHARES_PER_FPG,
            });
        }
        Ok(fpg)
    }

    /// Name of the CPG's default FPG, full or not
    pub async fn default_fpg_name(&self, cpg: &str) -> Result<Option<String>> {
        Ok(self
            .meta
            .get_backend_metadata(&self.backend)
            .await?
            .and_then(|meta| meta.default_fpgs.get(cpg).cloned()))
    }

    /// Bump the backend counter and derive the next FPG/VFS name pair
    pub async fn generate_fpg_vfs_names(&self) -> Result<(String, String)> {
        let n = self
            .update_backend_metadata(|meta| {
                meta.counter += 1;
                Ok(meta.counter)
            })
            .await?;
        Ok((format!("Fpg_{}", n), format!("Vfs_{}", n)))
    }

    /// Reserve a free pool address not already bound on the array
    pub async fn claim_ip(&self, live_assigned: &[String]) -> Result<String> {
        let backend = self.backend.clone();
        let pool = &self.ip_pool;
        self.update_backend_metadata(move |meta| {
            let taken: BTreeSet<&String> = meta
                .ips_in_use
                .iter()
                .chain(meta.ips_locked_for_use.iter())
                .chain(live_assigned.iter())
                .collect();
            let ip = {
                let mut rng = rand::thread_rng();
                pool.iter()
                    .filter(|ip| !taken.contains(ip))
                    .choose(&mut rng)
                    .cloned()
            };
            let ip = ip.ok_or(Error::PoolExhausted(backend))?;
            meta.ips_locked_for_use.insert(ip.clone());
            Ok(ip)
        })
        .await
        .inspect(|ip| tracing::info!("Reserved IP {} on backend {}", ip, self.backend))
    }

    /// Promote a reserved address once its VFS exists
    pub async fn mark_ip_in_use(&self, ip: &str) -> Result<()> {
        self.update_backend_metadata(|meta| {
            meta.ips_locked_for_use.remove(ip);
            meta.ips_in_use.insert(ip.to_string());
            Ok(())
        })
        .await
    }

    /// Return an address to the pool, whether reserved or in use
    pub async fn release_ip(&self, ip: &str) -> Result<()> {
        self.update_backend_metadata(|meta| {
            meta.ips_locked_for_use.remove(ip);
            meta.ips_in_use.remove(ip);
            Ok(())
        })
        .await?;
        tracing::info!("Released IP {} on backend {}", ip, self.backend);
        Ok(())
    }

    /// Persist FPG metadata, optionally making it the CPG's default
    pub async fn register_fpg(&self, fpg: &FpgMetadata, make_default: bool) -> Result<()> {
        self.meta.put_fpg(&self.backend, fpg).await?;
        if make_default {
            self.update_backend_metadata(|meta| {
                meta.default_fpgs.insert(fpg.cpg.clone(), fpg.fpg.clone());
                Ok(())
            })
            .await?;
            tracing::info!("FPG {} is now the default for CPG {}", fpg.fpg, fpg.cpg);
        }
        Ok(())
    }

    /// Drop FPG metadata and any default pointing at it
    pub async fn forget_fpg(&self, cpg: &str, fpg: &str) -> Result<()> {
        self.meta.delete_fpg(&self.backend, cpg, fpg).await?;
        self.update_backend_metadata(|meta| {
            if meta.default_fpgs.get(cpg).map(String::as_str) == Some(fpg) {
                meta.default_fpgs.remove(cpg);
            }
            Ok(())
        })
        .await
    }

    async fn update_share_count(&self, cpg: &str, fpg: &str, delta: i64) -> Result<FpgMetadata> {
        self.locks
            .with_lock(&names::fpg(&self.backend, cpg, fpg), async {
                let mut meta = self
                    .meta
                    .get_fpg(&self.backend, cpg, fpg)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("fpg {}", fpg)))?;

                if delta > 0 {
                    if meta.is_full() {
                        return Err(Error::FpgFull {
                            fpg: fpg.to_string(),
                            limit: crate::coordinator::metadata::MAX_SHARES_PER_FPG,
                        });
                    }
                    meta.share_cnt += 1;
                } else {
                    meta.share_cnt = meta.share_cnt.saturating_sub(1);
                }
                meta.reached_full_capacity = meta.is_full();

                self.meta.put_fpg(&self.backend, &meta).await?;
                Ok(meta)
            })
            .await
    }

    /// Take a share slot; `FpgFull` once the FPG hosts the maximum
    pub async fn increment_share_count(&self, cpg: &str, fpg: &str) -> Result<FpgMetadata> {
        self.update_share_count(cpg, fpg, 1).await
    }

    /// Give a share slot back; never goes below zero
    pub async fn decrement_share_count(&self, cpg: &str, fpg: &str) -> Result<FpgMetadata> {
        self.update_share_count(cpg, fpg, -1).await
    }

    /// Track an FPG created outside volplane. Its CPG must match the request.
    pub async fn adopt_legacy_fpg(&self, array_fpg: &ArrayFpg, cpg: &str) -> Result<FpgMetadata> {
        if array_fpg.cpg != cpg {
            return Err(Error::InvariantViolation(format!(
                "FPG {} belongs to CPG {}, not {}",
                array_fpg.name, array_fpg.cpg, cpg
            )));
        }
        if let Some(existing) = self.meta.get_fpg(&self.backend, cpg, &array_fpg.name).await? {
            return Ok(existing);
        }

        let (vfs, ip) = array_fpg.vfs.clone().ok_or_else(|| {
            Error::InvariantViolation(format!("FPG {} has no VFS", array_fpg.name))
        })?;
        let mut fpg = FpgMetadata::new(&array_fpg.name, cpg, array_fpg.size_tib, vfs);
        fpg.ips.insert(self.netmask.clone(), vec![ip]);
        fpg.legacy = true;
        self.register_fpg(&fpg, false).await?;
        tracing::info!("Adopted legacy FPG {} on backend {}", fpg.fpg, self.backend);
        Ok(fpg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{KvStore, LockConfig, MemStore};
    use crate::coordinator::metadata::MAX_SHARES_PER_FPG;

    fn allocator(pool: &[&str]) -> PoolAllocator {
        let kv: Arc<dyn KvStore> = Arc::new(MemStore::new());
        let meta = Arc::new(MetadataStore::new(kv.clone()));
        let locks = Arc::new(LockManager::new(kv, "locks", "node-a", &LockConfig::default()));
        PoolAllocator::new(
            "b1",
            meta,
            locks,
            pool.iter().map(|s| s.to_string()).collect(),
            "255.255.255.0",
        )
    }

    #[tokio::test]
    async fn test_names_are_unique_and_monotonic() {
        let alloc = allocator(&[]);
        assert_eq!(
            alloc.generate_fpg_vfs_names().await.unwrap(),
            ("Fpg_1".to_string(), "Vfs_1".to_string())
        );
        assert_eq!(
            alloc.generate_fpg_vfs_names().await.unwrap(),
            ("Fpg_2".to_string(), "Vfs_2".to_string())
        );
    }

    #[tokio::test]
    async fn test_no_default_fpg() {
        let alloc = allocator(&[]);
        assert!(matches!(
            alloc.get_default_fpg("cpg").await,
            Err(Error::NoDefaultFpg(_))
        ));
    }

    #[tokio::test]
    async fn test_claim_ip_skips_taken_addresses() {
        let alloc = allocator(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let live = vec!["10.0.0.1".to_string()];

        let first = alloc.claim_ip(&live).await.unwrap();
        let second = alloc.claim_ip(&live).await.unwrap();
        assert_ne!(first, second);
        assert_ne!(first, "10.0.0.1");
        assert_ne!(second, "10.0.0.1");
        assert!(matches!(
            alloc.claim_ip(&live).await,
            Err(Error::PoolExhausted(_))
        ));

        alloc.mark_ip_in_use(&first).await.unwrap();
        let meta = alloc.meta.get_backend_metadata("b1").await.unwrap().unwrap();
        assert!(meta.ips_in_use.contains(&first));
        assert!(!meta.ips_locked_for_use.contains(&first));
        assert!(meta.ips_locked_for_use.contains(&second));

        alloc.release_ip(&second).await.unwrap();
        assert_eq!(alloc.claim_ip(&live).await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_share_count_bounds() {
        let alloc = allocator(&[]);
        let fpg = FpgMetadata::new("Fpg_1", "cpg", 16, "Vfs_1");
        alloc.register_fpg(&fpg, true).await.unwrap();

        for _ in 0..MAX_SHARES_PER_FPG {
            alloc.increment_share_count("cpg", "Fpg_1").await.unwrap();
        }
        let full = alloc.meta.get_fpg("b1", "cpg", "Fpg_1").await.unwrap().unwrap();
        assert_eq!(full.share_cnt, MAX_SHARES_PER_FPG);
        assert!(full.reached_full_capacity);

        assert!(matches!(
            alloc.increment_share_count("cpg", "Fpg_1").await,
            Err(Error::FpgFull { .. })
        ));
        assert!(matches!(
            alloc.get_default_fpg("cpg").await,
            Err(Error::FpgFull { .. })
        ));

        let after = alloc.decrement_share_count("cpg", "Fpg_1").await.unwrap();
        assert_eq!(after.share_cnt, MAX_SHARES_PER_FPG - 1);
        assert!(!after.reached_full_capacity);
        assert_eq!(alloc.get_default_fpg("cpg").await.unwrap().fpg, "Fpg_1");
    }

    #[tokio::test]
    async fn test_decrement_never_negative() {
        let alloc = allocator(&[]);
        alloc
            .register_fpg(&FpgMetadata::new("Fpg_1", "cpg", 16, "Vfs_1"), false)
            .await
            .unwrap();
        let meta = alloc.decrement_share_count("cpg", "Fpg_1").await.unwrap();
        assert_eq!(meta.share_cnt, 0);
    }

    #[tokio::test]
    async fn test_forget_fpg_clears_default() {
        let alloc = allocator(&[]);
        alloc
            .register_fpg(&FpgMetadata::new("Fpg_1", "cpg", 16, "Vfs_1"), true)
            .await
            .unwrap();
        assert_eq!(
            alloc.default_fpg_name("cpg").await.unwrap().as_deref(),
            Some("Fpg_1")
        );
        alloc.forget_fpg("cpg", "Fpg_1").await.unwrap();
        assert_eq!(alloc.default_fpg_name("cpg").await.unwrap(), None);
        assert!(matches!(
            alloc.get_default_fpg("cpg").await,
            Err(Error::NoDefaultFpg(_))
        ));
    }

    #[tokio::test]
    async fn test_adopt_legacy_fpg_checks_cpg() {
        let alloc = allocator(&[]);
        let array_fpg = ArrayFpg {
            name: "legacy".into(),
            cpg: "other".into(),
            size_tib: 4,
            vfs: Some(("legacy_vfs".into(), "10.1.1.1".into())),
        };
        assert!(matches!(
            alloc.adopt_legacy_fpg(&array_fpg, "cpg").await,
            Err(Error::InvariantViolation(_))
        ));

        let adopted = alloc.adopt_legacy_fpg(&array_fpg, "other").await.unwrap();
        assert!(adopted.legacy);
        assert_eq!(adopted.first_ip(), Some("10.1.1.1"));
    }
}
