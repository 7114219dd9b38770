//! Shared setup: orchestrators on simulated nodes over one KV store

#![allow(dead_code)]

use std::sync::Arc;
use volplane::backend::sim::{SimulatedArray, SimulatedFabric, SimulatedHost};
use volplane::common::{BackendConfig, Config, DriverKind, KvStore, MemStore};
use volplane::coordinator::metadata::MetadataStore;
use volplane::Orchestrator;

pub struct Cluster {
    pub kv: Arc<dyn KvStore>,
    pub fabric: Arc<SimulatedFabric>,
    pub backends: Vec<BackendConfig>,
    pub conflict_delay_secs: u64,
}

pub struct Node {
    pub orch: Orchestrator,
    pub host: Arc<SimulatedHost>,
}

impl Cluster {
    pub fn new(backends: Vec<BackendConfig>) -> Self {
        Self {
            kv: Arc::new(MemStore::new()),
            fabric: Arc::new(SimulatedFabric::new()),
            backends,
            conflict_delay_secs: 5,
        }
    }

    pub fn config(&self, node_id: &str) -> Config {
        let mut config = Config::default();
        config.node_id = node_id.to_string();
        config.fencing.mount_conflict_delay_secs = self.conflict_delay_secs;
        config.fencing.poll_interval_ms = 1000;
        config.locks.acquire_timeout_secs = 120;
        config.locks.retry_interval_ms = 100;
        config.backends = self.backends.clone();
        config
    }

    /// Start an orchestrator for `node_id` and wait for its backends
    pub async fn node(&self, node_id: &str) -> Node {
        let host = Arc::new(SimulatedHost::new(format!("iqn.sim:{}", node_id)));
        let orch = Orchestrator::start(
            self.config(node_id),
            self.kv.clone(),
            host.clone(),
            self.fabric.clone(),
        );
        orch.wait_ready().await;
        Node { orch, host }
    }

    pub fn array(&self, name: &str) -> Arc<SimulatedArray> {
        self.fabric.array(name)
    }

    pub fn metadata(&self) -> MetadataStore {
        MetadataStore::new(self.kv.clone())
    }
}

pub fn block_backend(name: &str) -> BackendConfig {
    BackendConfig::new(name, DriverKind::Iscsi)
}

pub fn file_backend(name: &str, pool: Vec<String>) -> BackendConfig {
    let mut backend = BackendConfig::new(name, DriverKind::File);
    backend.ip_pool = pool;
    backend
}

/// `count` addresses from 10.0.0.1 up
pub fn ip_pool(count: usize) -> Vec<String> {
    (1..=count).map(|n| format!("10.0.0.{}", n)).collect()
}
