//! Orchestrator: the entry point for volume and share requests

use crate::backend::driver::{CreateOptions, CreateOutcome, EngineContext};
use crate::backend::host::HostFs;
use crate::backend::mediator::MediatorFactory;
use crate::common::{Config, Error, KvStore, Result};
use crate::coordinator::fencing::MountFencer;
use crate::coordinator::lock::LockManager;
use crate::coordinator::metadata::{MetadataStore, PathInfo, ResourceKind, VolumeRecord};
use crate::coordinator::registry::{BackendHandle, BackendRegistry, BackendState};
use std::sync::Arc;
use tokio_util::task::TaskTracker;

pub struct Orchestrator {
    node_id: String,
    meta: Arc<MetadataStore>,
    locks: Arc<LockManager>,
    registry: Arc<BackendRegistry>,
    tasks: TaskTracker,
}

impl Orchestrator {
    /// Wire up the shared services and start backend initialization.
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: Config,
        kv: Arc<dyn KvStore>,
        host: Arc<dyn HostFs>,
        factory: Arc<dyn MediatorFactory>,
    ) -> Self {
        tracing::info!("Starting orchestrator on node {}", config.node_id);
        tracing::info!("  KV backend: {:?}", config.kv.backend);
        tracing::info!("  Backends: {}", config.backends.len());
        tracing::info!(
            "  Mount conflict delay: {:?}",
            config.fencing.mount_conflict_delay()
        );

        let meta = Arc::new(MetadataStore::new(kv.clone()));
        let locks = Arc::new(LockManager::new(
            kv,
            &config.kv.lock_namespace,
            &config.node_id,
            &config.locks,
        ));
        let fencer = Arc::new(MountFencer::new(
            meta.clone(),
            locks.clone(),
            config.fencing.clone(),
        ));
        let tasks = TaskTracker::new();

        let ctx = EngineContext {
            node_id: config.node_id.clone(),
            meta: meta.clone(),
            locks: locks.clone(),
            fencer,
            host,
            tasks: tasks.clone(),
        };
        let registry = BackendRegistry::start(config.backends, factory, ctx);

        Self {
            node_id: config.node_id,
            meta,
            locks,
            registry,
            tasks,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.meta
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Join point for backend initialization
    pub async fn wait_ready(&self) -> Vec<(String, BackendState)> {
        self.registry.wait_initialized().await
    }

    /// Backend for a new resource: the named one, else the first of the
    /// right kind
    fn backend_for_new(
        &self,
        kind: ResourceKind,
        backend: Option<&str>,
    ) -> Result<Arc<BackendHandle>> {
        let name = match backend {
            Some(name) => name,
            None => self.registry.default_backend(kind).ok_or_else(|| {
                Error::InvalidConfig(format!("no backend configured for {:?}s", kind))
            })?,
        };
        let handle = self.registry.get(name)?;
        if handle.driver.resource_kind() != kind {
            return Err(Error::BadRequest(format!(
                "backend {} is a {} backend",
                name, handle.config.driver
            )));
        }
        Ok(handle)
    }

    // === Volumes ===

    pub async fn create_volume(
        &self,
        name: &str,
        backend: Option<&str>,
        opts: CreateOptions,
    ) -> Result<CreateOutcome> {
        let handle = self.backend_for_new(ResourceKind::Volume, backend)?;
        handle.driver.create(name, opts).await
    }

    pub async fn clone_volume(
        &self,
        source: &str,
        name: &str,
        opts: CreateOptions,
    ) -> Result<CreateOutcome> {
        let handle = self.registry.backend_for(ResourceKind::Volume, source).await?;
        handle.driver.clone_volume(source, name, opts).await
    }

    pub async fn create_snapshot(
        &self,
        source: &str,
        name: &str,
        expiration_hours: Option<u64>,
    ) -> Result<CreateOutcome> {
        let handle = self.registry.backend_for(ResourceKind::Volume, source).await?;
        handle
            .driver
            .create_snapshot(source, name, expiration_hours)
            .await
    }

    /// Manage an array volume created outside volplane
    pub async fn import_volume(
        &self,
        existing: &str,
        backend: Option<&str>,
        opts: CreateOptions,
    ) -> Result<CreateOutcome> {
        let handle = self.backend_for_new(ResourceKind::Volume, backend)?;
        handle.driver.import(existing, opts).await
    }

    pub async fn delete_volume(&self, name: &str) -> Result<()> {
        self.delete(ResourceKind::Volume, name).await
    }

    pub async fn mount_volume(&self, name: &str, mount_id: &str) -> Result<PathInfo> {
        self.mount(ResourceKind::Volume, name, mount_id).await
    }

    pub async fn unmount_volume(&self, name: &str, mount_id: &str) -> Result<()> {
        self.unmount(ResourceKind::Volume, name, mount_id).await
    }

    pub async fn get_volume(&self, name: &str) -> Result<VolumeRecord> {
        self.meta.require_record(ResourceKind::Volume, name).await
    }

    pub async fn list_volumes(&self) -> Result<Vec<VolumeRecord>> {
        self.meta.list_records(ResourceKind::Volume).await
    }

    // === Shares ===

    /// Accept a share; provisioning finishes on a worker
    pub async fn create_share(
        &self,
        name: &str,
        backend: Option<&str>,
        opts: CreateOptions,
    ) -> Result<CreateOutcome> {
        let handle = self.backend_for_new(ResourceKind::Share, backend)?;
        handle.driver.create(name, opts).await
    }

    pub async fn delete_share(&self, name: &str) -> Result<()> {
        self.delete(ResourceKind::Share, name).await
    }

    pub async fn mount_share(&self, name: &str, mount_id: &str) -> Result<PathInfo> {
        self.mount(ResourceKind::Share, name, mount_id).await
    }

    pub async fn unmount_share(&self, name: &str, mount_id: &str) -> Result<()> {
        self.unmount(ResourceKind::Share, name, mount_id).await
    }

    pub async fn get_share(&self, name: &str) -> Result<VolumeRecord> {
        self.meta.require_record(ResourceKind::Share, name).await
    }

    pub async fn list_shares(&self) -> Result<Vec<VolumeRecord>> {
        self.meta.list_records(ResourceKind::Share).await
    }

    // === Dispatch ===

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<()> {
        let handle = self.registry.backend_for(kind, name).await?;
        let result = handle.driver.delete(name).await;
        if result.is_ok() || matches!(result, Err(Error::NotFound(_))) {
            self.registry.invalidate(kind, name);
        }
        result
    }

    async fn mount(&self, kind: ResourceKind, name: &str, mount_id: &str) -> Result<PathInfo> {
        let handle = self.registry.backend_for(kind, name).await?;
        handle.driver.mount(name, mount_id).await
    }

    async fn unmount(&self, kind: ResourceKind, name: &str, mount_id: &str) -> Result<()> {
        let handle = self.registry.backend_for(kind, name).await?;
        handle.driver.unmount(name, mount_id).await
    }

    /// Stop accepting background work and wait for running workers
    pub async fn shutdown(&self) {
        self.registry.wait_initialized().await;
        self.tasks.close();
        tracing::info!("Waiting for {} background task(s)", self.tasks.len());
        self.tasks.wait().await;
        tracing::info!("Orchestrator on {} stopped", self.node_id);
    }
}
