//! Backend registry and request dispatch
//!
//! Backends come up in parallel at startup. A request for a backend still
//! initializing, or one that failed to initialize, is rejected immediately
//! with its state instead of waiting. [`BackendRegistry::wait_initialized`]
//! is the join point for callers that need every backend settled.
//!
//! Resource name to backend lookups are cached; the cache is owned here and
//! invalidated whenever a resource is deleted.

use crate::backend::driver::{build_driver, EngineContext, StorageDriver};
use crate::backend::mediator::MediatorFactory;
use crate::common::{BackendConfig, Error, Result};
use crate::coordinator::metadata::{MetadataStore, ResourceKind};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendState {
    Initializing,
    Ready,
    Failed(String),
}

impl std::fmt::Display for BackendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendState::Initializing => write!(f, "INITIALIZING"),
            BackendState::Ready => write!(f, "READY"),
            BackendState::Failed(reason) => write!(f, "FAILED ({})", reason),
        }
    }
}

/// An initialized backend
pub struct BackendHandle {
    pub config: BackendConfig,
    pub driver: Arc<dyn StorageDriver>,
}

struct Slot {
    state: BackendState,
    handle: Option<Arc<BackendHandle>>,
}

/// Resource name to backend name
#[derive(Default)]
pub struct BackendCache {
    entries: RwLock<HashMap<(ResourceKind, String), String>>,
}

impl BackendCache {
    pub fn get(&self, kind: ResourceKind, name: &str) -> Option<String> {
        self.entries.read().get(&(kind, name.to_string())).cloned()
    }

    pub fn insert(&self, kind: ResourceKind, name: &str, backend: &str) {
        self.entries
            .write()
            .insert((kind, name.to_string()), backend.to_string());
    }

    pub fn invalidate(&self, kind: ResourceKind, name: &str) {
        self.entries.write().remove(&(kind, name.to_string()));
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct BackendRegistry {
    /// Backend names in configuration order
    order: Vec<(String, ResourceKind)>,
    slots: RwLock<HashMap<String, Slot>>,
    cache: BackendCache,
    meta: Arc<MetadataStore>,
    init: Mutex<JoinSet<()>>,
}

impl BackendRegistry {
    /// Register every backend as INITIALIZING and start bringing them up
    pub fn start(
        backends: Vec<BackendConfig>,
        factory: Arc<dyn MediatorFactory>,
        ctx: EngineContext,
    ) -> Arc<Self> {
        let order = backends
            .iter()
            .map(|b| {
                let kind = if b.driver.is_block() {
                    ResourceKind::Volume
                } else {
                    ResourceKind::Share
                };
                (b.name.clone(), kind)
            })
            .collect();
        let slots = backends
            .iter()
            .map(|b| {
                (
                    b.name.clone(),
                    Slot {
                        state: BackendState::Initializing,
                        handle: None,
                    },
                )
            })
            .collect();

        let registry = Arc::new(Self {
            order,
            slots: RwLock::new(slots),
            cache: BackendCache::default(),
            meta: ctx.meta.clone(),
            init: Mutex::new(JoinSet::new()),
        });

        let mut init = registry.init.lock();
        for config in backends {
            let registry = registry.clone();
            let factory = factory.clone();
            let ctx = ctx.clone();
            init.spawn(async move {
                let name = config.name.clone();
                match Self::bring_up(config, factory.as_ref(), ctx).await {
                    Ok(handle) => {
                        tracing::info!("Backend {} is ready", name);
                        registry.settle(&name, BackendState::Ready, Some(handle));
                    }
                    Err(e) => {
                        tracing::error!("Backend {} failed to initialize: {}", name, e);
                        registry.settle(&name, BackendState::Failed(e.to_string()), None);
                    }
                }
            });
        }
        drop(init);
        registry
    }

    async fn bring_up(
        config: BackendConfig,
        factory: &dyn MediatorFactory,
        ctx: EngineContext,
    ) -> Result<Arc<BackendHandle>> {
        tracing::info!("Initializing {} backend {}", config.driver, config.name);
        let mediator = factory.connect(&config).await?;
        mediator.initialize().await?;

        let remote = match &config.replication {
            Some(repl) => {
                let remote = factory.connect_remote(&config, &repl.remote_array).await?;
                remote.initialize().await?;
                Some(remote)
            }
            None => None,
        };

        let driver = build_driver(config.clone(), ctx, mediator, remote);
        Ok(Arc::new(BackendHandle { config, driver }))
    }

    fn settle(&self, name: &str, state: BackendState, handle: Option<Arc<BackendHandle>>) {
        if let Some(slot) = self.slots.write().get_mut(name) {
            slot.state = state;
            slot.handle = handle;
        }
    }

    /// Wait until every backend has left INITIALIZING
    pub async fn wait_initialized(&self) -> Vec<(String, BackendState)> {
        let mut init = std::mem::take(&mut *self.init.lock());
        while let Some(joined) = init.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Backend initialization task failed: {}", e);
            }
        }
        self.states()
    }

    /// States in configuration order
    pub fn states(&self) -> Vec<(String, BackendState)> {
        let slots = self.slots.read();
        self.order
            .iter()
            .filter_map(|(name, _)| slots.get(name).map(|s| (name.clone(), s.state.clone())))
            .collect()
    }

    pub fn state(&self, backend: &str) -> Option<BackendState> {
        self.slots.read().get(backend).map(|s| s.state.clone())
    }

    /// A ready backend, or an immediate error naming its state
    pub fn get(&self, backend: &str) -> Result<Arc<BackendHandle>> {
        let slots = self.slots.read();
        let slot = slots
            .get(backend)
            .ok_or_else(|| Error::NotFound(format!("backend {}", backend)))?;
        match (&slot.state, &slot.handle) {
            (BackendState::Ready, Some(handle)) => Ok(handle.clone()),
            (state, _) => Err(Error::BackendNotInitialized {
                backend: backend.to_string(),
                state: state.to_string(),
            }),
        }
    }

    /// First configured backend serving `kind`
    pub fn default_backend(&self, kind: ResourceKind) -> Option<&str> {
        self.order
            .iter()
            .find(|(_, k)| *k == kind)
            .map(|(name, _)| name.as_str())
    }

    /// Backend owning an existing resource
    pub async fn backend_for(&self, kind: ResourceKind, name: &str) -> Result<Arc<BackendHandle>> {
        if let Some(backend) = self.cache.get(kind, name) {
            return self.get(&backend);
        }
        let record = self.meta.require_record(kind, name).await?;
        self.cache.insert(kind, name, &record.backend);
        self.get(&record.backend)
    }

    pub fn invalidate(&self, kind: ResourceKind, name: &str) {
        self.cache.invalidate(kind, name);
    }

    pub fn cache(&self) -> &BackendCache {
        &self.cache
    }
}
