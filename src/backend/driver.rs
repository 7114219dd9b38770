//! Storage driver capability interface
//!
//! Each configured backend gets exactly one driver, chosen from the closed
//! set in [`DriverKind`]: iSCSI and FC share the block driver, file backends
//! use the file-persona driver.

use crate::backend::block::BlockDriver;
use crate::backend::file::FileDriver;
use crate::backend::host::HostFs;
use crate::backend::mediator::{ArrayMediator, HostIdentity};
use crate::common::utils::{parse_mode, parse_owner};
use crate::common::{BackendConfig, DriverKind, Error, Result};
use crate::coordinator::fencing::MountFencer;
use crate::coordinator::lock::LockManager;
use crate::coordinator::metadata::{MetadataStore, PathInfo, Provisioning, ResourceKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

/// Size used when a create request carries none
pub const DEFAULT_VOLUME_SIZE_GIB: u64 = 100;

/// Shared services every driver works with
#[derive(Clone)]
pub struct EngineContext {
    pub node_id: String,
    pub meta: Arc<MetadataStore>,
    pub locks: Arc<LockManager>,
    pub fencer: Arc<MountFencer>,
    pub host: Arc<dyn HostFs>,
    /// Detached workers (async share creation)
    pub tasks: TaskTracker,
}

impl EngineContext {
    pub fn host_identity(&self) -> HostIdentity {
        HostIdentity {
            name: self.node_id.clone(),
            initiators: self.host.initiators(),
        }
    }
}

/// Options accepted by create-style requests
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_gib: Option<u64>,
    #[serde(default)]
    pub provisioning: Provisioning,
    #[serde(default)]
    pub compression: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snap_cpg: Option<String>,
    /// Remote copy group to join (block volumes)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication_group: Option<String>,
    /// Pin a share to an existing FPG
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fpg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fs_owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fs_mode: Option<String>,
}

/// Completion handle of an asynchronous share creation
#[derive(Debug)]
pub struct ShareCreation {
    pub name: String,
    handle: JoinHandle<Result<()>>,
}

impl ShareCreation {
    pub fn new(name: impl Into<String>, handle: JoinHandle<Result<()>>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    /// Wait for the provisioning worker to finish
    pub async fn wait(self) -> Result<()> {
        self.handle.await?
    }
}

#[derive(Debug)]
pub enum CreateOutcome {
    Created,
    /// A concurrent or earlier request already owns the name
    Duplicate,
    /// Provisioning continues on a worker; poll the record status
    Pending(ShareCreation),
}

impl CreateOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, CreateOutcome::Duplicate)
    }

    /// Resolve to completion, waiting on pending workers
    pub async fn finish(self) -> Result<()> {
        match self {
            CreateOutcome::Pending(creation) => creation.wait().await,
            _ => Ok(()),
        }
    }
}

#[async_trait]
pub trait StorageDriver: Send + Sync {
    fn kind(&self) -> DriverKind;

    fn resource_kind(&self) -> ResourceKind {
        if self.kind().is_block() {
            ResourceKind::Volume
        } else {
            ResourceKind::Share
        }
    }

    async fn create(&self, name: &str, opts: CreateOptions) -> Result<CreateOutcome>;

    async fn delete(&self, name: &str) -> Result<()>;

    async fn mount(&self, name: &str, mount_id: &str) -> Result<PathInfo>;

    async fn unmount(&self, name: &str, mount_id: &str) -> Result<()>;

    async fn clone_volume(
        &self,
        _source: &str,
        _name: &str,
        _opts: CreateOptions,
    ) -> Result<CreateOutcome> {
        Err(unsupported(self.kind(), "clone"))
    }

    async fn create_snapshot(
        &self,
        _source: &str,
        _name: &str,
        _expiration_hours: Option<u64>,
    ) -> Result<CreateOutcome> {
        Err(unsupported(self.kind(), "snapshot"))
    }

    /// Bring an array object created outside volplane under management
    async fn import(&self, _existing: &str, _opts: CreateOptions) -> Result<CreateOutcome> {
        Err(unsupported(self.kind(), "import"))
    }
}

fn unsupported(kind: DriverKind, op: &str) -> Error {
    Error::BadRequest(format!("{} is not supported by the {} driver", op, kind))
}

/// Pick the driver variant for a backend
pub fn build_driver(
    config: BackendConfig,
    ctx: EngineContext,
    mediator: Arc<dyn ArrayMediator>,
    remote: Option<Arc<dyn ArrayMediator>>,
) -> Arc<dyn StorageDriver> {
    match config.driver {
        DriverKind::Iscsi | DriverKind::Fc => {
            Arc::new(BlockDriver::new(config, ctx, mediator, remote))
        }
        DriverKind::File => Arc::new(FileDriver::new(config, ctx, mediator)),
    }
}

/// Treat a missing object as already removed
pub(crate) fn ignore_not_found(result: Result<()>, what: &str) -> Result<()> {
    match result {
        Err(Error::NotFound(_)) => {
            tracing::debug!("{} already gone", what);
            Ok(())
        }
        other => other,
    }
}

/// Apply `uid:gid` and octal mode to a fresh mount point
pub(crate) async fn apply_ownership(
    host: &dyn HostFs,
    dir: &str,
    owner: Option<&str>,
    mode: Option<&str>,
) -> Result<()> {
    if owner.is_none() && mode.is_none() {
        return Ok(());
    }
    let owner = owner.map(parse_owner).transpose()?;
    let mode = mode.map(parse_mode).transpose()?;
    host.set_ownership(dir, owner, mode).await
}

/// `<mount_prefix>/<name>`
pub(crate) fn mount_dir(config: &BackendConfig, name: &str) -> String {
    config.mount_prefix.join(name).to_string_lossy().into_owned()
}
