//! Array mediator interface
//!
//! The REST/SSH client of a storage array is an external collaborator.
//! Implementations report failures using the crate error taxonomy:
//! `NotFound`, `AlreadyExists` (conflict), `Busy`, `BadRequest` and
//! `BackendUnavailable` for anything transient or unexplained.

use crate::common::{ReplicationMode, Result};
use crate::coordinator::metadata::Provisioning;
use crate::coordinator::replication::RcgState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Array-side volume parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    pub size_gib: u64,
    pub cpg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snap_cpg: Option<String>,
    pub provisioning: Provisioning,
    pub compression: bool,
}

/// Array-side view of an existing volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayVolume {
    pub name: String,
    pub size_gib: u64,
    pub cpg: String,
}

/// Array-side view of an existing FPG
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayFpg {
    pub name: String,
    pub cpg: String,
    pub size_tib: u64,
    /// VFS bound to the FPG, with its address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vfs: Option<(String, String)>,
}

/// The host a volume is exported to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIdentity {
    pub name: String,
    /// iSCSI IQNs, FC WWNs or client IP addresses
    pub initiators: Vec<String>,
}

#[async_trait]
pub trait ArrayMediator: Send + Sync {
    fn array_name(&self) -> &str;

    /// Connect and authenticate
    async fn initialize(&self) -> Result<()>;

    // === Volumes ===

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<()>;

    async fn delete_volume(&self, name: &str) -> Result<()>;

    async fn get_volume(&self, name: &str) -> Result<Option<ArrayVolume>>;

    async fn clone_volume(&self, source: &str, target: &VolumeSpec) -> Result<()>;

    async fn create_snapshot(
        &self,
        source: &str,
        snapshot: &str,
        expiration_hours: Option<u64>,
    ) -> Result<()>;

    async fn delete_snapshot(&self, snapshot: &str) -> Result<()>;

    // === Exports (VLUNs / share access) ===

    /// Make a volume visible to `host`; returns the export reference
    async fn export_volume(&self, name: &str, host: &HostIdentity) -> Result<String>;

    async fn unexport_volume(&self, name: &str, host: &HostIdentity) -> Result<()>;

    /// Remove every export of the volume regardless of host
    async fn force_remove_exports(&self, name: &str) -> Result<()>;

    // === File persona ===

    async fn get_fpg(&self, fpg: &str) -> Result<Option<ArrayFpg>>;

    async fn create_fpg(&self, cpg: &str, fpg: &str, size_tib: u64) -> Result<()>;

    async fn delete_fpg(&self, fpg: &str) -> Result<()>;

    async fn create_vfs(&self, fpg: &str, vfs: &str, ip: &str, netmask: &str) -> Result<()>;

    /// Addresses currently bound to any VFS on the array
    async fn assigned_ips(&self) -> Result<Vec<String>>;

    /// Create the file store and NFS share; returns the export path
    async fn create_share(&self, fpg: &str, vfs: &str, share: &str) -> Result<String>;

    async fn delete_share(&self, fpg: &str, share: &str) -> Result<()>;

    async fn set_quota(&self, fpg: &str, share: &str, size_gib: u64) -> Result<()>;

    async fn remove_quota(&self, fpg: &str, share: &str) -> Result<()>;

    async fn allow_share_client(&self, fpg: &str, share: &str, host: &HostIdentity) -> Result<()>;

    async fn revoke_share_client(&self, fpg: &str, share: &str, host: &HostIdentity)
        -> Result<()>;

    /// Drop every client from the share's access list
    async fn force_revoke_share_clients(&self, fpg: &str, share: &str) -> Result<()>;

    // === Remote copy ===

    async fn get_rcg(&self, rcg: &str) -> Result<Option<RcgState>>;

    async fn create_rcg(
        &self,
        rcg: &str,
        remote_array: &str,
        remote_rcg: &str,
        mode: ReplicationMode,
    ) -> Result<()>;

    async fn delete_rcg(&self, rcg: &str) -> Result<()>;

    async fn add_volume_to_rcg(&self, rcg: &str, volume: &str, remote_volume: &str) -> Result<()>;

    async fn remove_volume_from_rcg(&self, rcg: &str, volume: &str) -> Result<()>;

    async fn start_rcg(&self, rcg: &str) -> Result<()>;

    async fn stop_rcg(&self, rcg: &str) -> Result<()>;
}

/// Opens mediator sessions for configured arrays
#[async_trait]
pub trait MediatorFactory: Send + Sync {
    async fn connect(
        &self,
        backend: &crate::common::BackendConfig,
    ) -> Result<std::sync::Arc<dyn ArrayMediator>>;

    /// Session to the replication partner of `backend`
    async fn connect_remote(
        &self,
        backend: &crate::common::BackendConfig,
        remote_array: &str,
    ) -> Result<std::sync::Arc<dyn ArrayMediator>>;
}
