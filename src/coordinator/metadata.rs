//! Persisted records and their KV layout
//!
//! Stores:
//! - Volume and share records (`volumes/<name>`, `shares/<name>`)
//! - Backend metadata: IP reservations, default FPGs, name counter
//! - FPG metadata: share count and capacity flag per FPG
//!
//! Records are serialized as JSON so other tooling can read them verbatim.

use crate::common::{encode_key, Error, KvStore, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Maximum number of shares hosted by one FPG
pub const MAX_SHARES_PER_FPG: u32 = 16;

const VOLUMES_PREFIX: &str = "volumes/";
const SHARES_PREFIX: &str = "shares/";
const BACKENDS_PREFIX: &str = "backends/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VolumeStatus {
    Creating,
    Available,
    Failed,
}

impl std::fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeStatus::Creating => write!(f, "CREATING"),
            VolumeStatus::Available => write!(f, "AVAILABLE"),
            VolumeStatus::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provisioning {
    #[default]
    Thin,
    Full,
    Dedup,
}

/// Whether a record describes a block volume or a file share
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Volume,
    Share,
}

impl ResourceKind {
    fn prefix(&self) -> &'static str {
        match self {
            ResourceKind::Volume => VOLUMES_PREFIX,
            ResourceKind::Share => SHARES_PREFIX,
        }
    }
}

/// Where a volume is visible on the host that mounted it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathInfo {
    /// Array-side export reference (LUN id or share path)
    pub export: String,
    /// Local block device, absent for NFS shares
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_path: Option<String>,
    pub mount_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub name: String,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_hours: Option<u64>,
}

/// Remote copy group membership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RcgInfo {
    pub local_rcg_name: String,
    pub remote_rcg_name: String,
}

/// File-persona placement of a share
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareDetails {
    pub cpg: String,
    pub fpg: String,
    pub vfs: String,
    pub vfs_ip: String,
    pub share_path: String,
}

/// Volume or share record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub id: String,
    pub name: String,
    pub backend: String,
    pub kind: ResourceKind,
    /// Size in GiB
    pub size: u64,
    #[serde(default)]
    pub provisioning: Provisioning,
    #[serde(default)]
    pub compression: bool,
    pub status: VolumeStatus,
    #[serde(default)]
    pub snapshots: Vec<SnapshotRef>,
    /// Set on snapshot records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub node_mount_info: BTreeMap<String, BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_info: Option<PathInfo>,
    #[serde(default)]
    pub old_path_info: Vec<(String, PathInfo)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rcg_info: Option<RcgInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share: Option<ShareDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: u64,
}

impl VolumeRecord {
    pub fn new(
        name: impl Into<String>,
        backend: impl Into<String>,
        kind: ResourceKind,
        size: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            backend: backend.into(),
            kind,
            size,
            provisioning: Provisioning::default(),
            compression: false,
            status: VolumeStatus::Creating,
            snapshots: Vec::new(),
            parent: None,
            node_mount_info: BTreeMap::new(),
            path_info: None,
            old_path_info: Vec::new(),
            rcg_info: None,
            share: None,
            fs_owner: None,
            fs_mode: None,
            error: None,
            created_at: crate::common::timestamp_now(),
        }
    }

    /// Status only moves forward: CREATING -> AVAILABLE or CREATING -> FAILED
    pub fn transition(&mut self, to: VolumeStatus) -> Result<()> {
        match (self.status, to) {
            (VolumeStatus::Creating, VolumeStatus::Available)
            | (VolumeStatus::Creating, VolumeStatus::Failed) => {
                self.status = to;
                Ok(())
            }
            (from, to) => Err(Error::InvalidTransition {
                name: self.name.clone(),
                from: from.to_string(),
                to: to.to_string(),
            }),
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.node_mount_info.values().any(|ids| !ids.is_empty())
    }

    pub fn mounted_nodes(&self) -> Vec<String> {
        self.node_mount_info.keys().cloned().collect()
    }
}

/// Per-backend allocator bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendMetadata {
    #[serde(default)]
    pub ips_in_use: BTreeSet<String>,
    #[serde(default)]
    pub ips_locked_for_use: BTreeSet<String>,
    /// CPG name -> default FPG name
    #[serde(default)]
    pub default_fpgs: BTreeMap<String, String>,
    #[serde(default)]
    pub counter: u64,
}

/// Per-FPG share accounting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FpgMetadata {
    pub fpg: String,
    pub cpg: String,
    /// Size in TiB
    pub fpg_size: u64,
    pub share_cnt: u32,
    pub reached_full_capacity: bool,
    pub vfs: String,
    /// subnet -> addresses
    #[serde(default)]
    pub ips: BTreeMap<String, Vec<String>>,
    /// FPG created outside volplane and adopted later
    #[serde(default)]
    pub legacy: bool,
}

impl FpgMetadata {
    pub fn new(
        fpg: impl Into<String>,
        cpg: impl Into<String>,
        fpg_size: u64,
        vfs: impl Into<String>,
    ) -> Self {
        Self {
            fpg: fpg.into(),
            cpg: cpg.into(),
            fpg_size,
            share_cnt: 0,
            reached_full_capacity: false,
            vfs: vfs.into(),
            ips: BTreeMap::new(),
            legacy: false,
        }
    }

    pub fn is_full(&self) -> bool {
        self.share_cnt >= MAX_SHARES_PER_FPG
    }

    pub fn first_ip(&self) -> Option<&str> {
        self.ips.values().flatten().next().map(String::as_str)
    }
}

/// Typed record repository over the shared KV store
pub struct MetadataStore {
    kv: Arc<dyn KvStore>,
}

impl MetadataStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.kv.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.kv.put(key, bytes).await
    }

    fn record_key(kind: ResourceKind, name: &str) -> String {
        format!("{}{}", kind.prefix(), encode_key(name))
    }

    fn backend_key(backend: &str) -> String {
        format!("{}{}/meta", BACKENDS_PREFIX, encode_key(backend))
    }

    fn fpg_key(backend: &str, cpg: &str, fpg: &str) -> String {
        format!(
            "{}{}/fpgs/{}/{}",
            BACKENDS_PREFIX,
            encode_key(backend),
            encode_key(cpg),
            encode_key(fpg)
        )
    }

    // === Volume / share records ===

    pub async fn get_record(&self, kind: ResourceKind, name: &str) -> Result<Option<VolumeRecord>> {
        self.get_json(&Self::record_key(kind, name)).await
    }

    /// Like `get_record`, but absence is `Error::NotFound`
    pub async fn require_record(&self, kind: ResourceKind, name: &str) -> Result<VolumeRecord> {
        self.get_record(kind, name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{:?} {}", kind, name).to_lowercase()))
    }

    pub async fn put_record(&self, record: &VolumeRecord) -> Result<()> {
        self.put_json(&Self::record_key(record.kind, &record.name), record)
            .await
    }

    /// Atomically claim a name; `Error::AlreadyExists` if it is taken
    pub async fn create_record(&self, record: &VolumeRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        self.kv
            .create_if_absent(&Self::record_key(record.kind, &record.name), bytes)
            .await
    }

    pub async fn delete_record(&self, kind: ResourceKind, name: &str) -> Result<()> {
        self.kv.delete(&Self::record_key(kind, name)).await
    }

    pub async fn list_records(&self, kind: ResourceKind) -> Result<Vec<VolumeRecord>> {
        self.kv
            .list(kind.prefix())
            .await?
            .into_iter()
            .map(|bytes| serde_json::from_slice(&bytes).map_err(Error::from))
            .collect()
    }

    // === Backend metadata ===

    pub async fn get_backend_metadata(&self, backend: &str) -> Result<Option<BackendMetadata>> {
        self.get_json(&Self::backend_key(backend)).await
    }

    pub async fn put_backend_metadata(&self, backend: &str, meta: &BackendMetadata) -> Result<()> {
        self.put_json(&Self::backend_key(backend), meta).await
    }

    // === FPG metadata ===

    pub async fn get_fpg(
        &self,
        backend: &str,
        cpg: &str,
        fpg: &str,
    ) -> Result<Option<FpgMetadata>> {
        self.get_json(&Self::fpg_key(backend, cpg, fpg)).await
    }

    pub async fn put_fpg(&self, backend: &str, meta: &FpgMetadata) -> Result<()> {
        self.put_json(&Self::fpg_key(backend, &meta.cpg, &meta.fpg), meta)
            .await
    }

    pub async fn delete_fpg(&self, backend: &str, cpg: &str, fpg: &str) -> Result<()> {
        self.kv.delete(&Self::fpg_key(backend, cpg, fpg)).await
    }

    pub async fn list_fpgs(&self, backend: &str) -> Result<Vec<FpgMetadata>> {
        let prefix = format!("{}{}/fpgs/", BACKENDS_PREFIX, encode_key(backend));
        self.kv
            .list(&prefix)
            .await?
            .into_iter()
            .map(|bytes| serde_json::from_slice(&bytes).map_err(Error::from))
            .collect()
    }
}
