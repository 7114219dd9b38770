//! Local host filesystem and device operations
//!
//! Formatting, mounting and block-device attachment belong to the host OS
//! and are consumed through this trait.

use crate::common::Result;
use async_trait::async_trait;

#[async_trait]
pub trait HostFs: Send + Sync {
    /// iSCSI IQNs / FC WWNs / client addresses of this host
    fn initiators(&self) -> Vec<String>;

    /// Discover and attach the block device behind an export
    async fn connect_device(&self, export: &str) -> Result<String>;

    async fn disconnect_device(&self, device: &str) -> Result<()>;

    async fn has_filesystem(&self, device: &str) -> Result<bool>;

    async fn create_filesystem(&self, device: &str, fs_type: &str) -> Result<()>;

    async fn create_dir(&self, path: &str) -> Result<()>;

    async fn remove_dir(&self, path: &str) -> Result<()>;

    /// Mount a block device or an NFS export (`fs_type = "nfs"`)
    async fn mount(&self, source: &str, target: &str, fs_type: &str) -> Result<()>;

    async fn unmount(&self, target: &str) -> Result<()>;

    async fn set_ownership(&self, path: &str, owner: Option<(u32, u32)>, mode: Option<u32>)
        -> Result<()>;
}
