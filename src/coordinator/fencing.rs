//! Cross-node mount fencing
//!
//! Guarantees at most one node holds a live mount of a volume or share.
//! Per record, `node_mount_info` maps node id to the mount ids active on
//! that node:
//!
//! - no entry: the requesting node attaches and records `{node: {id}}`
//! - entry for the requesting node: the id joins the set, no new attach
//! - entry for another node: re-read once per poll interval for up to
//!   `mount_conflict_delay`, waiting for that node to unmount. If it never
//!   does, the storage-side exports are forcibly removed, the stale node's
//!   `path_info` is archived in `old_path_info` for its own later cleanup,
//!   and the requesting node takes over. The stale node cleans up on its
//!   next unmount of the record, or before it attaches the record again.
//!
//! Mount and unmount run entirely under the record's distributed lock,
//! including the wait.

use crate::common::{Error, FencingConfig, Result};
use crate::coordinator::lock::{names, LockManager};
use crate::coordinator::metadata::{
    MetadataStore, PathInfo, ResourceKind, VolumeRecord, VolumeStatus,
};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::Instant;

/// Backend-side actions the fencing protocol drives
#[async_trait]
pub trait MountTarget: Send + Sync {
    /// Remove every storage-side export of the record, on all arrays serving it
    async fn force_remove_export(&self, record: &VolumeRecord) -> Result<()>;

    /// Export, connect, format if needed and mount on this node.
    /// Rolls back its own partial work on failure.
    async fn attach(&self, record: &VolumeRecord) -> Result<PathInfo>;

    /// Unmount and disconnect on this node
    async fn detach(&self, record: &VolumeRecord, path: &PathInfo) -> Result<()>;

    /// Best-effort removal of artifacts left behind by a forced takeover
    async fn cleanup_stale(&self, record: &VolumeRecord, path: &PathInfo) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum MountState {
    Unmounted,
    MountedHere,
    MountedElsewhere(Vec<String>),
}

fn mount_state(record: &VolumeRecord, node: &str) -> MountState {
    let others: Vec<String> = record
        .node_mount_info
        .keys()
        .filter(|n| n.as_str() != node)
        .cloned()
        .collect();
    if !others.is_empty() {
        MountState::MountedElsewhere(others)
    } else if record.node_mount_info.contains_key(node) {
        MountState::MountedHere
    } else {
        MountState::Unmounted
    }
}

fn lock_name(kind: ResourceKind, name: &str) -> String {
    match kind {
        ResourceKind::Volume => names::volume(name),
        ResourceKind::Share => names::share(name),
    }
}

pub struct MountFencer {
    meta: Arc<MetadataStore>,
    locks: Arc<LockManager>,
    config: FencingConfig,
}

impl MountFencer {
    pub fn new(meta: Arc<MetadataStore>, locks: Arc<LockManager>, config: FencingConfig) -> Self {
        Self {
            meta,
            locks,
            config,
        }
    }

    /// Mount `name` on `node` for `mount_id`
    pub async fn mount(
        &self,
        kind: ResourceKind,
        name: &str,
        node: &str,
        mount_id: &str,
        target: &dyn MountTarget,
    ) -> Result<PathInfo> {
        self.locks
            .with_lock(
                &lock_name(kind, name),
                self.mount_locked(kind, name, node, mount_id, target),
            )
            .await
    }

    /// Release `mount_id` of `name` on `node`
    pub async fn unmount(
        &self,
        kind: ResourceKind,
        name: &str,
        node: &str,
        mount_id: &str,
        target: &dyn MountTarget,
    ) -> Result<()> {
        self.locks
            .with_lock(
                &lock_name(kind, name),
                self.unmount_locked(kind, name, node, mount_id, target),
            )
            .await
    }

    async fn mount_locked(
        &self,
        kind: ResourceKind,
        name: &str,
        node: &str,
        mount_id: &str,
        target: &dyn MountTarget,
    ) -> Result<PathInfo> {
        let mut record = self.meta.require_record(kind, name).await?;
        if record.status != VolumeStatus::Available {
            return Err(Error::BadRequest(format!(
                "{} is {}, cannot mount",
                name, record.status
            )));
        }

        match mount_state(&record, node) {
            MountState::MountedHere => {
                let path = record.path_info.clone().ok_or_else(|| {
                    Error::Internal(format!("{} mounted on {} without path info", name, node))
                })?;
                let ids = record.node_mount_info.entry(node.to_string()).or_default();
                if ids.insert(mount_id.to_string()) {
                    self.meta.put_record(&record).await?;
                }
                tracing::info!("{} already mounted on {}, added mount id {}", name, node, mount_id);
                return Ok(path);
            }
            MountState::MountedElsewhere(others) => {
                tracing::info!(
                    "{} is mounted on {:?}; waiting up to {:?} for release",
                    name,
                    others,
                    self.config.mount_conflict_delay()
                );
                record = self.wait_or_take_over(kind, name, node, target).await?;
            }
            MountState::Unmounted => {}
        }

        // Leftovers of a takeover from this node would collide with the new mount
        let (stale, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut record.old_path_info)
            .into_iter()
            .partition(|(n, _)| n == node);
        record.old_path_info = kept;
        for (_, stale_path) in &stale {
            self.clean_up(&record, node, stale_path, target).await;
        }

        let path = target.attach(&record).await?;

        record.node_mount_info.clear();
        record
            .node_mount_info
            .insert(node.to_string(), BTreeSet::from([mount_id.to_string()]));
        record.path_info = Some(path.clone());
        self.meta.put_record(&record).await?;

        tracing::info!("{} mounted on {} at {}", name, node, path.mount_dir);
        Ok(path)
    }

    /// Wait for other nodes to unmount; force a takeover at the deadline.
    /// Returns the record with no other node's entries left.
    async fn wait_or_take_over(
        &self,
        kind: ResourceKind,
        name: &str,
        node: &str,
        target: &dyn MountTarget,
    ) -> Result<VolumeRecord> {
        let deadline = Instant::now() + self.config.mount_conflict_delay();

        while Instant::now() < deadline {
            tokio::time::sleep(self.config.poll_interval()).await;
            let record = self.meta.require_record(kind, name).await?;
            if !matches!(mount_state(&record, node), MountState::MountedElsewhere(_)) {
                tracing::info!("{} released by its previous owner", name);
                return Ok(record);
            }
        }

        let mut record = self.meta.require_record(kind, name).await?;
        let stale_nodes = match mount_state(&record, node) {
            MountState::MountedElsewhere(others) => others,
            _ => return Ok(record),
        };

        tracing::warn!(
            "Forcing takeover of {} from {:?} for {}",
            name,
            stale_nodes,
            node
        );
        target.force_remove_export(&record).await?;

        if let Some(stale_path) = record.path_info.take() {
            for stale in &stale_nodes {
                record.old_path_info.push((stale.clone(), stale_path.clone()));
            }
        }
        record.node_mount_info.clear();
        self.meta.put_record(&record).await?;
        Ok(record)
    }

    async fn unmount_locked(
        &self,
        kind: ResourceKind,
        name: &str,
        node: &str,
        mount_id: &str,
        target: &dyn MountTarget,
    ) -> Result<()> {
        let mut record = self.meta.require_record(kind, name).await?;

        let Some(ids) = record.node_mount_info.get_mut(node) else {
            return self.cleanup_stale_entry(record, node, target).await;
        };

        ids.remove(mount_id);
        if !ids.is_empty() {
            tracing::info!(
                "{} still has {} mount(s) on {}, keeping it attached",
                name,
                ids.len(),
                node
            );
            return self.meta.put_record(&record).await;
        }

        if let Some(path) = record.path_info.clone() {
            target.detach(&record, &path).await?;
        }
        record.node_mount_info.remove(node);
        record.path_info = None;
        self.meta.put_record(&record).await?;
        tracing::info!("{} unmounted from {}", name, node);
        Ok(())
    }

    /// Unmount from a node that lost its mount to a takeover
    async fn cleanup_stale_entry(
        &self,
        mut record: VolumeRecord,
        node: &str,
        target: &dyn MountTarget,
    ) -> Result<()> {
        let Some(pos) = record.old_path_info.iter().position(|(n, _)| n == node) else {
            tracing::debug!("{} not mounted on {}, nothing to do", record.name, node);
            return Ok(());
        };

        let (_, stale_path) = record.old_path_info.remove(pos);
        self.clean_up(&record, node, &stale_path, target).await;
        self.meta.put_record(&record).await
    }

    async fn clean_up(
        &self,
        record: &VolumeRecord,
        node: &str,
        stale_path: &PathInfo,
        target: &dyn MountTarget,
    ) {
        if let Err(e) = target.cleanup_stale(record, stale_path).await {
            tracing::warn!(
                "Cleanup of stale mount of {} on {} failed: {}",
                record.name,
                node,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_state() {
        let mut rec = VolumeRecord::new("v", "b", ResourceKind::Volume, 1);
        assert_eq!(mount_state(&rec, "a"), MountState::Unmounted);

        rec.node_mount_info.insert("a".into(), BTreeSet::from(["1".to_string()]));
        assert_eq!(mount_state(&rec, "a"), MountState::MountedHere);
        assert_eq!(
            mount_state(&rec, "b"),
            MountState::MountedElsewhere(vec!["a".to_string()])
        );
    }
}
