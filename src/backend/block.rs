//! Block driver (iSCSI and FC)
//!
//! Volumes are created synchronously: the array-side work runs as a saga
//! and the record flips to AVAILABLE in its last step. A failed create
//! leaves neither array objects nor a record behind.

use crate::backend::driver::{
    apply_ownership, ignore_not_found, mount_dir, CreateOptions, CreateOutcome, EngineContext,
    StorageDriver, DEFAULT_VOLUME_SIZE_GIB,
};
use crate::backend::mediator::{ArrayMediator, VolumeSpec};
use crate::common::{retry_with_backoff, validate_name, BackendConfig, DriverKind, Error, Result};
use crate::coordinator::fencing::MountTarget;
use crate::coordinator::lock::names;
use crate::coordinator::metadata::{
    PathInfo, RcgInfo, ResourceKind, SnapshotRef, VolumeRecord, VolumeStatus,
};
use crate::coordinator::replication::{remote_rcg_name, resolve_active, ActiveArray};
use crate::coordinator::saga::{Saga, SagaFailure};
use async_trait::async_trait;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;

const FORMAT_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct BlockDriver {
    config: BackendConfig,
    ctx: EngineContext,
    mediator: Arc<dyn ArrayMediator>,
    remote: Option<Arc<dyn ArrayMediator>>,
}

impl BlockDriver {
    pub fn new(
        config: BackendConfig,
        ctx: EngineContext,
        mediator: Arc<dyn ArrayMediator>,
        remote: Option<Arc<dyn ArrayMediator>>,
    ) -> Self {
        Self {
            config,
            ctx,
            mediator,
            remote,
        }
    }

    fn volume_spec(&self, name: &str, size_gib: u64, opts: &CreateOptions) -> VolumeSpec {
        VolumeSpec {
            name: name.to_string(),
            size_gib,
            cpg: opts
                .cpg
                .clone()
                .unwrap_or_else(|| self.config.default_cpg.clone()),
            snap_cpg: opts.snap_cpg.clone().or_else(|| self.config.snap_cpg.clone()),
            provisioning: opts.provisioning,
            compression: opts.compression,
        }
    }

    fn array(&self, which: ActiveArray) -> Result<&Arc<dyn ArrayMediator>> {
        match which {
            ActiveArray::Local => Ok(&self.mediator),
            ActiveArray::Remote => self.remote.as_ref().ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "backend {} has no replication partner",
                    self.config.name
                ))
            }),
        }
    }

    /// The array currently serving a replicated volume
    async fn active_array(&self, record: &VolumeRecord) -> Result<ActiveArray> {
        match (&record.rcg_info, &self.remote) {
            (Some(rcg), Some(remote)) => {
                resolve_active(
                    self.mediator.as_ref(),
                    remote.as_ref(),
                    &rcg.local_rcg_name,
                    &rcg.remote_rcg_name,
                )
                .await
            }
            _ => Ok(ActiveArray::Local),
        }
    }

    /// With peer persistence the host is exported on both arrays
    fn exports_on_both(&self, record: &VolumeRecord) -> bool {
        self.config.peer_persistence() && record.rcg_info.is_some() && self.remote.is_some()
    }

    /// Every array that may hold exports of the record
    fn arrays_of(&self, record: &VolumeRecord) -> Vec<&Arc<dyn ArrayMediator>> {
        let mut arrays = vec![&self.mediator];
        if record.rcg_info.is_some() {
            if let Some(remote) = &self.remote {
                arrays.push(remote);
            }
        }
        arrays
    }

    /// Claim `name` with a non-blocking lock; `None` means a concurrent
    /// request owns it
    async fn claim_name(&self, name: &str) -> Result<Option<String>> {
        validate_name(name)?;
        let lock = names::volume(name);
        match self.ctx.locks.try_lock(&lock).await {
            Ok(()) => Ok(Some(lock)),
            Err(Error::Busy(_)) => {
                tracing::info!("Create of {} already in progress, ignoring duplicate", name);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Insert the CREATING record; `false` if the name is already taken
    async fn insert_record(&self, record: &VolumeRecord) -> Result<bool> {
        if self
            .ctx
            .meta
            .get_record(ResourceKind::Volume, &record.name)
            .await?
            .is_some()
        {
            tracing::info!("Volume {} already exists, nothing to do", record.name);
            return Ok(false);
        }
        match self.ctx.meta.create_record(record).await {
            Ok(()) => Ok(true),
            Err(Error::AlreadyExists(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn new_record(&self, name: &str, size: u64, opts: &CreateOptions) -> VolumeRecord {
        let mut record = VolumeRecord::new(name, &self.config.name, ResourceKind::Volume, size);
        record.provisioning = opts.provisioning;
        record.compression = opts.compression;
        record.fs_owner = opts.fs_owner.clone();
        record.fs_mode = opts.fs_mode.clone();
        record
    }

    /// Saga steps shared by the create paths once the array volume exists
    async fn finish_create<'a>(
        &'a self,
        saga: &mut Saga<'a>,
        record: &mut VolumeRecord,
        replication_group: Option<&'a str>,
    ) -> std::result::Result<(), SagaFailure> {
        if let Some(rcg) = replication_group {
            let info = self.join_rcg(saga, &record.name, rcg).await?;
            record.rcg_info = Some(info);
        }
        saga.run("mark available", async {
            record.transition(VolumeStatus::Available)?;
            self.ctx.meta.put_record(record).await
        })
        .await
    }

    /// Add a volume to a remote copy group, creating the group on first use.
    /// The group is stopped while its membership changes.
    async fn join_rcg<'a>(
        &'a self,
        saga: &mut Saga<'a>,
        volume: &str,
        rcg: &'a str,
    ) -> std::result::Result<RcgInfo, SagaFailure> {
        let (Some(repl), Some(_)) = (&self.config.replication, &self.remote) else {
            let err = Error::BadRequest(format!(
                "backend {} is not configured for replication",
                self.config.name
            ));
            return Err(saga.abort("join replication group", err).await);
        };

        let lock = names::rcg(&self.config.name, rcg);
        if let Err(e) = self.ctx.locks.acquire(&lock).await {
            return Err(saga.abort("lock replication group", e).await);
        }

        let remote_rcg = remote_rcg_name(rcg);
        let mediator = &self.mediator;
        let volume_owned = volume.to_string();
        let result = async {
            let existing = saga.run("look up rcg", mediator.get_rcg(rcg)).await?;
            if existing.is_none() {
                saga.run_undo(
                    "create rcg",
                    mediator.create_rcg(rcg, &repl.remote_array, &remote_rcg, repl.mode),
                    mediator.delete_rcg(rcg),
                )
                .await?;
            } else {
                saga.run_undo("stop rcg", mediator.stop_rcg(rcg), mediator.start_rcg(rcg))
                    .await?;
            }
            saga.run_undo(
                "add volume to rcg",
                mediator.add_volume_to_rcg(rcg, volume, volume),
                async move { mediator.remove_volume_from_rcg(rcg, &volume_owned).await },
            )
            .await?;
            saga.run("start rcg", mediator.start_rcg(rcg)).await?;
            Ok::<_, SagaFailure>(RcgInfo {
                local_rcg_name: rcg.to_string(),
                remote_rcg_name: remote_rcg.clone(),
            })
        }
        .await;

        self.ctx.locks.release(&lock).await;
        result
    }

    async fn leave_rcg(&self, volume: &str, rcg: &RcgInfo) -> Result<()> {
        let lock = names::rcg(&self.config.name, &rcg.local_rcg_name);
        let group = rcg.local_rcg_name.as_str();
        self.ctx
            .locks
            .with_lock(&lock, async {
                ignore_not_found(self.mediator.stop_rcg(group).await, group)?;
                ignore_not_found(
                    self.mediator.remove_volume_from_rcg(group, volume).await,
                    volume,
                )?;
                ignore_not_found(self.mediator.start_rcg(group).await, group)
            })
            .await
    }

    async fn create_locked(&self, name: &str, opts: CreateOptions) -> Result<CreateOutcome> {
        let size = opts.size_gib.unwrap_or(DEFAULT_VOLUME_SIZE_GIB);
        let mut record = self.new_record(name, size, &opts);
        if !self.insert_record(&record).await? {
            return Ok(CreateOutcome::Duplicate);
        }

        let spec = self.volume_spec(name, size, &opts);
        let meta = &self.ctx.meta;
        let mut saga = Saga::new(format!("create volume {}", name));
        saga.record("insert record", meta.delete_record(ResourceKind::Volume, name));
        saga.run_undo(
            "create volume",
            self.mediator.create_volume(&spec),
            self.mediator.delete_volume(name),
        )
        .await?;
        self.finish_create(&mut saga, &mut record, opts.replication_group.as_deref())
            .await?;
        saga.commit();

        tracing::info!(
            "Created volume {} ({} GiB) on backend {}",
            name,
            size,
            self.config.name
        );
        Ok(CreateOutcome::Created)
    }

    /// Hold the source lock, then claim the target name
    async fn with_source<F, Fut>(&self, source: &str, name: &str, f: F) -> Result<CreateOutcome>
    where
        F: FnOnce() -> Fut + Send,
        Fut: std::future::Future<Output = Result<CreateOutcome>> + Send,
    {
        let source_lock = names::volume(source);
        self.ctx
            .locks
            .with_lock(&source_lock, async {
                let Some(target_lock) = self.claim_name(name).await? else {
                    return Ok(CreateOutcome::Duplicate);
                };
                let result = f().await;
                self.ctx.locks.release(&target_lock).await;
                result
            })
            .await
    }

    async fn require_available(&self, name: &str) -> Result<VolumeRecord> {
        let record = self
            .ctx
            .meta
            .require_record(ResourceKind::Volume, name)
            .await?;
        if record.status != VolumeStatus::Available {
            return Err(Error::BadRequest(format!("{} is {}", name, record.status)));
        }
        Ok(record)
    }

    async fn clone_locked(
        &self,
        source: &str,
        name: &str,
        opts: CreateOptions,
    ) -> Result<CreateOutcome> {
        let src = self.require_available(source).await?;
        let size = opts.size_gib.unwrap_or(src.size);
        if size < src.size {
            return Err(Error::BadRequest(format!(
                "clone size {} GiB is smaller than source {} ({} GiB)",
                size, source, src.size
            )));
        }

        let mut record = self.new_record(name, size, &opts);
        record.provisioning = src.provisioning;
        record.compression = src.compression;
        if !self.insert_record(&record).await? {
            return Ok(CreateOutcome::Duplicate);
        }

        let mut spec = self.volume_spec(name, size, &opts);
        spec.provisioning = src.provisioning;
        spec.compression = src.compression;
        let meta = &self.ctx.meta;
        let mut saga = Saga::new(format!("clone {} to {}", source, name));
        saga.record("insert record", meta.delete_record(ResourceKind::Volume, name));
        saga.run_undo(
            "clone volume",
            self.mediator.clone_volume(source, &spec),
            self.mediator.delete_volume(name),
        )
        .await?;
        self.finish_create(&mut saga, &mut record, opts.replication_group.as_deref())
            .await?;
        saga.commit();

        tracing::info!("Cloned {} to {}", source, name);
        Ok(CreateOutcome::Created)
    }

    async fn snapshot_locked(
        &self,
        source: &str,
        name: &str,
        expiration_hours: Option<u64>,
    ) -> Result<CreateOutcome> {
        let src = self.require_available(source).await?;
        let mut record = VolumeRecord::new(name, &self.config.name, ResourceKind::Volume, src.size);
        record.provisioning = src.provisioning;
        record.parent = Some(source.to_string());
        if !self.insert_record(&record).await? {
            return Ok(CreateOutcome::Duplicate);
        }

        let meta = &self.ctx.meta;
        let mut saga = Saga::new(format!("snapshot {} as {}", source, name));
        saga.record("insert record", meta.delete_record(ResourceKind::Volume, name));
        saga.run_undo(
            "create snapshot",
            self.mediator.create_snapshot(source, name, expiration_hours),
            self.mediator.delete_snapshot(name),
        )
        .await?;
        saga.run_undo(
            "link to parent",
            async {
                let mut parent = src.clone();
                parent.snapshots.push(SnapshotRef {
                    name: name.to_string(),
                    created_at: record.created_at,
                    expiration_hours,
                });
                meta.put_record(&parent).await
            },
            self.unlink_snapshot(source, name),
        )
        .await?;
        saga.run("mark available", async {
            record.transition(VolumeStatus::Available)?;
            meta.put_record(&record).await
        })
        .await?;
        saga.commit();

        tracing::info!("Created snapshot {} of {}", name, source);
        Ok(CreateOutcome::Created)
    }

    async fn unlink_snapshot(&self, parent: &str, snapshot: &str) -> Result<()> {
        let Some(mut record) = self
            .ctx
            .meta
            .get_record(ResourceKind::Volume, parent)
            .await?
        else {
            return Ok(());
        };
        record.snapshots.retain(|s| s.name != snapshot);
        self.ctx.meta.put_record(&record).await
    }

    async fn delete_locked(&self, name: &str) -> Result<()> {
        let record = self
            .ctx
            .meta
            .require_record(ResourceKind::Volume, name)
            .await?;
        if record.is_mounted() {
            return Err(Error::BadRequest(format!(
                "{} is mounted on {:?}",
                name,
                record.mounted_nodes()
            )));
        }
        if !record.snapshots.is_empty() {
            return Err(Error::BadRequest(format!(
                "{} has {} snapshot(s)",
                name,
                record.snapshots.len()
            )));
        }

        if let Some(rcg) = &record.rcg_info {
            self.leave_rcg(name, rcg).await?;
        }
        match &record.parent {
            Some(parent) => {
                ignore_not_found(self.mediator.delete_snapshot(name).await, name)?;
                self.unlink_snapshot(parent, name).await?;
            }
            None => ignore_not_found(self.mediator.delete_volume(name).await, name)?,
        }
        self.ctx
            .meta
            .delete_record(ResourceKind::Volume, name)
            .await?;

        tracing::info!("Deleted volume {} from backend {}", name, self.config.name);
        Ok(())
    }
}

#[async_trait]
impl StorageDriver for BlockDriver {
    fn kind(&self) -> DriverKind {
        self.config.driver
    }

    async fn create(&self, name: &str, opts: CreateOptions) -> Result<CreateOutcome> {
        let Some(lock) = self.claim_name(name).await? else {
            return Ok(CreateOutcome::Duplicate);
        };
        let result = self.create_locked(name, opts).await;
        self.ctx.locks.release(&lock).await;
        result
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let record = self
            .ctx
            .meta
            .require_record(ResourceKind::Volume, name)
            .await?;
        let mut locks = Vec::new();
        if let Some(parent) = &record.parent {
            locks.push(names::volume(parent));
        }
        locks.push(names::volume(name));

        self.ctx.locks.acquire_ordered(&locks).await?;
        let result = self.delete_locked(name).await;
        self.ctx.locks.release_all(&locks).await;
        result
    }

    async fn mount(&self, name: &str, mount_id: &str) -> Result<PathInfo> {
        self.ctx
            .fencer
            .mount(ResourceKind::Volume, name, &self.ctx.node_id, mount_id, self)
            .await
    }

    async fn unmount(&self, name: &str, mount_id: &str) -> Result<()> {
        self.ctx
            .fencer
            .unmount(ResourceKind::Volume, name, &self.ctx.node_id, mount_id, self)
            .await
    }

    async fn clone_volume(
        &self,
        source: &str,
        name: &str,
        opts: CreateOptions,
    ) -> Result<CreateOutcome> {
        self.with_source(source, name, || self.clone_locked(source, name, opts))
            .await
    }

    async fn create_snapshot(
        &self,
        source: &str,
        name: &str,
        expiration_hours: Option<u64>,
    ) -> Result<CreateOutcome> {
        self.with_source(source, name, || {
            self.snapshot_locked(source, name, expiration_hours)
        })
        .await
    }

    async fn import(&self, existing: &str, opts: CreateOptions) -> Result<CreateOutcome> {
        let Some(lock) = self.claim_name(existing).await? else {
            return Ok(CreateOutcome::Duplicate);
        };
        let result = async {
            let volume = self
                .mediator
                .get_volume(existing)
                .await?
                .ok_or_else(|| Error::NotFound(format!("array volume {}", existing)))?;
            let mut record = self.new_record(existing, volume.size_gib, &opts);
            record.transition(VolumeStatus::Available)?;
            if !self.insert_record(&record).await? {
                return Ok(CreateOutcome::Duplicate);
            }
            tracing::info!(
                "Imported array volume {} ({} GiB, CPG {})",
                existing,
                volume.size_gib,
                volume.cpg
            );
            Ok(CreateOutcome::Created)
        }
        .await;
        self.ctx.locks.release(&lock).await;
        result
    }
}

#[async_trait]
impl MountTarget for BlockDriver {
    async fn force_remove_export(&self, record: &VolumeRecord) -> Result<()> {
        let arrays = if self.exports_on_both(record) {
            self.arrays_of(record)
        } else {
            vec![self.array(self.active_array(record).await?)?]
        };
        for array in arrays {
            ignore_not_found(array.force_remove_exports(&record.name).await, &record.name)?;
        }
        Ok(())
    }

    async fn attach(&self, record: &VolumeRecord) -> Result<PathInfo> {
        let name = record.name.as_str();
        let host = self.ctx.host_identity();
        let dir = mount_dir(&self.config, name);
        let fs_type = self.config.fs_type.as_str();
        let active = self.active_array(record).await?;
        let primary = self.array(active)?;

        let mut saga = Saga::new(format!("attach {}", name));
        let export = saga
            .run_undo(
                "export volume",
                primary.export_volume(name, &host),
                primary.unexport_volume(name, &host),
            )
            .await?;
        if self.exports_on_both(record) {
            let peer = self.array(match active {
                ActiveArray::Local => ActiveArray::Remote,
                ActiveArray::Remote => ActiveArray::Local,
            })?;
            saga.run_undo(
                "export volume on peer",
                peer.export_volume(name, &host),
                peer.unexport_volume(name, &host),
            )
            .await?;
        }

        let fs = &self.ctx.host;
        let device = saga
            .run_with("connect device", fs.connect_device(&export), move |device| {
                let device = device.clone();
                async move { fs.disconnect_device(&device).await }.boxed()
            })
            .await?;
        let formatted = saga
            .run("check filesystem", fs.has_filesystem(&device))
            .await?;
        if !formatted {
            let dev = device.as_str();
            saga.run(
                "create filesystem",
                retry_with_backoff(
                    || fs.create_filesystem(dev, fs_type),
                    self.config.format_retries,
                    FORMAT_RETRY_DELAY,
                ),
            )
            .await?;
        }
        saga.run_undo("create mount dir", fs.create_dir(&dir), fs.remove_dir(&dir))
            .await?;
        saga.run_undo("mount", fs.mount(&device, &dir, fs_type), fs.unmount(&dir))
            .await?;
        saga.run(
            "apply ownership",
            apply_ownership(
                fs.as_ref(),
                &dir,
                record.fs_owner.as_deref().or(self.config.fs_owner.as_deref()),
                record.fs_mode.as_deref().or(self.config.fs_mode.as_deref()),
            ),
        )
        .await?;
        saga.commit();

        Ok(PathInfo {
            export,
            device_path: Some(device),
            mount_dir: dir,
        })
    }

    async fn detach(&self, record: &VolumeRecord, path: &PathInfo) -> Result<()> {
        let fs = &self.ctx.host;
        fs.unmount(&path.mount_dir).await?;
        if let Err(e) = fs.remove_dir(&path.mount_dir).await {
            tracing::warn!("Could not remove {}: {}", path.mount_dir, e);
        }
        if let Some(device) = &path.device_path {
            fs.disconnect_device(device).await?;
        }

        let host = self.ctx.host_identity();
        for array in self.arrays_of(record) {
            ignore_not_found(
                array.unexport_volume(&record.name, &host).await,
                &record.name,
            )?;
        }
        Ok(())
    }

    async fn cleanup_stale(&self, record: &VolumeRecord, path: &PathInfo) -> Result<()> {
        let fs = &self.ctx.host;
        if let Err(e) = fs.unmount(&path.mount_dir).await {
            tracing::warn!("Stale unmount of {} failed: {}", path.mount_dir, e);
        }
        if let Err(e) = fs.remove_dir(&path.mount_dir).await {
            tracing::warn!("Stale mount dir {} not removed: {}", path.mount_dir, e);
        }
        if let Some(device) = &path.device_path {
            if let Err(e) = fs.disconnect_device(device).await {
                tracing::warn!(
                    "Stale device {} of {} not disconnected: {}",
                    device,
                    record.name,
                    e
                );
            }
        }
        Ok(())
    }
}
