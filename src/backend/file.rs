//! File driver (file persona shares)
//!
//! Share creation is asynchronous: `create` inserts a CREATING record and
//! hands the provisioning saga to a tracked worker. The worker settles the
//! record as AVAILABLE or FAILED (with the error) and its handle is the
//! completion signal.
//!
//! Placement prefers the CPG's default FPG. When that is missing or full a
//! new FPG is built under the CPG lock: unique FPG/VFS names, the FPG
//! itself, a pool address, the VFS, and finally the default pointer. A
//! failure while building undoes every piece. Once built, the FPG may take
//! shares from other workers, so a later failure of the share that built
//! it only retires the FPG if it is still empty.

use crate::backend::driver::{
    apply_ownership, ignore_not_found, mount_dir, CreateOptions, CreateOutcome, EngineContext,
    ShareCreation, StorageDriver,
};
use crate::backend::mediator::ArrayMediator;
use crate::common::{validate_name, BackendConfig, DriverKind, Error, Result};
use crate::coordinator::fencing::MountTarget;
use crate::coordinator::lock::names;
use crate::coordinator::metadata::{
    FpgMetadata, PathInfo, ResourceKind, ShareDetails, VolumeRecord, VolumeStatus,
};
use crate::coordinator::placement::PoolAllocator;
use crate::coordinator::saga::{Saga, SagaFailure};
use async_trait::async_trait;
use futures::FutureExt;
use std::sync::Arc;

const NFS: &str = "nfs";

#[derive(Clone)]
pub struct FileDriver {
    config: Arc<BackendConfig>,
    ctx: EngineContext,
    mediator: Arc<dyn ArrayMediator>,
    allocator: Arc<PoolAllocator>,
}

impl FileDriver {
    pub fn new(
        config: BackendConfig,
        ctx: EngineContext,
        mediator: Arc<dyn ArrayMediator>,
    ) -> Self {
        let allocator = PoolAllocator::new(
            &config.name,
            ctx.meta.clone(),
            ctx.locks.clone(),
            config.ip_pool.clone(),
            &config.netmask,
        );
        Self {
            config: Arc::new(config),
            ctx,
            mediator,
            allocator: Arc::new(allocator),
        }
    }

    /// Insert the CREATING record under the share lock; `false` on duplicates
    async fn claim(&self, name: &str, opts: &CreateOptions) -> Result<bool> {
        let lock = names::share(name);
        match self.ctx.locks.try_lock(&lock).await {
            Ok(()) => {}
            Err(Error::Busy(_)) => {
                tracing::info!("Create of share {} already in progress, ignoring duplicate", name);
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        let result = async {
            if self
                .ctx
                .meta
                .get_record(ResourceKind::Share, name)
                .await?
                .is_some()
            {
                tracing::info!("Share {} already exists, nothing to do", name);
                return Ok(false);
            }
            let mut record = VolumeRecord::new(
                name,
                &self.config.name,
                ResourceKind::Share,
                opts.size_gib.unwrap_or(0),
            );
            record.fs_owner = opts.fs_owner.clone();
            record.fs_mode = opts.fs_mode.clone();
            match self.ctx.meta.create_record(&record).await {
                Ok(()) => Ok(true),
                Err(Error::AlreadyExists(_)) => Ok(false),
                Err(e) => Err(e),
            }
        }
        .await;
        self.ctx.locks.release(&lock).await;
        result
    }

    /// Worker body: provision, then record the outcome on the share
    async fn run_provisioning(&self, name: &str, opts: CreateOptions) -> Result<()> {
        let outcome = self.provision(name, &opts).await;
        if let Err(failure) = &outcome {
            tracing::error!("{}", failure);
            let message = failure.error.to_string();
            let marked = self
                .ctx
                .locks
                .with_lock(&names::share(name), async {
                    let mut record = self
                        .ctx
                        .meta
                        .require_record(ResourceKind::Share, name)
                        .await?;
                    record.transition(VolumeStatus::Failed)?;
                    record.error = Some(message);
                    self.ctx.meta.put_record(&record).await
                })
                .await;
            if let Err(e) = marked {
                tracing::error!("Could not mark share {} as failed: {}", name, e);
            }
        }
        outcome.map_err(Error::from)
    }

    async fn provision(
        &self,
        name: &str,
        opts: &CreateOptions,
    ) -> std::result::Result<(), SagaFailure> {
        let cpg = opts
            .cpg
            .clone()
            .unwrap_or_else(|| self.config.default_cpg.clone());
        let mediator = &self.mediator;
        let mut saga = Saga::new(format!("create share {}", name));

        let fpg = match opts.fpg.as_deref() {
            Some(pinned) => self.place_on_fpg(&mut saga, &cpg, pinned).await?,
            None => self.place_on_default_fpg(&mut saga, &cpg).await?,
        };
        let fpg_name = fpg.fpg.clone();
        let Some(vfs_ip) = fpg.first_ip().map(str::to_string) else {
            let err = Error::InvariantViolation(format!("FPG {} has no VFS address", fpg.fpg));
            return Err(saga.abort("resolve vfs address", err).await);
        };

        let undo_fpg = fpg_name.clone();
        let share_path = saga
            .run_undo(
                "create share",
                mediator.create_share(&fpg.fpg, &fpg.vfs, name),
                async move { mediator.delete_share(&undo_fpg, name).await },
            )
            .await?;
        if let Some(size) = opts.size_gib.filter(|size| *size > 0) {
            let undo_fpg = fpg_name.clone();
            saga.run_undo(
                "set quota",
                mediator.set_quota(&fpg.fpg, name, size),
                async move { mediator.remove_quota(&undo_fpg, name).await },
            )
            .await?;
        }

        let details = ShareDetails {
            cpg: cpg.clone(),
            fpg: fpg.fpg.clone(),
            vfs: fpg.vfs.clone(),
            vfs_ip,
            share_path,
        };
        saga.run(
            "mark available",
            self.ctx.locks.with_lock(&names::share(name), async {
                let mut record = self
                    .ctx
                    .meta
                    .require_record(ResourceKind::Share, name)
                    .await?;
                record.share = Some(details);
                record.transition(VolumeStatus::Available)?;
                self.ctx.meta.put_record(&record).await
            }),
        )
        .await?;
        saga.commit();

        tracing::info!("Share {} available on FPG {} (CPG {})", name, fpg_name, cpg);
        Ok(())
    }

    /// Take a share slot on an FPG; the slot is returned on rollback
    async fn take_share_slot<'a>(
        &'a self,
        saga: &mut Saga<'a>,
        cpg: &str,
        fpg: &str,
    ) -> Result<FpgMetadata> {
        let meta = self.allocator.increment_share_count(cpg, fpg).await?;
        let allocator = &self.allocator;
        let (cpg, fpg) = (cpg.to_string(), fpg.to_string());
        saga.record("take share slot", async move {
            allocator.decrement_share_count(&cpg, &fpg).await.map(|_| ())
        });
        Ok(meta)
    }

    /// Share pinned to a named FPG, adopting it if volplane never saw it
    async fn place_on_fpg<'a>(
        &'a self,
        saga: &mut Saga<'a>,
        cpg: &str,
        fpg: &str,
    ) -> std::result::Result<FpgMetadata, SagaFailure> {
        let known = match self.ctx.meta.get_fpg(&self.config.name, cpg, fpg).await {
            Ok(known) => known,
            Err(e) => return Err(saga.abort("look up fpg", e).await),
        };
        if known.is_none() {
            let adopted = async {
                let array_fpg = self
                    .mediator
                    .get_fpg(fpg)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("fpg {}", fpg)))?;
                self.allocator.adopt_legacy_fpg(&array_fpg, cpg).await
            }
            .await;
            if let Err(e) = adopted {
                return Err(saga.abort("adopt legacy fpg", e).await);
            }
        }
        match self.take_share_slot(saga, cpg, fpg).await {
            Ok(meta) => Ok(meta),
            Err(e) => Err(saga.abort("take share slot", e).await),
        }
    }

    async fn place_on_default_fpg<'a>(
        &'a self,
        saga: &mut Saga<'a>,
        cpg: &str,
    ) -> std::result::Result<FpgMetadata, SagaFailure> {
        match self.allocator.get_default_fpg(cpg).await {
            Ok(fpg) => match self.take_share_slot(saga, cpg, &fpg.fpg).await {
                Ok(meta) => return Ok(meta),
                // Full, or retired since we looked it up
                Err(e) if e.is_capacity() || e.is_not_found() => {
                    tracing::info!("{}; creating a new FPG", e);
                }
                Err(e) => return Err(saga.abort("take share slot", e).await),
            },
            Err(e) if e.is_capacity() => {
                tracing::info!("{}; creating a new FPG", e);
            }
            Err(e) => return Err(saga.abort("look up default fpg", e).await),
        }

        let fpg = self.create_default_fpg(saga, cpg).await?;
        match self.take_share_slot(saga, cpg, &fpg.fpg).await {
            Ok(meta) => Ok(meta),
            Err(e) => Err(saga.abort("take share slot", e).await),
        }
    }

    /// Build a default FPG under the CPG lock. A FPG built here is retired
    /// on rollback only if no other share has landed on it by then.
    async fn create_default_fpg<'a>(
        &'a self,
        saga: &mut Saga<'a>,
        cpg: &str,
    ) -> std::result::Result<FpgMetadata, SagaFailure> {
        let lock = names::cpg(&self.config.name, cpg);
        if let Err(e) = self.ctx.locks.acquire(&lock).await {
            return Err(saga.abort("lock cpg", e).await);
        }
        let built = self.create_default_fpg_locked(cpg).await;
        self.ctx.locks.release(&lock).await;

        match built {
            Ok((meta, false)) => Ok(meta),
            Ok((meta, true)) => {
                let (undo_cpg, undo_fpg) = (cpg.to_string(), meta.fpg.clone());
                saga.record("create fpg", async move {
                    self.retire_fpg(&undo_cpg, &undo_fpg, true).await.map(|_| ())
                });
                Ok(meta)
            }
            Err(inner) => {
                let SagaFailure {
                    step,
                    error,
                    warnings,
                    ..
                } = inner;
                let mut failure = saga.abort(step, error).await;
                failure.warnings.extend(warnings);
                Err(failure)
            }
        }
    }

    /// The default FPG, and whether this call built it
    async fn create_default_fpg_locked(
        &self,
        cpg: &str,
    ) -> std::result::Result<(FpgMetadata, bool), SagaFailure> {
        // Another worker may have built one while we waited for the lock
        if let Ok(fpg) = self.allocator.get_default_fpg(cpg).await {
            return Ok((fpg, false));
        }
        self.build_fpg(cpg).await.map(|meta| (meta, true))
    }

    /// FPG, pool address, VFS and default pointer, all or nothing
    async fn build_fpg(&self, cpg: &str) -> std::result::Result<FpgMetadata, SagaFailure> {
        let mediator = &self.mediator;
        let allocator = &self.allocator;
        let size = self.config.default_fpg_size_tib;
        let mut saga = Saga::new(format!("create fpg on cpg {}", cpg));

        let mut created = None;
        for _ in 0..self.config.fpg_name_retry_limit {
            let (fpg, vfs) = match allocator.generate_fpg_vfs_names().await {
                Ok(names) => names,
                Err(e) => return Err(saga.abort("generate fpg name", e).await),
            };
            match mediator.create_fpg(cpg, &fpg, size).await {
                Ok(()) => {
                    created = Some((fpg, vfs));
                    break;
                }
                Err(Error::AlreadyExists(_)) => {
                    tracing::warn!("FPG {} already exists on the array, trying the next name", fpg);
                }
                Err(e) => return Err(saga.abort("create fpg", e).await),
            }
        }
        let Some((fpg, vfs)) = created else {
            let err = Error::Internal(format!(
                "no free FPG name after {} attempts",
                self.config.fpg_name_retry_limit
            ));
            return Err(saga.abort("create fpg", err).await);
        };
        let undo_fpg = fpg.clone();
        saga.record("create fpg", async move { mediator.delete_fpg(&undo_fpg).await });

        let live = saga.run("list assigned ips", mediator.assigned_ips()).await?;
        let ip = saga
            .run_with("claim ip", allocator.claim_ip(&live), move |ip| {
                let ip = ip.clone();
                async move { allocator.release_ip(&ip).await }.boxed()
            })
            .await?;
        saga.run("create vfs", mediator.create_vfs(&fpg, &vfs, &ip, allocator.netmask()))
            .await?;
        saga.run("mark ip in use", allocator.mark_ip_in_use(&ip)).await?;

        let mut meta = FpgMetadata::new(&fpg, cpg, size, &vfs);
        meta.ips.insert(allocator.netmask().to_string(), vec![ip.clone()]);
        let (undo_cpg, undo_fpg) = (cpg.to_string(), fpg.clone());
        saga.record("register default fpg", async move {
            allocator.forget_fpg(&undo_cpg, &undo_fpg).await
        });
        saga.run("register default fpg", allocator.register_fpg(&meta, true))
            .await?;
        saga.commit();

        tracing::info!(
            "Created FPG {} with VFS {} ({}) on CPG {} of backend {}",
            fpg,
            vfs,
            ip,
            cpg,
            self.config.name
        );
        Ok(meta)
    }

    /// Remove an FPG that hosts no shares, unless it was adopted. The CPG
    /// default is kept unless `include_default` is set. Holds the CPG lock
    /// then the FPG lock, so a share slot is either taken before the check
    /// or finds the FPG gone. Returns whether the FPG was removed.
    async fn retire_fpg(&self, cpg: &str, fpg: &str, include_default: bool) -> Result<bool> {
        let locks = &self.ctx.locks;
        locks
            .with_lock(
                &names::cpg(&self.config.name, cpg),
                locks.with_lock(
                    &names::fpg(&self.config.name, cpg, fpg),
                    self.retire_fpg_locked(cpg, fpg, include_default),
                ),
            )
            .await
    }

    async fn retire_fpg_locked(
        &self,
        cpg: &str,
        fpg: &str,
        include_default: bool,
    ) -> Result<bool> {
        let Some(meta) = self.ctx.meta.get_fpg(&self.config.name, cpg, fpg).await? else {
            return Ok(false);
        };
        if meta.share_cnt > 0 || meta.legacy {
            tracing::debug!("FPG {} still hosts {} share(s), keeping it", fpg, meta.share_cnt);
            return Ok(false);
        }
        if !include_default && self.allocator.default_fpg_name(cpg).await?.as_deref() == Some(fpg)
        {
            return Ok(false);
        }

        ignore_not_found(self.mediator.delete_fpg(fpg).await, fpg)?;
        for ip in meta.ips.values().flatten() {
            self.allocator.release_ip(ip).await?;
        }
        self.allocator.forget_fpg(cpg, fpg).await?;
        tracing::info!("Retired empty FPG {} of CPG {}", fpg, cpg);
        Ok(true)
    }

    async fn delete_locked(&self, name: &str) -> Result<Option<ShareDetails>> {
        let record = self
            .ctx
            .meta
            .require_record(ResourceKind::Share, name)
            .await?;
        if record.status == VolumeStatus::Creating {
            return Err(Error::BadRequest(format!("share {} is still being created", name)));
        }
        if record.is_mounted() {
            return Err(Error::BadRequest(format!(
                "share {} is mounted on {:?}",
                name,
                record.mounted_nodes()
            )));
        }

        if let Some(details) = &record.share {
            ignore_not_found(self.mediator.remove_quota(&details.fpg, name).await, name)?;
            ignore_not_found(self.mediator.delete_share(&details.fpg, name).await, name)?;
            match self
                .allocator
                .decrement_share_count(&details.cpg, &details.fpg)
                .await
            {
                Ok(_) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.ctx
            .meta
            .delete_record(ResourceKind::Share, name)
            .await?;
        tracing::info!("Deleted share {} from backend {}", name, self.config.name);
        Ok(record.share)
    }

    fn placement<'r>(&self, record: &'r VolumeRecord) -> Result<&'r ShareDetails> {
        record.share.as_ref().ok_or_else(|| {
            Error::InvariantViolation(format!("share {} has no placement", record.name))
        })
    }
}

#[async_trait]
impl StorageDriver for FileDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::File
    }

    async fn create(&self, name: &str, opts: CreateOptions) -> Result<CreateOutcome> {
        validate_name(name)?;
        if !self.claim(name, &opts).await? {
            return Ok(CreateOutcome::Duplicate);
        }

        let worker = self.clone();
        let share = name.to_string();
        let handle = self
            .ctx
            .tasks
            .spawn(async move { worker.run_provisioning(&share, opts).await });
        tracing::info!("Share {} accepted, provisioning in the background", name);
        Ok(CreateOutcome::Pending(ShareCreation::new(name, handle)))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let details = self
            .ctx
            .locks
            .with_lock(&names::share(name), self.delete_locked(name))
            .await?;
        if let Some(details) = details {
            if let Err(e) = self.retire_fpg(&details.cpg, &details.fpg, false).await {
                tracing::warn!("Could not retire FPG {}: {}", details.fpg, e);
            }
        }
        Ok(())
    }

    async fn mount(&self, name: &str, mount_id: &str) -> Result<PathInfo> {
        self.ctx
            .fencer
            .mount(ResourceKind::Share, name, &self.ctx.node_id, mount_id, self)
            .await
    }

    async fn unmount(&self, name: &str, mount_id: &str) -> Result<()> {
        self.ctx
            .fencer
            .unmount(ResourceKind::Share, name, &self.ctx.node_id, mount_id, self)
            .await
    }
}

#[async_trait]
impl MountTarget for FileDriver {
    async fn force_remove_export(&self, record: &VolumeRecord) -> Result<()> {
        let details = self.placement(record)?;
        ignore_not_found(
            self.mediator
                .force_revoke_share_clients(&details.fpg, &record.name)
                .await,
            &record.name,
        )
    }

    async fn attach(&self, record: &VolumeRecord) -> Result<PathInfo> {
        let details = self.placement(record)?;
        let name = record.name.as_str();
        let host = self.ctx.host_identity();
        let dir = mount_dir(&self.config, name);
        let source = format!("{}:{}", details.vfs_ip, details.share_path);
        let mediator = &self.mediator;
        let fs = &self.ctx.host;

        let mut saga = Saga::new(format!("attach share {}", name));
        saga.run_undo(
            "allow client",
            mediator.allow_share_client(&details.fpg, name, &host),
            mediator.revoke_share_client(&details.fpg, name, &host),
        )
        .await?;
        saga.run_undo("create mount dir", fs.create_dir(&dir), fs.remove_dir(&dir))
            .await?;
        saga.run_undo("mount", fs.mount(&source, &dir, NFS), fs.unmount(&dir))
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
            export: source,
            device_path: None,
            mount_dir: dir,
        })
    }

    async fn detach(&self, record: &VolumeRecord, path: &PathInfo) -> Result<()> {
        let fs = &self.ctx.host;
        fs.unmount(&path.mount_dir).await?;
        if let Err(e) = fs.remove_dir(&path.mount_dir).await {
            tracing::warn!("Could not remove {}: {}", path.mount_dir, e);
        }
        let details = self.placement(record)?;
        let host = self.ctx.host_identity();
        ignore_not_found(
            self.mediator
                .revoke_share_client(&details.fpg, &record.name, &host)
                .await,
            &record.name,
        )
    }

    async fn cleanup_stale(&self, record: &VolumeRecord, path: &PathInfo) -> Result<()> {
        let fs = &self.ctx.host;
        if let Err(e) = fs.unmount(&path.mount_dir).await {
            tracing::warn!("Stale unmount of share {} failed: {}", record.name, e);
        }
        if let Err(e) = fs.remove_dir(&path.mount_dir).await {
            tracing::warn!("Stale mount dir {} not removed: {}", path.mount_dir, e);
        }
        Ok(())
    }
}
