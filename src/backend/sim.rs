//! In-memory array and host
//!
//! Back the `simulate` command and the test suites. Both keep a call log
//! and accept failure injection per operation name (the trait method name,
//! e.g. `"create_vfs"`), either for the next call only or permanently.

use crate::backend::host::HostFs;
use crate::backend::mediator::{
    ArrayFpg, ArrayMediator, ArrayVolume, HostIdentity, MediatorFactory, VolumeSpec,
};
use crate::common::{BackendConfig, Error, ReplicationMode, Result};
use crate::coordinator::replication::{RcgRole, RcgState};
use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Error to raise from an injected failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Unavailable,
    Conflict,
    NotFound,
    BadRequest,
}

impl FailureKind {
    fn to_error(self, op: &str) -> Error {
        let msg = format!("injected failure in {}", op);
        match self {
            FailureKind::Unavailable => Error::BackendUnavailable(msg),
            FailureKind::Conflict => Error::AlreadyExists(msg),
            FailureKind::NotFound => Error::NotFound(msg),
            FailureKind::BadRequest => Error::BadRequest(msg),
        }
    }
}

#[derive(Debug, Clone)]
struct Injection {
    kind: FailureKind,
    /// `None` fails forever
    remaining: Option<usize>,
}

/// Failure injection and call log shared by the simulators
#[derive(Debug, Default)]
struct Faults {
    injections: HashMap<String, Injection>,
    calls: Vec<String>,
}

impl Faults {
    fn check(&mut self, op: &str) -> Result<()> {
        self.calls.push(op.to_string());
        let Some(injection) = self.injections.get_mut(op) else {
            return Ok(());
        };
        let kind = injection.kind;
        let exhausted = match injection.remaining.as_mut() {
            None => false,
            Some(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
        };
        if exhausted {
            self.injections.remove(op);
        }
        Err(kind.to_error(op))
    }

    fn inject(&mut self, op: &str, kind: FailureKind, remaining: Option<usize>) {
        self.injections
            .insert(op.to_string(), Injection { kind, remaining });
    }

    fn count(&self, op: &str) -> usize {
        self.calls.iter().filter(|c| c.as_str() == op).count()
    }
}

#[derive(Debug, Clone, Default)]
struct SimShare {
    quota_gib: Option<u64>,
    clients: BTreeSet<String>,
}

#[derive(Debug, Clone)]
struct SimRcg {
    state: RcgState,
    volumes: BTreeMap<String, String>,
    started: bool,
}

#[derive(Debug)]
struct ArrayState {
    reachable: bool,
    faults: Faults,
    volumes: BTreeMap<String, ArrayVolume>,
    snapshots: BTreeMap<String, String>,
    exports: BTreeMap<String, BTreeSet<String>>,
    next_lun: u32,
    fpgs: BTreeMap<String, ArrayFpg>,
    shares: BTreeMap<(String, String), SimShare>,
    rcgs: BTreeMap<String, SimRcg>,
}

/// An array kept entirely in memory
pub struct SimulatedArray {
    name: String,
    state: Mutex<ArrayState>,
}

impl SimulatedArray {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(ArrayState {
                reachable: true,
                faults: Faults::default(),
                volumes: BTreeMap::new(),
                snapshots: BTreeMap::new(),
                exports: BTreeMap::new(),
                next_lun: 0,
                fpgs: BTreeMap::new(),
                shares: BTreeMap::new(),
                rcgs: BTreeMap::new(),
            }),
        }
    }

    /// Fail the next call of `op`
    pub fn fail_once(&self, op: &str, kind: FailureKind) {
        self.state.lock().faults.inject(op, kind, Some(1));
    }

    /// Fail the next `times` calls of `op`
    pub fn fail_times(&self, op: &str, kind: FailureKind, times: usize) {
        if times > 0 {
            self.state.lock().faults.inject(op, kind, Some(times));
        }
    }

    pub fn fail_always(&self, op: &str, kind: FailureKind) {
        self.state.lock().faults.inject(op, kind, None);
    }

    pub fn clear_failures(&self) {
        self.state.lock().faults.injections.clear();
    }

    /// An unreachable array fails every call with `BackendUnavailable`
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().faults.calls.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.state.lock().faults.count(op)
    }

    pub fn add_volume(&self, name: &str, size_gib: u64, cpg: &str) {
        self.state.lock().volumes.insert(
            name.to_string(),
            ArrayVolume {
                name: name.to_string(),
                size_gib,
                cpg: cpg.to_string(),
            },
        );
    }

    /// Register an FPG created outside volplane
    pub fn add_fpg(&self, fpg: ArrayFpg) {
        self.state.lock().fpgs.insert(fpg.name.clone(), fpg);
    }

    pub fn set_rcg_state(&self, rcg: &str, state: RcgState) {
        let mut st = self.state.lock();
        st.rcgs
            .entry(rcg.to_string())
            .or_insert_with(|| SimRcg {
                state,
                volumes: BTreeMap::new(),
                started: true,
            })
            .state = state;
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.state.lock().volumes.contains_key(name)
    }

    pub fn has_snapshot(&self, name: &str) -> bool {
        self.state.lock().snapshots.contains_key(name)
    }

    pub fn fpg_names(&self) -> Vec<String> {
        self.state.lock().fpgs.keys().cloned().collect()
    }

    pub fn vfs_ips(&self) -> Vec<String> {
        self.state
            .lock()
            .fpgs
            .values()
            .filter_map(|f| f.vfs.as_ref().map(|(_, ip)| ip.clone()))
            .collect()
    }

    pub fn has_share(&self, fpg: &str, share: &str) -> bool {
        self.state
            .lock()
            .shares
            .contains_key(&(fpg.to_string(), share.to_string()))
    }

    pub fn quota_of(&self, fpg: &str, share: &str) -> Option<u64> {
        self.state
            .lock()
            .shares
            .get(&(fpg.to_string(), share.to_string()))
            .and_then(|s| s.quota_gib)
    }

    pub fn share_clients(&self, fpg: &str, share: &str) -> Vec<String> {
        self.state
            .lock()
            .shares
            .get(&(fpg.to_string(), share.to_string()))
            .map(|s| s.clients.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Hosts the volume is exported to
    pub fn exports_of(&self, volume: &str) -> Vec<String> {
        self.state
            .lock()
            .exports
            .get(volume)
            .map(|hosts| hosts.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn rcg_volumes(&self, rcg: &str) -> Vec<String> {
        self.state
            .lock()
            .rcgs
            .get(rcg)
            .map(|g| g.volumes.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_rcg(&self, rcg: &str) -> bool {
        self.state.lock().rcgs.contains_key(rcg)
    }

    /// Record the call and apply reachability and injected failures
    fn enter(&self, op: &str) -> Result<MutexGuard<'_, ArrayState>> {
        let mut st = self.state.lock();
        if !st.reachable {
            st.faults.calls.push(op.to_string());
            return Err(Error::BackendUnavailable(format!(
                "array {} is unreachable",
                self.name
            )));
        }
        st.faults.check(op)?;
        Ok(st)
    }
}

fn missing(what: &str, name: &str) -> Error {
    Error::NotFound(format!("{} {}", what, name))
}

#[async_trait]
impl ArrayMediator for SimulatedArray {
    fn array_name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<()> {
        self.enter("initialize").map(|_| ())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<()> {
        let mut st = self.enter("create_volume")?;
        if st.volumes.contains_key(&spec.name) {
            return Err(Error::AlreadyExists(format!("volume {}", spec.name)));
        }
        st.volumes.insert(
            spec.name.clone(),
            ArrayVolume {
                name: spec.name.clone(),
                size_gib: spec.size_gib,
                cpg: spec.cpg.clone(),
            },
        );
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        let mut st = self.enter("delete_volume")?;
        st.exports.remove(name);
        st.volumes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| missing("volume", name))
    }

    async fn get_volume(&self, name: &str) -> Result<Option<ArrayVolume>> {
        let st = self.enter("get_volume")?;
        Ok(st.volumes.get(name).cloned())
    }

    async fn clone_volume(&self, source: &str, target: &VolumeSpec) -> Result<()> {
        let mut st = self.enter("clone_volume")?;
        if !st.volumes.contains_key(source) {
            return Err(missing("volume", source));
        }
        if st.volumes.contains_key(&target.name) {
            return Err(Error::AlreadyExists(format!("volume {}", target.name)));
        }
        st.volumes.insert(
            target.name.clone(),
            ArrayVolume {
                name: target.name.clone(),
                size_gib: target.size_gib,
                cpg: target.cpg.clone(),
            },
        );
        Ok(())
    }

    async fn create_snapshot(
        &self,
        source: &str,
        snapshot: &str,
        _expiration_hours: Option<u64>,
    ) -> Result<()> {
        let mut st = self.enter("create_snapshot")?;
        if !st.volumes.contains_key(source) {
            return Err(missing("volume", source));
        }
        if st.snapshots.contains_key(snapshot) {
            return Err(Error::AlreadyExists(format!("snapshot {}", snapshot)));
        }
        st.snapshots
            .insert(snapshot.to_string(), source.to_string());
        Ok(())
    }

    async fn delete_snapshot(&self, snapshot: &str) -> Result<()> {
        let mut st = self.enter("delete_snapshot")?;
        st.snapshots
            .remove(snapshot)
            .map(|_| ())
            .ok_or_else(|| missing("snapshot", snapshot))
    }

    async fn export_volume(&self, name: &str, host: &HostIdentity) -> Result<String> {
        let mut st = self.enter("export_volume")?;
        if !st.volumes.contains_key(name) && !st.snapshots.contains_key(name) {
            return Err(missing("volume", name));
        }
        st.next_lun += 1;
        let lun = st.next_lun;
        st.exports
            .entry(name.to_string())
            .or_default()
            .insert(host.name.clone());
        Ok(format!("{}:{}:lun{}", self.name, name, lun))
    }

    async fn unexport_volume(&self, name: &str, host: &HostIdentity) -> Result<()> {
        let mut st = self.enter("unexport_volume")?;
        let hosts = st
            .exports
            .get_mut(name)
            .ok_or_else(|| missing("export of", name))?;
        if !hosts.remove(&host.name) {
            return Err(missing("export to", &host.name));
        }
        if hosts.is_empty() {
            st.exports.remove(name);
        }
        Ok(())
    }

    async fn force_remove_exports(&self, name: &str) -> Result<()> {
        let mut st = self.enter("force_remove_exports")?;
        st.exports.remove(name);
        Ok(())
    }

    async fn get_fpg(&self, fpg: &str) -> Result<Option<ArrayFpg>> {
        let st = self.enter("get_fpg")?;
        Ok(st.fpgs.get(fpg).cloned())
    }

    async fn create_fpg(&self, cpg: &str, fpg: &str, size_tib: u64) -> Result<()> {
        let mut st = self.enter("create_fpg")?;
        if st.fpgs.contains_key(fpg) {
            return Err(Error::AlreadyExists(format!("fpg {}", fpg)));
        }
        st.fpgs.insert(
            fpg.to_string(),
            ArrayFpg {
                name: fpg.to_string(),
                cpg: cpg.to_string(),
                size_tib,
                vfs: None,
            },
        );
        Ok(())
    }

    async fn delete_fpg(&self, fpg: &str) -> Result<()> {
        let mut st = self.enter("delete_fpg")?;
        st.shares.retain(|(f, _), _| f != fpg);
        st.fpgs
            .remove(fpg)
            .map(|_| ())
            .ok_or_else(|| missing("fpg", fpg))
    }

    async fn create_vfs(&self, fpg: &str, vfs: &str, ip: &str, _netmask: &str) -> Result<()> {
        let mut st = self.enter("create_vfs")?;
        let taken = st
            .fpgs
            .values()
            .any(|f| f.vfs.as_ref().is_some_and(|(_, addr)| addr == ip));
        if taken {
            return Err(Error::AlreadyExists(format!("address {}", ip)));
        }
        let entry = st.fpgs.get_mut(fpg).ok_or_else(|| missing("fpg", fpg))?;
        if entry.vfs.is_some() {
            return Err(Error::AlreadyExists(format!("vfs on {}", fpg)));
        }
        entry.vfs = Some((vfs.to_string(), ip.to_string()));
        Ok(())
    }

    async fn assigned_ips(&self) -> Result<Vec<String>> {
        let st = self.enter("assigned_ips")?;
        Ok(st
            .fpgs
            .values()
            .filter_map(|f| f.vfs.as_ref().map(|(_, ip)| ip.clone()))
            .collect())
    }

    async fn create_share(&self, fpg: &str, vfs: &str, share: &str) -> Result<String> {
        let mut st = self.enter("create_share")?;
        if !st.fpgs.contains_key(fpg) {
            return Err(missing("fpg", fpg));
        }
        let key = (fpg.to_string(), share.to_string());
        if st.shares.contains_key(&key) {
            return Err(Error::AlreadyExists(format!("share {}", share)));
        }
        st.shares.insert(key, SimShare::default());
        Ok(format!("/{}/{}/{}", fpg, vfs, share))
    }

    async fn delete_share(&self, fpg: &str, share: &str) -> Result<()> {
        let mut st = self.enter("delete_share")?;
        st.shares
            .remove(&(fpg.to_string(), share.to_string()))
            .map(|_| ())
            .ok_or_else(|| missing("share", share))
    }

    async fn set_quota(&self, fpg: &str, share: &str, size_gib: u64) -> Result<()> {
        let mut st = self.enter("set_quota")?;
        let entry = st
            .shares
            .get_mut(&(fpg.to_string(), share.to_string()))
            .ok_or_else(|| missing("share", share))?;
        entry.quota_gib = Some(size_gib);
        Ok(())
    }

    async fn remove_quota(&self, fpg: &str, share: &str) -> Result<()> {
        let mut st = self.enter("remove_quota")?;
        let entry = st
            .shares
            .get_mut(&(fpg.to_string(), share.to_string()))
            .ok_or_else(|| missing("share", share))?;
        entry.quota_gib = None;
        Ok(())
    }

    async fn allow_share_client(&self, fpg: &str, share: &str, host: &HostIdentity) -> Result<()> {
        let mut st = self.enter("allow_share_client")?;
        let entry = st
            .shares
            .get_mut(&(fpg.to_string(), share.to_string()))
            .ok_or_else(|| missing("share", share))?;
        entry.clients.insert(host.name.clone());
        Ok(())
    }

    async fn revoke_share_client(
        &self,
        fpg: &str,
        share: &str,
        host: &HostIdentity,
    ) -> Result<()> {
        let mut st = self.enter("revoke_share_client")?;
        let entry = st
            .shares
            .get_mut(&(fpg.to_string(), share.to_string()))
            .ok_or_else(|| missing("share", share))?;
        entry.clients.remove(&host.name);
        Ok(())
    }

    async fn force_revoke_share_clients(&self, fpg: &str, share: &str) -> Result<()> {
        let mut st = self.enter("force_revoke_share_clients")?;
        let entry = st
            .shares
            .get_mut(&(fpg.to_string(), share.to_string()))
            .ok_or_else(|| missing("share", share))?;
        entry.clients.clear();
        Ok(())
    }

    async fn get_rcg(&self, rcg: &str) -> Result<Option<RcgState>> {
        let st = self.enter("get_rcg")?;
        Ok(st.rcgs.get(rcg).map(|g| g.state))
    }

    async fn create_rcg(
        &self,
        rcg: &str,
        _remote_array: &str,
        _remote_rcg: &str,
        _mode: ReplicationMode,
    ) -> Result<()> {
        let mut st = self.enter("create_rcg")?;
        if st.rcgs.contains_key(rcg) {
            return Err(Error::AlreadyExists(format!("rcg {}", rcg)));
        }
        st.rcgs.insert(
            rcg.to_string(),
            SimRcg {
                state: RcgState::new(RcgRole::Primary, false),
                volumes: BTreeMap::new(),
                started: false,
            },
        );
        Ok(())
    }

    async fn delete_rcg(&self, rcg: &str) -> Result<()> {
        let mut st = self.enter("delete_rcg")?;
        st.rcgs
            .remove(rcg)
            .map(|_| ())
            .ok_or_else(|| missing("rcg", rcg))
    }

    async fn add_volume_to_rcg(&self, rcg: &str, volume: &str, remote_volume: &str) -> Result<()> {
        let mut st = self.enter("add_volume_to_rcg")?;
        if !st.volumes.contains_key(volume) {
            return Err(missing("volume", volume));
        }
        let group = st.rcgs.get_mut(rcg).ok_or_else(|| missing("rcg", rcg))?;
        if group.started {
            return Err(Error::Busy(format!("rcg {} must be stopped", rcg)));
        }
        group
            .volumes
            .insert(volume.to_string(), remote_volume.to_string());
        Ok(())
    }

    async fn remove_volume_from_rcg(&self, rcg: &str, volume: &str) -> Result<()> {
        let mut st = self.enter("remove_volume_from_rcg")?;
        let group = st.rcgs.get_mut(rcg).ok_or_else(|| missing("rcg", rcg))?;
        group
            .volumes
            .remove(volume)
            .map(|_| ())
            .ok_or_else(|| missing("rcg member", volume))
    }

    async fn start_rcg(&self, rcg: &str) -> Result<()> {
        let mut st = self.enter("start_rcg")?;
        let group = st.rcgs.get_mut(rcg).ok_or_else(|| missing("rcg", rcg))?;
        group.started = true;
        Ok(())
    }

    async fn stop_rcg(&self, rcg: &str) -> Result<()> {
        let mut st = self.enter("stop_rcg")?;
        let group = st.rcgs.get_mut(rcg).ok_or_else(|| missing("rcg", rcg))?;
        group.started = false;
        Ok(())
    }
}

/// Shared set of simulated arrays, looked up by name
#[derive(Default)]
pub struct SimulatedFabric {
    arrays: Mutex<BTreeMap<String, Arc<SimulatedArray>>>,
}

impl SimulatedFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// The array called `name`, created on first use
    pub fn array(&self, name: &str) -> Arc<SimulatedArray> {
        self.arrays
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(SimulatedArray::new(name)))
            .clone()
    }

    /// Arrays are named after their backend unless `array_url` is set
    fn array_name(backend: &BackendConfig) -> &str {
        if backend.array_url.is_empty() {
            &backend.name
        } else {
            &backend.array_url
        }
    }
}

#[async_trait]
impl MediatorFactory for SimulatedFabric {
    async fn connect(&self, backend: &BackendConfig) -> Result<Arc<dyn ArrayMediator>> {
        let array: Arc<dyn ArrayMediator> = self.array(Self::array_name(backend));
        Ok(array)
    }

    async fn connect_remote(
        &self,
        _backend: &BackendConfig,
        remote_array: &str,
    ) -> Result<Arc<dyn ArrayMediator>> {
        let array: Arc<dyn ArrayMediator> = self.array(remote_array);
        Ok(array)
    }
}

#[derive(Debug, Default)]
struct HostState {
    faults: Faults,
    next_device: u32,
    devices: BTreeMap<String, String>,
    formatted: BTreeSet<String>,
    dirs: BTreeSet<String>,
    mounts: BTreeMap<String, String>,
    ownership: BTreeMap<String, (Option<(u32, u32)>, Option<u32>)>,
}

/// A host whose devices and mounts live in memory
pub struct SimulatedHost {
    initiators: Vec<String>,
    state: Mutex<HostState>,
}

impl SimulatedHost {
    pub fn new(initiator: impl Into<String>) -> Self {
        Self {
            initiators: vec![initiator.into()],
            state: Mutex::new(HostState::default()),
        }
    }

    pub fn fail_once(&self, op: &str, kind: FailureKind) {
        self.state.lock().faults.inject(op, kind, Some(1));
    }

    pub fn fail_times(&self, op: &str, kind: FailureKind, times: usize) {
        if times > 0 {
            self.state.lock().faults.inject(op, kind, Some(times));
        }
    }

    pub fn fail_always(&self, op: &str, kind: FailureKind) {
        self.state.lock().faults.inject(op, kind, None);
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.state.lock().faults.count(op)
    }

    /// Mount target to source
    pub fn mounts(&self) -> BTreeMap<String, String> {
        self.state.lock().mounts.clone()
    }

    pub fn is_mounted(&self, target: &str) -> bool {
        self.state.lock().mounts.contains_key(target)
    }

    pub fn devices(&self) -> Vec<String> {
        self.state.lock().devices.keys().cloned().collect()
    }

    pub fn dirs(&self) -> Vec<String> {
        self.state.lock().dirs.iter().cloned().collect()
    }

    pub fn ownership_of(&self, path: &str) -> Option<(Option<(u32, u32)>, Option<u32>)> {
        self.state.lock().ownership.get(path).copied()
    }

    fn enter(&self, op: &str) -> Result<MutexGuard<'_, HostState>> {
        let mut st = self.state.lock();
        st.faults.check(op)?;
        Ok(st)
    }
}

#[async_trait]
impl HostFs for SimulatedHost {
    fn initiators(&self) -> Vec<String> {
        self.initiators.clone()
    }

    async fn connect_device(&self, export: &str) -> Result<String> {
        let mut st = self.enter("connect_device")?;
        st.next_device += 1;
        let device = format!("/dev/sim{}", st.next_device);
        st.devices.insert(device.clone(), export.to_string());
        Ok(device)
    }

    async fn disconnect_device(&self, device: &str) -> Result<()> {
        let mut st = self.enter("disconnect_device")?;
        st.devices
            .remove(device)
            .map(|_| ())
            .ok_or_else(|| missing("device", device))
    }

    async fn has_filesystem(&self, device: &str) -> Result<bool> {
        let st = self.enter("has_filesystem")?;
        Ok(st.formatted.contains(device))
    }

    async fn create_filesystem(&self, device: &str, _fs_type: &str) -> Result<()> {
        let mut st = self.enter("create_filesystem")?;
        if !st.devices.contains_key(device) {
            return Err(missing("device", device));
        }
        st.formatted.insert(device.to_string());
        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let mut st = self.enter("create_dir")?;
        st.dirs.insert(path.to_string());
        Ok(())
    }

    async fn remove_dir(&self, path: &str) -> Result<()> {
        let mut st = self.enter("remove_dir")?;
        st.dirs.remove(path);
        Ok(())
    }

    async fn mount(&self, source: &str, target: &str, _fs_type: &str) -> Result<()> {
        let mut st = self.enter("mount")?;
        if !st.dirs.contains(target) {
            return Err(missing("mount point", target));
        }
        if st.mounts.contains_key(target) {
            return Err(Error::AlreadyExists(format!("mount at {}", target)));
        }
        st.mounts.insert(target.to_string(), source.to_string());
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<()> {
        let mut st = self.enter("unmount")?;
        st.mounts
            .remove(target)
            .map(|_| ())
            .ok_or_else(|| missing("mount", target))
    }

    async fn set_ownership(
        &self,
        path: &str,
        owner: Option<(u32, u32)>,
        mode: Option<u32>,
    ) -> Result<()> {
        let mut st = self.enter("set_ownership")?;
        st.ownership.insert(path.to_string(), (owner, mode));
        Ok(())
    }
}
