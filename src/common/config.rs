//! Configuration for volplane components

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment prefix for overrides, e.g. `VOLPLANE__NODE_ID=host-2`.
pub const CONFIG_ENV_PREFIX: &str = "VOLPLANE";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier of this container host)
    pub node_id: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub kv: KvConfig,

    #[serde(default)]
    pub fencing: FencingConfig,

    #[serde(default)]
    pub locks: LockConfig,

    /// Array backends, one handle each
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvBackend {
    Memory,
    Sled,
}

/// Shared KV store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    #[serde(default = "default_kv_backend")]
    pub backend: KvBackend,

    /// On-disk path (sled only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Key prefix under which lock entries live
    #[serde(default = "default_lock_namespace")]
    pub lock_namespace: String,
}

fn default_kv_backend() -> KvBackend {
    KvBackend::Memory
}
fn default_lock_namespace() -> String {
    "locks".to_string()
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            backend: default_kv_backend(),
            path: None,
            lock_namespace: default_lock_namespace(),
        }
    }
}

/// Cross-node mount arbitration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FencingConfig {
    /// How long a conflicting mount waits before forcing a takeover
    #[serde(default = "default_mount_conflict_delay")]
    pub mount_conflict_delay_secs: u64,

    /// Re-read interval during the wait
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_mount_conflict_delay() -> u64 {
    30
}
fn default_poll_interval() -> u64 {
    1000
}

impl FencingConfig {
    pub fn mount_conflict_delay(&self) -> Duration {
        Duration::from_secs(self.mount_conflict_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for FencingConfig {
    fn default() -> Self {
        Self {
            mount_conflict_delay_secs: default_mount_conflict_delay(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

/// Waiting-acquire policy for serialized (non create-style) operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,
}

fn default_acquire_timeout() -> u64 {
    120
}
fn default_retry_interval() -> u64 {
    250
}

impl LockConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_secs: default_acquire_timeout(),
            retry_interval_ms: default_retry_interval(),
        }
    }
}

/// Driver variant for a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Iscsi,
    Fc,
    File,
}

impl DriverKind {
    pub fn is_block(&self) -> bool {
        matches!(self, DriverKind::Iscsi | DriverKind::Fc)
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverKind::Iscsi => write!(f, "iscsi"),
            DriverKind::Fc => write!(f, "fc"),
            DriverKind::File => write!(f, "file"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    Periodic,
    Synchronous,
    Streaming,
}

/// Remote-copy settings for a backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Name of the secondary array
    pub remote_array: String,

    #[serde(default = "default_replication_mode")]
    pub mode: ReplicationMode,

    /// Peer Persistence: both arrays export the volume; takeovers must
    /// fence on both sides.
    #[serde(default)]
    pub peer_persistence: bool,
}

fn default_replication_mode() -> ReplicationMode {
    ReplicationMode::Synchronous
}

/// One configured array backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,

    pub driver: DriverKind,

    /// Array management endpoint
    #[serde(default)]
    pub array_url: String,

    #[serde(default = "default_cpg")]
    pub default_cpg: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub snap_cpg: Option<String>,

    /// Addresses available for VFS creation (file driver)
    #[serde(default)]
    pub ip_pool: Vec<String>,

    #[serde(default = "default_netmask")]
    pub netmask: String,

    #[serde(default = "default_fpg_size")]
    pub default_fpg_size_tib: u64,

    #[serde(default = "default_fs_type")]
    pub fs_type: String,

    /// `uid:gid` applied to fresh mounts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fs_owner: Option<String>,

    /// Octal mode applied to fresh mounts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fs_mode: Option<String>,

    #[serde(default = "default_mount_prefix")]
    pub mount_prefix: PathBuf,

    #[serde(default = "default_format_retries")]
    pub format_retries: usize,

    #[serde(default = "default_fpg_name_retry_limit")]
    pub fpg_name_retry_limit: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication: Option<ReplicationConfig>,
}

fn default_cpg() -> String {
    "FC_r6".to_string()
}
fn default_netmask() -> String {
    "255.255.255.0".to_string()
}
fn default_fpg_size() -> u64 {
    16
}
fn default_fs_type() -> String {
    "ext4".to_string()
}
fn default_mount_prefix() -> PathBuf {
    PathBuf::from("/opt/volplane/mounts")
}
fn default_format_retries() -> usize {
    3
}
fn default_fpg_name_retry_limit() -> usize {
    32
}

impl BackendConfig {
    /// Minimal backend with defaults, mostly for tests and the simulator
    pub fn new(name: impl Into<String>, driver: DriverKind) -> Self {
        Self {
            name: name.into(),
            driver,
            array_url: String::new(),
            default_cpg: default_cpg(),
            snap_cpg: None,
            ip_pool: Vec::new(),
            netmask: default_netmask(),
            default_fpg_size_tib: default_fpg_size(),
            fs_type: default_fs_type(),
            fs_owner: None,
            fs_mode: None,
            mount_prefix: default_mount_prefix(),
            format_retries: default_format_retries(),
            fpg_name_retry_limit: default_fpg_name_retry_limit(),
            replication: None,
        }
    }

    pub fn peer_persistence(&self) -> bool {
        self.replication
            .as_ref()
            .map(|r| r.peer_persistence)
            .unwrap_or(false)
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then from
    /// `VOLPLANE__*` environment variables (which take priority).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .set_default("node_id", default_node_id())?
            .set_default("log_level", default_log_level())?;

        if let Some(path) = path {
            let path = path
                .to_str()
                .ok_or_else(|| Error::InvalidConfig("config path is not UTF-8".into()))?;
            builder = builder.add_source(File::new(path, FileFormat::Toml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(Error::InvalidConfig("node_id cannot be empty".into()));
        }
        if self.fencing.poll_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "fencing.poll_interval_ms must be positive".into(),
            ));
        }
        if self.locks.retry_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "locks.retry_interval_ms must be positive".into(),
            ));
        }
        if self.kv.backend == KvBackend::Sled && self.kv.path.is_none() {
            return Err(Error::InvalidConfig("kv.path is required for sled".into()));
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate backend name: {}",
                    backend.name
                )));
            }
            if backend.driver == DriverKind::File && backend.ip_pool.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "file backend {} needs a non-empty ip_pool",
                    backend.name
                )));
            }
            if backend.fpg_name_retry_limit == 0 {
                return Err(Error::InvalidConfig(format!(
                    "backend {}: fpg_name_retry_limit must be positive",
                    backend.name
                )));
            }
        }

        Ok(())
    }

    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }
}

fn default_node_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            log_level: default_log_level(),
            kv: KvConfig::default(),
            fencing: FencingConfig::default(),
            locks: LockConfig::default(),
            backends: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.fencing.mount_conflict_delay(), Duration::from_secs(30));
        assert_eq!(config.fencing.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.kv.backend, KvBackend::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
node_id = "host-1"

[fencing]
mount_conflict_delay_secs = 5

[[backends]]
name = "primary"
driver = "iscsi"

[backends.replication]
remote_array = "array-b"
peer_persistence = true

[[backends]]
name = "files"
driver = "file"
ip_pool = ["10.0.0.10", "10.0.0.11"]
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.node_id, "host-1");
        assert_eq!(config.fencing.mount_conflict_delay_secs, 5);
        assert_eq!(config.backends.len(), 2);

        let primary = config.backend("primary").unwrap();
        assert_eq!(primary.driver, DriverKind::Iscsi);
        assert!(primary.peer_persistence());
        assert_eq!(
            primary.replication.as_ref().unwrap().mode,
            ReplicationMode::Synchronous
        );

        let files = config.backend("files").unwrap();
        assert_eq!(files.ip_pool.len(), 2);
        assert_eq!(files.default_cpg, "FC_r6");
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let mut config = Config::default();
        config.backends.push(BackendConfig::new("a", DriverKind::Fc));
        config.backends.push(BackendConfig::new("a", DriverKind::Iscsi));
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_file_backend_needs_pool() {
        let mut config = Config::default();
        config.backends.push(BackendConfig::new("f", DriverKind::File));
        assert!(config.validate().is_err());
    }
}
