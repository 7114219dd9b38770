//! Common utilities and types shared across volplane

pub mod config;
pub mod error;
pub mod storage;
pub mod utils;

pub use config::{
    BackendConfig, Config, DriverKind, FencingConfig, KvBackend, KvConfig, LockConfig,
    ReplicationConfig, ReplicationMode,
};
pub use error::{Error, Reply, Result};
pub use storage::{open_store, KvStore, MemStore};
pub use utils::{decode_key, encode_key, retry_with_backoff, timestamp_now, validate_name};
