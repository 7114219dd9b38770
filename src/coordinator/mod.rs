//! Coordination layer
//!
//! The coordinator is responsible for:
//! - Distributed locks over the shared KV store
//! - Resource records and allocator bookkeeping
//! - Saga execution with compensating rollback
//! - FPG/VFS/IP placement for file shares
//! - Cross-node mount fencing
//! - Replication target resolution
//! - Backend registry and request dispatch

pub mod fencing;
pub mod lock;
pub mod metadata;
pub mod orchestrator;
pub mod placement;
pub mod registry;
pub mod replication;
pub mod saga;

pub use orchestrator::Orchestrator;
