//! # volplane
//!
//! Lifecycle orchestration for block volumes and file shares on storage
//! arrays, shared by every node of a container cluster:
//! - Distributed locks and metadata in a shared KV store
//! - Saga-based provisioning with compensating rollback
//! - FPG/VFS/IP pool allocation for file shares
//! - Mount fencing so a volume is live on at most one node
//! - Active-array resolution for replicated volumes

//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Orchestrator               │
//! │   registry ─ dispatch ─ name cache      │
//! └───────────┬─────────────────────────────┘
//!             │
//!   ┌─────────┴──────────┬──────────────┐
//!   │                    │              │
//! ┌─▼──────────┐   ┌─────▼──────┐   ┌───▼──────────┐
//! │ iSCSI      │   │ FC         │   │ File         │
//! │ (block)    │   │ (block)    │   │ (FPG/VFS)    │
//! └─────┬──────┘   └─────┬──────┘   └───┬──────────┘
//!       └────── locks · sagas · fencing ┘
//!                    │
//!            shared KV store
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Validate a configuration file
//! volplane check-config --config ./volplane.toml
//!
//! # Exercise the lifecycle against in-memory arrays
//! volplane simulate --shares 20
//! ```

#![allow(clippy::result_large_err)]

pub mod backend;
pub mod common;
pub mod coordinator;

// Re-export commonly used types
pub use backend::{CreateOptions, CreateOutcome};
pub use common::{Config, Error, Result};
pub use coordinator::Orchestrator;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
