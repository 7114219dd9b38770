//! Storage backends
//!
//! Drivers turn orchestrator requests into array and host operations. The
//! array REST client and the host's device/filesystem tooling sit behind
//! the [`mediator::ArrayMediator`] and [`host::HostFs`] traits.

pub mod block;
pub mod driver;
pub mod file;
pub mod host;
pub mod mediator;
pub mod sim;

pub use driver::{CreateOptions, CreateOutcome, StorageDriver};
