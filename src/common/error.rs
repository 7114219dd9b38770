//! Error types for volplane

use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Record Errors ===
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid state transition for {name}: {from} -> {to}")]
    InvalidTransition {
        name: String,
        from: String,
        to: String,
    },

    #[error("Record corrupted: {0}")]
    Serialization(#[from] serde_json::Error),

    // === Lock Errors ===
    #[error("Resource busy: lock '{0}' is held")]
    Busy(String),

    // === Capacity Errors ===
    #[error("FPG {fpg} has reached its share limit ({limit})")]
    FpgFull { fpg: String, limit: u32 },

    #[error("No default FPG configured for CPG {0}")]
    NoDefaultFpg(String),

    #[error("IP pool exhausted on backend {0}")]
    PoolExhausted(String),

    // === Backend Errors ===
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Backend {backend} is not initialized (state: {state})")]
    BackendNotInitialized { backend: String, state: String },

    // === Replication Errors ===
    #[error("Replication group {0} is in transition, retry later")]
    StateInTransition(String),

    #[error("Cannot determine active array for replication group {0}")]
    CannotDetermineActive(String),

    // === Input Errors ===
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),
}

impl Error {
    /// Capacity conditions drive the allocator fallback path instead of
    /// failing the request.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            Error::FpgFull { .. } | Error::NoDefaultFpg(_) | Error::PoolExhausted(_)
        )
    }

    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::BackendUnavailable(_) | Error::StateInTransition(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Message handed back to the plugin transport.
    pub fn reply_message(&self) -> String {
        self.to_string()
    }
}

/// Transport-facing result: an empty `err` on success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Reply {
    #[serde(rename = "Err")]
    pub err: String,
}

impl Reply {
    pub fn from_result<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::default(),
            Err(e) => Self {
                err: e.reply_message(),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.err.is_empty()
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

#[cfg(feature = "sled-backend")]
impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::BackendUnavailable(format!("sled: {}", e))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("worker failed: {}", e))
    }
}
