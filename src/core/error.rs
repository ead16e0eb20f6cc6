//! Error types for the region coordinator.

use thiserror::Error;

/// Result type alias for coordinator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while coordinating regions.
#[derive(Error, Debug)]
pub enum Error {
    // Startup errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    // Topology errors
    #[error("Unknown region: {0}")]
    UnknownRegion(String),

    #[error("No healthy region available, cluster is degraded")]
    NoHealthyRegion,

    #[error("No primary region available, cluster is degraded")]
    NoPrimary,

    // Health probe errors
    #[error("Probe of region {0} timed out")]
    ProbeTimeout(String),

    #[error("Probe of region {region} failed: {reason}")]
    ProbeError { region: String, reason: String },

    // Replication errors
    #[error("Write to region {region} failed: {reason}")]
    ApplyFailed { region: String, reason: String },

    #[error("Replication to {target} failed after {attempts} attempts: {reason}")]
    ReplicationFailed {
        target: String,
        attempts: u32,
        reason: String,
    },

    #[error("Unknown replication task: {0}")]
    UnknownTask(String),

    #[error("Re-drive rejected: {0}")]
    RedriveRejected(String),

    // Failover errors
    #[error("Promotion of region {region} aborted: {reason}")]
    PromotionAborted { region: String, reason: String },

    // Store errors
    #[error("Store error: {0}")]
    Store(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error signals cluster-wide degradation that callers must surface.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Error::NoHealthyRegion | Error::NoPrimary)
    }

    /// Whether this error is a transient network/store failure absorbed by retries.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ProbeTimeout(_)
                | Error::ProbeError { .. }
                | Error::ApplyFailed { .. }
                | Error::Store(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}
