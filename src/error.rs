use std::path::PathBuf;

use thiserror::Error;

use crate::blob_id::BlobId;
use crate::grid::GridError;

/// Errors raised by resolvers, the transfer executor and the sync engine.
///
/// Everything here is fatal to the current run. Non-fatal conditions
/// (reconciliation gaps, verification mismatches, recovered partials) are
/// logged and reported in summaries instead of being raised.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Invalid identifier {0:?}")]
    InvalidIdentifier(String),

    #[error("Grid store error: {0}")]
    Connectivity(#[from] GridError),

    #[error("Checksum mismatch for {id}: local={local}, server={authoritative}")]
    IntegrityMismatch {
        id: BlobId,
        local: String,
        authoritative: String,
    },

    #[error("No authoritative checksum available for {0}")]
    MissingChecksum(BlobId),

    #[error("Disk error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unreadable open-transfer marker at {path}: {source}")]
    Marker {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid location {location:?}: {reason}")]
    InvalidLocation { location: String, reason: String },
}

impl SyncError {
    /// Whether this error means an object's bytes could not be trusted,
    /// as opposed to the stores being unreachable or misconfigured.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            SyncError::IntegrityMismatch { .. } | SyncError::MissingChecksum(_)
        )
    }
}
