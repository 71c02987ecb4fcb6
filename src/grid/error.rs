//! Error types for the grid store.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur talking to the grid store.
#[derive(Error, Debug)]
pub enum GridError {
    /// Failed to open or create the store.
    #[error("Failed to open grid store at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    /// Failed to create or upgrade the schema.
    #[error("Grid schema migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    /// A query or command failed.
    #[error("Grid query failed: {0}")]
    Query(String),

    /// Failed to spawn a blocking task.
    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    /// The object-group prefix cannot be used as a table namespace.
    #[error("Invalid object-group prefix {0:?} (expected letters, digits or '_')")]
    InvalidPrefix(String),

    /// The store's schema version is newer than supported.
    #[error("Grid schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },

    /// No committed object with this identifier.
    #[error("Grid object {0} not found")]
    NotFound(String),

    /// An upload targeted an identifier that is already committed.
    #[error("Grid object {0} already exists")]
    AlreadyExists(String),
}

impl GridError {
    /// Create a Query error from a rusqlite error.
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }
}
