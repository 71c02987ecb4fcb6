//! The remote, identifier-ordered blob store ("grid").

pub mod error;
pub mod schema;
pub mod sqlite;
pub mod store;
#[cfg(test)]
pub mod testing;

use std::fmt;
use std::path::{Path, PathBuf};

pub use error::GridError;
pub use sqlite::SqliteGridStore;
pub use store::{GridStore, GridUpload, ObjectMetadata, Order};

use crate::error::SyncError;

const SQLITE_SCHEME: &str = "sqlite://";
const SQLITE_MEMORY: &str = "sqlite::memory:";

/// Where a grid store lives, parsed from a connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GridLocation {
    /// `sqlite://<path>`
    Sqlite(PathBuf),
    /// `sqlite::memory:`, private to the process.
    Memory,
}

impl GridLocation {
    pub fn parse(s: &str) -> Result<Self, SyncError> {
        let s = s.trim();
        if s == SQLITE_MEMORY {
            return Ok(Self::Memory);
        }
        match s.strip_prefix(SQLITE_SCHEME) {
            Some("") => Err(SyncError::InvalidLocation {
                location: s.to_string(),
                reason: "missing database path".to_string(),
            }),
            Some(path) => Ok(Self::Sqlite(PathBuf::from(path))),
            None => Err(SyncError::InvalidLocation {
                location: s.to_string(),
                reason: format!("expected {SQLITE_SCHEME}<path> or {SQLITE_MEMORY}"),
            }),
        }
    }

    /// Rewrite the database path, leaving in-memory locations alone.
    pub fn map_path(self, f: impl FnOnce(&Path) -> PathBuf) -> Self {
        match self {
            Self::Sqlite(path) => Self::Sqlite(f(&path)),
            Self::Memory => Self::Memory,
        }
    }
}

impl fmt::Display for GridLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite(path) => write!(f, "{SQLITE_SCHEME}{}", path.display()),
            Self::Memory => f.write_str(SQLITE_MEMORY),
        }
    }
}

/// Open the grid store at `location` for the given object-group prefix.
pub async fn connect(location: &GridLocation, prefix: &str) -> Result<SqliteGridStore, GridError> {
    match location {
        GridLocation::Sqlite(path) => SqliteGridStore::open(path, prefix).await,
        GridLocation::Memory => SqliteGridStore::open_in_memory(prefix),
    }
}
