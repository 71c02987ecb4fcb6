//! Persisted record of the transfer in flight.
//!
//! Set before the first byte of an object is written and removed once the
//! transfer either verifies or has been cleaned up. A marker that survives
//! a run means the process died mid-transfer.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::blob_id::BlobId;
use crate::error::SyncError;
use crate::types::StoreKind;

pub const DEFAULT_FILE_NAME: &str = ".gridmirror-transfer.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenTransfer {
    pub id: BlobId,
    /// The store receiving the bytes, i.e. the one holding any partial artifact.
    pub store: StoreKind,
    pub location: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TransferMarker {
    path: PathBuf,
}

impl TransferMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Marker at the default file name inside `dir`.
    #[cfg(test)]
    pub fn in_directory(dir: &std::path::Path) -> Self {
        Self::new(dir.join(DEFAULT_FILE_NAME))
    }

    #[cfg(test)]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Option<OpenTransfer>, SyncError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| SyncError::Marker {
                path: self.path.clone(),
                source,
            })
    }

    /// Write the marker via a temp file and rename, so a reader never sees
    /// a torn record.
    pub async fn set(&self, open: &OpenTransfer) -> Result<(), SyncError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_vec_pretty(open).map_err(|source| SyncError::Marker {
            path: self.path.clone(),
            source,
        })?;

        let tmp_path = self.tmp_path();
        fs::write(&tmp_path, json).await?;
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), SyncError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(OsString::from)
            .unwrap_or_else(|| OsString::from(DEFAULT_FILE_NAME));
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
