//! The remote store boundary.
//!
//! The sync core only needs three things from the grid: ordered limit-1
//! identifier queries, a server-side content hash, and streamed
//! get/put/delete of object bytes. [`GridStore`] is exactly that surface.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::error::GridError;
use crate::blob_id::BlobId;

/// Lazily fetched object bytes, one chunk per item.
pub type ChunkStream = BoxStream<'static, Result<Bytes, GridError>>;

/// Sort direction for identifier queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

/// Free-form metadata attached to a committed object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Supplementary SHA-512 of the content, hex encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl ObjectMetadata {
    pub fn is_empty(&self) -> bool {
        self.hash.is_none()
    }
}

#[async_trait]
pub trait GridStore: Send + Sync {
    /// Human-readable location, for log lines.
    fn describe(&self) -> String;

    /// Number of committed objects.
    async fn count(&self) -> Result<u64, GridError>;

    /// The identifier immediately after (ascending) or before (descending)
    /// `previous`, or the first/last identifier when `previous` is `None`.
    async fn next_id(
        &self,
        previous: Option<&BlobId>,
        order: Order,
    ) -> Result<Option<BlobId>, GridError>;

    /// Whether a committed object exists.
    async fn exists(&self, id: &BlobId) -> Result<bool, GridError>;

    /// Server-computed SHA-256 over the stored bytes, hex encoded.
    /// `None` when no committed object exists.
    async fn file_checksum(&self, id: &BlobId) -> Result<Option<String>, GridError>;

    #[cfg(test)]
    async fn metadata(&self, id: &BlobId) -> Result<Option<ObjectMetadata>, GridError>;

    /// Stream a committed object's bytes in chunk order.
    async fn open_download(&self, id: &BlobId) -> Result<ChunkStream, GridError>;

    /// Begin writing a new object. Fails with [`GridError::AlreadyExists`]
    /// when `id` is already committed; leftover chunks from an abandoned
    /// upload are cleared first.
    async fn start_upload(&self, id: &BlobId) -> Result<Box<dyn GridUpload>, GridError>;

    /// Remove an object and all of its chunks, committed or not.
    /// Returns whether anything was removed.
    async fn delete(&self, id: &BlobId) -> Result<bool, GridError>;
}

/// An in-progress object upload.
#[async_trait]
pub trait GridUpload: Send {
    async fn write(&mut self, data: &[u8]) -> Result<(), GridError>;

    /// Flush buffered bytes and commit the object, making it visible to
    /// queries. Returns the object length.
    async fn finish(&mut self, metadata: &ObjectMetadata) -> Result<u64, GridError>;

    /// Best-effort removal of everything written so far, committed or not.
    /// Never fails; returns whether the object and its chunks are gone.
    async fn discard(self: Box<Self>) -> bool;
}
