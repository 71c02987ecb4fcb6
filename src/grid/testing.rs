//! Test helpers for code that talks to a grid store.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};

use super::error::GridError;
use super::sqlite::SqliteGridStore;
use super::store::{ChunkStream, GridStore, GridUpload, ObjectMetadata, Order};
use crate::blob_id::BlobId;

/// A fresh in-memory store with a small chunk size so multi-chunk paths
/// get exercised by short fixtures.
pub fn memory_grid() -> SqliteGridStore {
    SqliteGridStore::open_in_memory("fs")
        .expect("in-memory grid")
        .with_chunk_size(16)
}

/// An identifier created `secs_ago` seconds before now.
pub fn aged_id(secs_ago: i64) -> BlobId {
    BlobId::generate_at(Utc::now() - chrono::Duration::seconds(secs_ago))
}

/// Commit `data` under `id`.
pub async fn put(store: &dyn GridStore, id: &BlobId, data: &[u8]) {
    let mut upload = store.start_upload(id).await.expect("start upload");
    upload.write(data).await.expect("write");
    upload
        .finish(&ObjectMetadata::default())
        .await
        .expect("finish");
}

/// Wraps a real store and lies about it.
pub struct TamperedGrid {
    pub inner: SqliteGridStore,
    /// Added to every `count()` result.
    pub extra_count: u64,
    /// Report a checksum that never matches the stored bytes.
    pub bad_checksum: bool,
    /// Uploads whose `discard` fails and leaves the object behind.
    pub stuck_discard: bool,
    /// Downloads that break off after the first chunk.
    pub fail_download: bool,
}

impl TamperedGrid {
    pub fn new(inner: SqliteGridStore) -> Self {
        Self {
            inner,
            extra_count: 0,
            bad_checksum: false,
            stuck_discard: false,
            fail_download: false,
        }
    }
}

#[async_trait]
impl GridStore for TamperedGrid {
    fn describe(&self) -> String {
        format!("tampered {}", self.inner.describe())
    }

    async fn count(&self) -> Result<u64, GridError> {
        Ok(self.inner.count().await? + self.extra_count)
    }

    async fn next_id(
        &self,
        previous: Option<&BlobId>,
        order: Order,
    ) -> Result<Option<BlobId>, GridError> {
        self.inner.next_id(previous, order).await
    }

    async fn exists(&self, id: &BlobId) -> Result<bool, GridError> {
        self.inner.exists(id).await
    }

    async fn file_checksum(&self, id: &BlobId) -> Result<Option<String>, GridError> {
        let checksum = self.inner.file_checksum(id).await?;
        if self.bad_checksum {
            Ok(checksum.map(|_| "0".repeat(64)))
        } else {
            Ok(checksum)
        }
    }

    async fn metadata(&self, id: &BlobId) -> Result<Option<ObjectMetadata>, GridError> {
        self.inner.metadata(id).await
    }

    async fn open_download(&self, id: &BlobId) -> Result<ChunkStream, GridError> {
        let chunks = self.inner.open_download(id).await?;
        if !self.fail_download {
            return Ok(chunks);
        }
        let broken =
            stream::once(async { Err(GridError::Query("connection reset by peer".into())) });
        Ok(chunks.take(1).chain(broken).boxed())
    }

    async fn start_upload(&self, id: &BlobId) -> Result<Box<dyn GridUpload>, GridError> {
        let upload = self.inner.start_upload(id).await?;
        if self.stuck_discard {
            Ok(Box::new(StuckUpload(upload)))
        } else {
            Ok(upload)
        }
    }

    async fn delete(&self, id: &BlobId) -> Result<bool, GridError> {
        self.inner.delete(id).await
    }
}

/// An upload whose removal never happens, as with a locked database.
struct StuckUpload(Box<dyn GridUpload>);

#[async_trait]
impl GridUpload for StuckUpload {
    async fn write(&mut self, data: &[u8]) -> Result<(), GridError> {
        self.0.write(data).await
    }

    async fn finish(&mut self, metadata: &ObjectMetadata) -> Result<u64, GridError> {
        self.0.finish(metadata).await
    }

    async fn discard(self: Box<Self>) -> bool {
        false
    }
}
