//! Resolver over the grid store.
//!
//! Applies the recency filter: identifiers created within the recency
//! window may belong to objects still being written and are left out of
//! counting, iteration and [`BlobStore::last_id`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt, TryStreamExt};

use super::{BlobStore, BlobWriter, ByteStream, IdStream};
use crate::blob_id::BlobId;
use crate::error::SyncError;
use crate::grid::{GridStore, GridUpload, ObjectMetadata, Order};
use crate::types::StoreKind;

pub const DEFAULT_RECENCY_WINDOW: Duration = Duration::from_secs(60);

pub struct GridResolver {
    store: Arc<dyn GridStore>,
    recency_window: Duration,
    clock: fn() -> DateTime<Utc>,
}

impl GridResolver {
    pub fn new(store: Arc<dyn GridStore>) -> Self {
        Self {
            store,
            recency_window: DEFAULT_RECENCY_WINDOW,
            clock: Utc::now,
        }
    }

    pub fn with_recency_window(mut self, window: Duration) -> Self {
        self.recency_window = window;
        self
    }

    #[cfg(test)]
    fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    /// Number of objects. Unless `include_recent`, recent identifiers are
    /// discounted by walking down from the highest one until a settled
    /// identifier turns up; in the common case only the tail is recent, so
    /// this stays a handful of queries.
    pub async fn count_dumpable(&self, include_recent: bool) -> Result<u64, SyncError> {
        let total = self.store.count().await?;
        if include_recent {
            return Ok(total);
        }

        let now = (self.clock)();
        let mut discounted = 0u64;
        let mut cursor = None;
        while let Some(id) = self.store.next_id(cursor.as_ref(), Order::Descending).await? {
            if !id.is_recent(now, self.recency_window) {
                break;
            }
            discounted += 1;
            cursor = Some(id);
        }

        if discounted > 0 {
            tracing::debug!(discounted, "Excluded recent grid objects from count");
        }
        Ok(total.saturating_sub(discounted))
    }

    /// The identifier after (or before, when descending) `previous`, or the
    /// first (last) one overall. A recent candidate ends the sequence.
    pub async fn next_id(
        &self,
        previous: Option<&BlobId>,
        ascending: bool,
    ) -> Result<Option<BlobId>, SyncError> {
        let order = if ascending {
            Order::Ascending
        } else {
            Order::Descending
        };
        let candidate = self.store.next_id(previous, order).await?;
        Ok(candidate.filter(|id| !id.is_recent((self.clock)(), self.recency_window)))
    }

    /// Lazily walk identifiers from `start` by repeated [`Self::next_id`].
    pub fn each_id(&self, start: Option<BlobId>, ascending: bool) -> IdStream<'_> {
        stream::try_unfold(start, move |cursor| async move {
            let next = self.next_id(cursor.as_ref(), ascending).await?;
            Ok(next.map(|id| (id, Some(id))))
        })
        .boxed()
    }
}

#[async_trait]
impl BlobStore for GridResolver {
    fn kind(&self) -> StoreKind {
        StoreKind::Grid
    }

    fn describe(&self) -> String {
        self.store.describe()
    }

    async fn count(&self) -> Result<u64, SyncError> {
        self.count_dumpable(false).await
    }

    async fn exists(&self, id: &BlobId) -> Result<bool, SyncError> {
        Ok(self.store.exists(id).await?)
    }

    fn ids(&self, start: Option<BlobId>) -> IdStream<'_> {
        self.each_id(start, true)
    }

    async fn last_id(&self) -> Result<Option<BlobId>, SyncError> {
        let now = (self.clock)();
        let mut cursor = None;
        while let Some(id) = self.store.next_id(cursor.as_ref(), Order::Descending).await? {
            if !id.is_recent(now, self.recency_window) {
                return Ok(Some(id));
            }
            cursor = Some(id);
        }
        Ok(None)
    }

    async fn authoritative_checksum(&self, id: &BlobId) -> Result<Option<String>, SyncError> {
        Ok(self.store.file_checksum(id).await?)
    }

    async fn open_read(&self, id: &BlobId) -> Result<ByteStream, SyncError> {
        let chunks = self.store.open_download(id).await?;
        Ok(chunks.map_err(SyncError::from).boxed())
    }

    fn staging_location(&self, id: &BlobId) -> String {
        format!("{} object {id}", self.store.describe())
    }

    async fn create_writer(&self, id: &BlobId) -> Result<Box<dyn BlobWriter>, SyncError> {
        let upload = self.store.start_upload(id).await?;
        Ok(Box::new(GridWriter { upload }))
    }

    async fn discard_partial(&self, id: &BlobId) -> Result<bool, SyncError> {
        Ok(self.store.delete(id).await?)
    }
}

/// Grid objects become visible when their upload finishes, so there is
/// nothing left to publish on commit.
struct GridWriter {
    upload: Box<dyn GridUpload>,
}

#[async_trait]
impl BlobWriter for GridWriter {
    async fn write(&mut self, data: &[u8]) -> Result<(), SyncError> {
        Ok(self.upload.write(data).await?)
    }

    async fn finish(&mut self, metadata: &ObjectMetadata) -> Result<u64, SyncError> {
        Ok(self.upload.finish(metadata).await?)
    }

    async fn commit(self: Box<Self>) -> Result<(), SyncError> {
        Ok(())
    }

    async fn discard(self: Box<Self>) -> bool {
        self.upload.discard().await
    }
}
