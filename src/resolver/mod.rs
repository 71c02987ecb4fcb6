//! Store-neutral view of the two sides of a sync.
//!
//! Both resolvers implement [`BlobStore`], so the engine, the transfer
//! executor and the verifier never care which direction they are running.

pub mod fs;
pub mod grid;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

pub use fs::FsResolver;
pub use grid::GridResolver;

use crate::blob_id::BlobId;
use crate::error::SyncError;
use crate::grid::ObjectMetadata;
use crate::types::StoreKind;

/// Object bytes, streamed.
pub type ByteStream = BoxStream<'static, Result<Bytes, SyncError>>;

/// Identifiers, lazily produced in ascending order.
pub type IdStream<'a> = BoxStream<'a, Result<BlobId, SyncError>>;

#[async_trait]
pub trait BlobStore: Send + Sync {
    fn kind(&self) -> StoreKind;

    /// Human-readable location, for log lines.
    fn describe(&self) -> String;

    /// Number of entries [`BlobStore::ids`] would yield from the start.
    async fn count(&self) -> Result<u64, SyncError>;

    async fn exists(&self, id: &BlobId) -> Result<bool, SyncError>;

    /// Ascending identifiers, strictly greater than `start` when given.
    /// Restartable: calling again with the last yielded id resumes.
    fn ids(&self, start: Option<BlobId>) -> IdStream<'_>;

    /// Highest identifier present, or `None` for an empty store.
    async fn last_id(&self) -> Result<Option<BlobId>, SyncError>;

    /// Server-computed checksum of the committed object. Stores that cannot
    /// compute one return `None`.
    async fn authoritative_checksum(&self, id: &BlobId) -> Result<Option<String>, SyncError>;

    async fn open_read(&self, id: &BlobId) -> Result<ByteStream, SyncError>;

    /// Where an in-flight transfer of `id` keeps its unverified bytes.
    fn staging_location(&self, id: &BlobId) -> String;

    /// Start writing `id`, creating whatever structure its location needs.
    async fn create_writer(&self, id: &BlobId) -> Result<Box<dyn BlobWriter>, SyncError>;

    /// Remove an unverified artifact for `id` left behind by an interrupted
    /// transfer. Returns whether anything was removed.
    async fn discard_partial(&self, id: &BlobId) -> Result<bool, SyncError>;
}

/// One object being written into a store.
#[async_trait]
pub trait BlobWriter: Send {
    async fn write(&mut self, data: &[u8]) -> Result<(), SyncError>;

    /// Flush everything written so far. After this the store can compute
    /// its authoritative checksum, if it has one. Returns the byte count.
    async fn finish(&mut self, metadata: &ObjectMetadata) -> Result<u64, SyncError>;

    /// Publish the verified artifact under its final location.
    async fn commit(self: Box<Self>) -> Result<(), SyncError>;

    /// Remove the artifact. Never fails; problems are logged. Returns
    /// whether nothing unverified is left behind.
    async fn discard(self: Box<Self>) -> bool;
}
