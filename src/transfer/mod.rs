//! Single-object transfer with checksum verification.
//!
//! Bytes are streamed from the source into a staging artifact at the
//! destination while a SHA-256 is computed over exactly what was written.
//! The artifact is only published once that digest matches the
//! authoritative one; on any failure it is removed.

pub mod marker;

use chrono::Utc;
use futures_util::StreamExt;
use sha2::{Digest, Sha256, Sha512};

pub use marker::{OpenTransfer, TransferMarker};

use crate::blob_id::BlobId;
use crate::error::SyncError;
use crate::grid::ObjectMetadata;
use crate::resolver::{BlobStore, BlobWriter};

pub struct TransferExecutor {
    marker: TransferMarker,
    attach_content_hash: bool,
}

impl TransferExecutor {
    pub fn new(marker: TransferMarker) -> Self {
        Self {
            marker,
            attach_content_hash: false,
        }
    }

    /// Attach a SHA-512 of the content as object metadata. Only stores that
    /// keep metadata (the grid) record it.
    pub fn with_content_hash(mut self, attach: bool) -> Self {
        self.attach_content_hash = attach;
        self
    }

    #[cfg(test)]
    pub fn marker(&self) -> &TransferMarker {
        &self.marker
    }

    /// Copy `id` from `source` to `destination` and verify it.
    ///
    /// Returns the number of bytes written. On error nothing is left at the
    /// destination for `id`, or, when removing the unverified artifact
    /// failed, the marker stays in place so the next run removes it.
    pub async fn transfer(
        &self,
        id: &BlobId,
        source: &dyn BlobStore,
        destination: &dyn BlobStore,
    ) -> Result<u64, SyncError> {
        let open = OpenTransfer {
            id: *id,
            store: destination.kind(),
            location: destination.staging_location(id),
            started_at: Utc::now(),
        };
        self.marker.set(&open).await?;

        let (result, clean) = self.copy_verified(id, source, destination).await;

        if !clean {
            tracing::warn!(
                id = %id,
                "Unverified artifact may remain at {}; keeping the transfer marker for the next run",
                open.location
            );
            return result;
        }
        if let Err(e) = self.marker.clear().await {
            if result.is_ok() {
                return Err(e);
            }
            tracing::warn!(error = %e, "Failed to clear transfer marker");
        }
        result
    }

    /// The transfer result, and whether the destination is free of
    /// unverified bytes for `id`.
    async fn copy_verified(
        &self,
        id: &BlobId,
        source: &dyn BlobStore,
        destination: &dyn BlobStore,
    ) -> (Result<u64, SyncError>, bool) {
        // Nothing was written if the writer could not be created. A grid
        // object that already exists must not be discarded by a later cleanup.
        let mut writer = match destination.create_writer(id).await {
            Ok(writer) => writer,
            Err(e) => return (Err(e), true),
        };
        match self
            .stream_and_check(id, source, destination, writer.as_mut())
            .await
        {
            Ok(bytes) => match writer.commit().await {
                Ok(()) => (Ok(bytes), true),
                Err(e) => (Err(e), false),
            },
            Err(e) => {
                let removed = writer.discard().await;
                (Err(e), removed)
            }
        }
    }

    async fn stream_and_check(
        &self,
        id: &BlobId,
        source: &dyn BlobStore,
        destination: &dyn BlobStore,
        writer: &mut dyn BlobWriter,
    ) -> Result<u64, SyncError> {
        let mut reader = source.open_read(id).await?;

        // Incremental hashing so large objects are never buffered whole.
        let mut sha256 = Sha256::new();
        let mut sha512 = self.attach_content_hash.then(Sha512::new);
        while let Some(chunk) = reader.next().await {
            let chunk = chunk?;
            sha256.update(&chunk);
            if let Some(hasher) = sha512.as_mut() {
                hasher.update(&chunk);
            }
            writer.write(&chunk).await?;
        }

        let metadata = ObjectMetadata {
            hash: sha512.map(|hasher| hex::encode(hasher.finalize())),
        };
        let written = writer.finish(&metadata).await?;
        let local = hex::encode(sha256.finalize());

        let authoritative = match source.authoritative_checksum(id).await? {
            Some(checksum) => checksum,
            None => destination
                .authoritative_checksum(id)
                .await?
                .ok_or(SyncError::MissingChecksum(*id))?,
        };
        tracing::debug!(id = %id, server = %authoritative, local = %local, "Transferred {}", id);

        if local != authoritative {
            return Err(SyncError::IntegrityMismatch {
                id: *id,
                local,
                authoritative,
            });
        }
        Ok(written)
    }

    /// Remove the artifact of a transfer a previous run never finished.
    ///
    /// `stores` are the stores this run touches; the one matching the
    /// marker's store kind discards the partial. Returns whether an artifact
    /// was removed.
    pub async fn cleanup_prior_partial(
        &self,
        stores: &[&dyn BlobStore],
    ) -> Result<bool, SyncError> {
        let Some(open) = self.marker.load().await? else {
            return Ok(false);
        };

        let Some(store) = stores.iter().find(|store| store.kind() == open.store) else {
            tracing::warn!(
                id = %open.id,
                store = %open.store,
                "Transfer marker refers to a store this run does not use; leaving it"
            );
            return Ok(false);
        };

        let removed = store.discard_partial(&open.id).await?;
        if removed {
            tracing::info!(id = %open.id, "Deleted possible partial at {}", open.location);
        } else {
            tracing::debug!(id = %open.id, "Transfer marker found but no partial artifact remained");
        }

        self.marker.clear().await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::grid::testing::{aged_id, memory_grid, put, TamperedGrid};
    use crate::grid::GridStore;
    use crate::resolver::{FsResolver, GridResolver};
    use crate::types::StoreKind;

    struct Fixture {
        dir: tempfile::TempDir,
        grid: Arc<dyn GridStore>,
        fs: FsResolver,
        executor: TransferExecutor,
    }

    impl Fixture {
        fn new(grid: Arc<dyn GridStore>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let fs = FsResolver::new(dir.path());
            let executor = TransferExecutor::new(TransferMarker::in_directory(dir.path()));
            Self {
                dir,
                grid,
                fs,
                executor,
            }
        }

        fn resolver(&self) -> GridResolver {
            GridResolver::new(Arc::clone(&self.grid))
        }
    }

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    #[tokio::test]
    async fn test_dump_writes_verified_file() {
        let store = memory_grid();
        let id = aged_id(600);
        let payload = vec![7u8; 100];
        put(&store, &id, &payload).await;
        let fx = Fixture::new(Arc::new(store));
        let grid = fx.resolver();

        let written = fx.executor.transfer(&id, &grid, &fx.fs).await.unwrap();

        assert_eq!(written, 100);
        assert_eq!(std::fs::read(fx.fs.path_for(&id)).unwrap(), payload);
        assert!(!fx.fs.part_path_for(&id).exists());
        assert_eq!(fx.executor.marker().load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dump_checksum_mismatch_leaves_nothing() {
        let store = memory_grid();
        let id = aged_id(600);
        put(&store, &id, b"genuine bytes").await;
        let mut tampered = TamperedGrid::new(store);
        tampered.bad_checksum = true;
        let fx = Fixture::new(Arc::new(tampered));
        let grid = fx.resolver();

        let err = fx.executor.transfer(&id, &grid, &fx.fs).await.unwrap_err();

        match err {
            SyncError::IntegrityMismatch {
                id: failed,
                local,
                authoritative,
            } => {
                assert_eq!(failed, id);
                assert_eq!(local, sha256_hex(b"genuine bytes"));
                assert_eq!(authoritative, "0".repeat(64));
            }
            other => panic!("expected IntegrityMismatch, got {other:?}"),
        }
        assert!(!fx.fs.path_for(&id).exists());
        assert!(!fx.fs.part_path_for(&id).exists());
        assert_eq!(fx.executor.marker().load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_restore_attaches_content_hash() {
        let fx = Fixture::new(Arc::new(memory_grid()));
        let executor = TransferExecutor::new(TransferMarker::in_directory(fx.dir.path()))
            .with_content_hash(true);
        let grid = fx.resolver();
        let id = aged_id(600);
        let payload = b"restore me, please".repeat(5);
        std::fs::create_dir_all(fx.fs.directory_for(&id)).unwrap();
        std::fs::write(fx.fs.path_for(&id), &payload).unwrap();

        let written = executor.transfer(&id, &fx.fs, &grid).await.unwrap();

        assert_eq!(written, payload.len() as u64);
        assert_eq!(
            fx.grid.file_checksum(&id).await.unwrap(),
            Some(sha256_hex(&payload))
        );
        let metadata = fx.grid.metadata(&id).await.unwrap().unwrap();
        assert_eq!(metadata.hash, Some(hex::encode(Sha512::digest(&payload))));
    }

    #[tokio::test]
    async fn test_restore_without_content_hash() {
        let fx = Fixture::new(Arc::new(memory_grid()));
        let grid = fx.resolver();
        let id = aged_id(600);
        std::fs::create_dir_all(fx.fs.directory_for(&id)).unwrap();
        std::fs::write(fx.fs.path_for(&id), b"plain").unwrap();

        fx.executor.transfer(&id, &fx.fs, &grid).await.unwrap();

        let metadata = fx.grid.metadata(&id).await.unwrap().unwrap();
        assert!(metadata.is_empty());
    }

    #[tokio::test]
    async fn test_restore_mismatch_deletes_grid_object() {
        let mut tampered = TamperedGrid::new(memory_grid());
        tampered.bad_checksum = true;
        let fx = Fixture::new(Arc::new(tampered));
        let grid = fx.resolver();
        let id = aged_id(600);
        std::fs::create_dir_all(fx.fs.directory_for(&id)).unwrap();
        std::fs::write(fx.fs.path_for(&id), b"local copy").unwrap();

        let err = fx.executor.transfer(&id, &fx.fs, &grid).await.unwrap_err();

        assert!(err.is_integrity_failure());
        assert!(!fx.grid.exists(&id).await.unwrap());
        // The source file is never touched.
        assert!(fx.fs.path_for(&id).exists());
    }

    #[tokio::test]
    async fn test_failed_discard_keeps_marker_for_next_run() {
        let mut tampered = TamperedGrid::new(memory_grid());
        tampered.bad_checksum = true;
        tampered.stuck_discard = true;
        let fx = Fixture::new(Arc::new(tampered));
        let grid = fx.resolver();
        let id = aged_id(600);
        std::fs::create_dir_all(fx.fs.directory_for(&id)).unwrap();
        std::fs::write(fx.fs.path_for(&id), b"local copy").unwrap();

        let err = fx.executor.transfer(&id, &fx.fs, &grid).await.unwrap_err();

        assert!(err.is_integrity_failure());
        // The unverified object survived, so the marker must too.
        assert!(fx.grid.exists(&id).await.unwrap());
        let open = fx.executor.marker().load().await.unwrap().unwrap();
        assert_eq!(open.id, id);
        assert_eq!(open.store, StoreKind::Grid);

        assert!(fx
            .executor
            .cleanup_prior_partial(&[&fx.fs, &grid])
            .await
            .unwrap());
        assert!(!fx.grid.exists(&id).await.unwrap());
        assert_eq!(fx.executor.marker().load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_existing_object_is_not_marked_for_cleanup() {
        let store = memory_grid();
        let id = aged_id(600);
        put(&store, &id, b"already restored").await;
        let fx = Fixture::new(Arc::new(store));
        let grid = fx.resolver();
        std::fs::create_dir_all(fx.fs.directory_for(&id)).unwrap();
        std::fs::write(fx.fs.path_for(&id), b"already restored").unwrap();

        assert!(fx.executor.transfer(&id, &fx.fs, &grid).await.is_err());

        assert_eq!(fx.executor.marker().load().await.unwrap(), None);
        assert!(fx.grid.exists(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_source_cleans_up() {
        let fx = Fixture::new(Arc::new(memory_grid()));
        let grid = fx.resolver();
        let id = aged_id(600);

        let err = fx.executor.transfer(&id, &fx.fs, &grid).await.unwrap_err();

        assert!(matches!(err, SyncError::Io(_)));
        assert!(!fx.grid.exists(&id).await.unwrap());
        assert_eq!(fx.executor.marker().load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_no_checksum_on_either_side() {
        let fx = Fixture::new(Arc::new(memory_grid()));
        let id = aged_id(600);
        std::fs::create_dir_all(fx.fs.directory_for(&id)).unwrap();
        std::fs::write(fx.fs.path_for(&id), b"x").unwrap();
        let other_dir = tempfile::tempdir().unwrap();
        let other = FsResolver::new(other_dir.path());

        let err = fx.executor.transfer(&id, &fx.fs, &other).await.unwrap_err();

        assert!(matches!(err, SyncError::MissingChecksum(failed) if failed == id));
        assert!(!other.path_for(&id).exists());
        assert!(!other.part_path_for(&id).exists());
    }

    #[tokio::test]
    async fn test_cleanup_removes_partial_file() {
        let fx = Fixture::new(Arc::new(memory_grid()));
        let grid = fx.resolver();
        let id = aged_id(600);
        std::fs::create_dir_all(fx.fs.directory_for(&id)).unwrap();
        std::fs::write(fx.fs.part_path_for(&id), b"half written").unwrap();
        fx.executor
            .marker()
            .set(&OpenTransfer {
                id,
                store: StoreKind::Filesystem,
                location: fx.fs.staging_location(&id),
                started_at: Utc::now(),
            })
            .await
            .unwrap();

        let removed = fx
            .executor
            .cleanup_prior_partial(&[&grid, &fx.fs])
            .await
            .unwrap();

        assert!(removed);
        assert!(!fx.fs.part_path_for(&id).exists());
        assert_eq!(fx.executor.marker().load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cleanup_removes_partial_grid_object() {
        let store = memory_grid();
        let id = aged_id(600);
        put(&store, &id, b"unverified").await;
        let fx = Fixture::new(Arc::new(store));
        let grid = fx.resolver();
        fx.executor
            .marker()
            .set(&OpenTransfer {
                id,
                store: StoreKind::Grid,
                location: grid.staging_location(&id),
                started_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(fx
            .executor
            .cleanup_prior_partial(&[&fx.fs, &grid])
            .await
            .unwrap());
        assert!(!fx.grid.exists(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_without_marker() {
        let fx = Fixture::new(Arc::new(memory_grid()));
        let grid = fx.resolver();
        assert!(!fx
            .executor
            .cleanup_prior_partial(&[&grid, &fx.fs])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_with_marker_but_no_artifact() {
        let fx = Fixture::new(Arc::new(memory_grid()));
        let grid = fx.resolver();
        let id = aged_id(600);
        fx.executor
            .marker()
            .set(&OpenTransfer {
                id,
                store: StoreKind::Filesystem,
                location: fx.fs.staging_location(&id),
                started_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(!fx
            .executor
            .cleanup_prior_partial(&[&grid, &fx.fs])
            .await
            .unwrap());
        assert_eq!(fx.executor.marker().load().await.unwrap(), None);
    }
}
