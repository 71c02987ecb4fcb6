//! Checksum verification of a mirror against its source of truth.
//!
//! Reporting only: mismatches are logged as warnings and counted, never
//! raised and never repaired.

use std::time::{Duration, Instant};

use futures_util::{StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};

use crate::blob_id::BlobId;
use crate::error::SyncError;
use crate::resolver::BlobStore;
use crate::sync::format_duration;
use crate::sync::progress::{Action, LogProgress, Progress, ProgressReporter};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Objects whose checksums were compared.
    pub checked: u64,
    pub mismatched: u64,
    /// Mirror objects with no counterpart in the source of truth.
    pub missing: u64,
    pub elapsed: Duration,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.mismatched == 0
    }
}

pub struct Verifier {
    reporter: Box<dyn ProgressReporter>,
}

impl Default for Verifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Verifier {
    pub fn new() -> Self {
        Self {
            reporter: Box::new(LogProgress::new(None)),
        }
    }

    pub fn with_reporter(mut self, reporter: Box<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Recompute a checksum for every object in `mirror` and compare it with
    /// the authoritative one. Whichever store can compute checksums server
    /// side supplies the authoritative value; the bytes of the other side are
    /// hashed locally.
    pub async fn verify(
        &self,
        truth: &dyn BlobStore,
        mirror: &dyn BlobStore,
    ) -> Result<VerifyReport, SyncError> {
        let started = Instant::now();
        let total = mirror.count().await?;
        tracing::info!(
            "Verifying {} files in {} against {}...",
            total,
            mirror.describe(),
            truth.describe()
        );

        let mut report = VerifyReport::default();
        let mut ids = mirror.ids(None);
        while let Some(id) = ids.try_next().await? {
            if !truth.exists(&id).await? {
                tracing::debug!(id = %id, "No counterpart in {}, skipping", truth.describe());
                report.missing += 1;
                continue;
            }

            let (authoritative, hashed) = match truth.authoritative_checksum(&id).await? {
                Some(checksum) => (checksum, mirror),
                None => match mirror.authoritative_checksum(&id).await? {
                    Some(checksum) => (checksum, truth),
                    None => return Err(SyncError::MissingChecksum(id)),
                },
            };
            let local = local_checksum(hashed, &id).await?;

            report.checked += 1;
            if local != authoritative {
                tracing::warn!(
                    "Checksums do not match for {}: local={}, server={}",
                    id,
                    local,
                    authoritative
                );
                report.mismatched += 1;
            }

            self.reporter.report(&Progress {
                action: Action::Verified,
                count: report.checked,
                total: total as i64,
            });
        }
        self.reporter.finish();

        report.elapsed = started.elapsed();
        tracing::info!("Completed verification of {} files in this run", report.checked);
        if report.mismatched > 0 {
            tracing::warn!("  {} files failed verification", report.mismatched);
        }
        if report.missing > 0 {
            tracing::info!("  {} files had no counterpart", report.missing);
        }
        tracing::info!("  elapsed: {}", format_duration(report.elapsed));
        Ok(report)
    }
}

/// SHA-256 of an object's bytes as streamed from `store`, hex encoded.
pub async fn local_checksum(store: &dyn BlobStore, id: &BlobId) -> Result<String, SyncError> {
    let mut reader = store.open_read(id).await?;
    let mut hasher = Sha256::new();
    while let Some(chunk) = reader.next().await {
        hasher.update(&chunk?);
    }
    Ok(hex::encode(hasher.finalize()))
}
