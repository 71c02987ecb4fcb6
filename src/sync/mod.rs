//! The dump/restore engine.
//!
//! A run resumes after the destination's highest identifier and walks the
//! source forward, transferring whatever the destination lacks. It then
//! compares counts; objects created out of order relative to the resume
//! point (or lost from the destination) show up as a positive difference,
//! which a bounded pass from the very first identifier closes.
//!
//! Counts on both sides are observational and racy, so a difference that
//! cannot be closed is reported as a warning rather than an error.

pub mod progress;

use std::time::{Duration, Instant};

use futures_util::TryStreamExt;

use crate::blob_id::BlobId;
use crate::error::SyncError;
use crate::resolver::BlobStore;
use crate::transfer::TransferExecutor;
use progress::{Action, LogProgress, Progress, ProgressReporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Grid to filesystem.
    Dump,
    /// Filesystem to grid.
    Restore,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Dump => "dump",
            Direction::Restore => "restore",
        }
    }

    fn action(&self) -> Action {
        match self {
            Direction::Dump => Action::Dumped,
            Direction::Restore => Action::Restored,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    ForwardPass,
    ReconcilePass,
    Done,
}

/// Counts and totals of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pre_source_count: u64,
    pub pre_destination_count: u64,
    /// Measured after the forward pass.
    pub post_source_count: u64,
    pub post_destination_count: u64,
    /// All transfers, including those of the reconciliation pass.
    pub transferred: u64,
    pub transferred_bytes: u64,
    /// Transfers made by the reconciliation pass.
    pub reconciled: u64,
    /// Count difference the reconciliation pass could not close.
    pub residual_gap: u64,
    pub elapsed: Duration,
}

impl SyncReport {
    pub fn is_exactly_synced(&self) -> bool {
        self.residual_gap == 0
    }

    fn log_summary(&self, direction: Direction) {
        let verb = direction.as_str();
        tracing::info!("── Summary ──");
        tracing::info!(
            "  {} {} files totalling {} in this run",
            direction.action(),
            self.transferred,
            format_size(self.transferred_bytes)
        );
        if self.reconciled > 0 {
            tracing::info!("  {} of them found by the reconciliation pass", self.reconciled);
        }
        tracing::info!("  Post-{} total source files: {}", verb, self.post_source_count);
        tracing::info!(
            "  Post-{} total destination files: {}",
            verb,
            self.post_destination_count
        );
        tracing::info!("  elapsed: {}", format_duration(self.elapsed));
    }
}

#[derive(Default)]
struct Tally {
    count: u64,
    bytes: u64,
}

pub struct SyncEngine {
    direction: Direction,
    source: Box<dyn BlobStore>,
    destination: Box<dyn BlobStore>,
    executor: TransferExecutor,
    reporter: Box<dyn ProgressReporter>,
    phase: SyncPhase,
}

impl SyncEngine {
    pub fn new(
        direction: Direction,
        source: Box<dyn BlobStore>,
        destination: Box<dyn BlobStore>,
        executor: TransferExecutor,
    ) -> Self {
        Self {
            direction,
            source,
            destination,
            executor,
            reporter: Box::new(LogProgress::new(None)),
            phase: SyncPhase::Idle,
        }
    }

    pub fn with_reporter(mut self, reporter: Box<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    fn enter(&mut self, phase: SyncPhase) {
        tracing::debug!(from = ?self.phase, to = ?phase, "Sync phase");
        self.phase = phase;
    }

    /// Run one complete dump or restore.
    ///
    /// Fails on store errors and on the first object whose checksum does not
    /// verify. An unresolved count difference only produces a warning and a
    /// non-zero [`SyncReport::residual_gap`].
    pub async fn run(&mut self) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        let verb = self.direction.as_str();
        self.enter(SyncPhase::Idle);

        self.executor
            .cleanup_prior_partial(&[self.source.as_ref(), self.destination.as_ref()])
            .await?;

        tracing::info!(
            "Counting files in {} and {}...",
            self.source.describe(),
            self.destination.describe()
        );
        let mut report = SyncReport {
            pre_source_count: self.source.count().await?,
            pre_destination_count: self.destination.count().await?,
            ..SyncReport::default()
        };
        tracing::info!("Pre-{} total source files: {}", verb, report.pre_source_count);
        tracing::info!(
            "Pre-{} total destination files: {}",
            verb,
            report.pre_destination_count
        );

        let mut tally = Tally::default();
        let resume_after = self.destination.last_id().await?;
        match &resume_after {
            Some(id) => tracing::debug!("Last transferred id: {}", id),
            None => tracing::debug!("Last transferred id: (none)"),
        }

        self.enter(SyncPhase::ForwardPass);
        let estimate = report.pre_source_count as i64 - report.pre_destination_count as i64;
        self.forward_pass(resume_after, estimate, &mut tally).await?;

        tracing::info!("Completed initial file {}. Checking file counts...", verb);
        report.post_source_count = self.source.count().await?;
        report.post_destination_count = self.destination.count().await?;
        let difference =
            report.post_source_count as i64 - report.post_destination_count as i64;

        if difference > 0 {
            self.enter(SyncPhase::ReconcilePass);
            tracing::info!(
                "Attempting to find {} missing files in {}...",
                difference,
                self.destination.describe()
            );
            let before = tally.count;
            let residual = self.reconcile_pass(difference, &mut tally).await?;
            report.reconciled = tally.count - before;

            if residual > 0 {
                tracing::warn!(
                    "Unable to resolve discrepancy between {} and {}: {}",
                    self.source.describe(),
                    self.destination.describe(),
                    residual
                );
                report.residual_gap = residual as u64;
            }
        }

        self.enter(SyncPhase::Done);
        self.reporter.finish();

        report.transferred = tally.count;
        report.transferred_bytes = tally.bytes;
        report.elapsed = started.elapsed();
        report.log_summary(self.direction);
        Ok(report)
    }

    async fn forward_pass(
        &self,
        resume_after: Option<BlobId>,
        estimate: i64,
        tally: &mut Tally,
    ) -> Result<(), SyncError> {
        let mut ids = self.source.ids(resume_after);
        while let Some(id) = ids.try_next().await? {
            if self.destination.exists(&id).await? {
                continue;
            }
            self.transfer_one(&id, estimate, tally).await?;
        }
        Ok(())
    }

    /// Walk the source from its first identifier, transferring what the
    /// destination lacks, until `difference` objects have been found or the
    /// source runs out. Returns the difference left over.
    async fn reconcile_pass(&self, mut difference: i64, tally: &mut Tally) -> Result<i64, SyncError> {
        let estimate = difference;
        let mut ids = self.source.ids(None);
        while difference > 0 {
            let Some(id) = ids.try_next().await? else {
                break;
            };
            if self.destination.exists(&id).await? {
                continue;
            }
            self.transfer_one(&id, estimate, tally).await?;
            difference -= 1;
        }
        Ok(difference)
    }

    async fn transfer_one(
        &self,
        id: &BlobId,
        estimate: i64,
        tally: &mut Tally,
    ) -> Result<(), SyncError> {
        let bytes = self
            .executor
            .transfer(id, self.source.as_ref(), self.destination.as_ref())
            .await?;
        tally.count += 1;
        tally.bytes += bytes;
        self.reporter.report(&Progress {
            action: self.direction.action(),
            count: tally.count,
            total: estimate,
        });
        Ok(())
    }
}

const STORAGE_UNITS: [&str; 5] = ["bytes", "KiB", "MiB", "GiB", "TiB"];

/// Human-readable binary size: `512 bytes`, `1.50 KiB`, `3.25 GiB`.
pub(crate) fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{} bytes", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < STORAGE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, STORAGE_UNITS[unit])
}

pub(crate) fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
