//! gridmirror: mirror a chunked grid blob store into a sharded directory
//! tree and back.
//!
//! Objects are copied one at a time in id order, verified against the
//! store's own checksum before they become visible, and a small marker file
//! records the single transfer in flight so an interrupted run can clean up
//! after itself. A second, bounded pass picks up objects that appeared
//! behind the resume point while the first pass was running.

#![warn(clippy::all)]

mod blob_id;
mod cli;
mod config;
mod error;
mod grid;
mod resolver;
mod sync;
mod transfer;
mod types;
mod verify;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Command;
use config::{Config, VerifyConfig};
use resolver::{BlobStore, FsResolver, GridResolver};
use sync::{Direction, SyncEngine};
use transfer::{TransferExecutor, TransferMarker};
use types::StoreKind;

async fn open_grid(
    location: &grid::GridLocation,
    prefix: &str,
) -> anyhow::Result<Arc<dyn grid::GridStore>> {
    let store = grid::connect(location, prefix)
        .await
        .with_context(|| format!("Failed to open grid store {location}"))?;
    tracing::debug!(store = ?store, "Grid store opened");
    Ok(Arc::new(store))
}

/// Run a dump or restore to completion.
async fn run_sync(config: Config) -> anyhow::Result<()> {
    let store = open_grid(&config.grid, &config.prefix).await?;
    let grid: Box<dyn BlobStore> =
        Box::new(GridResolver::new(store).with_recency_window(config.recency_window));
    let fs: Box<dyn BlobStore> =
        Box::new(FsResolver::new(&config.directory).with_fast_count(config.fast_count));

    let (source, destination) = match config.direction {
        Direction::Dump => (grid, fs),
        Direction::Restore => (fs, grid),
    };
    tracing::info!(
        direction = config.direction.as_str(),
        marker = %config.marker_file.display(),
        "Starting gridmirror: {} -> {}",
        source.describe(),
        destination.describe()
    );

    let executor = TransferExecutor::new(TransferMarker::new(&config.marker_file))
        .with_content_hash(config.attach_content_hash);
    let mut engine = SyncEngine::new(config.direction, source, destination, executor)
        .with_reporter(sync::progress::reporter_for(
            config.progress_bar,
            config.status_every,
        ));

    match engine.run().await {
        Ok(report) => {
            if !report.is_exactly_synced() {
                tracing::warn!(
                    "Stores still differ by {} objects; rerun to pick them up",
                    report.residual_gap
                );
            }
            Ok(())
        }
        Err(e) => {
            if e.is_integrity_failure() {
                tracing::error!(
                    phase = ?engine.phase(),
                    "Aborted on an unverifiable object; nothing unverified was kept. \
                     Run `gridmirror verify` to check what was already mirrored."
                );
            }
            Err(e).with_context(|| format!("{} failed", config.direction.as_str()))
        }
    }
}

/// Check every mirrored object against its authoritative checksum.
/// Mismatches are reported, not treated as failure.
async fn run_verify(config: VerifyConfig) -> anyhow::Result<()> {
    let store = open_grid(&config.grid, &config.prefix).await?;
    let grid = GridResolver::new(store).with_recency_window(config.recency_window);
    let fs = FsResolver::new(&config.directory).with_fast_count(config.fast_count);

    let verifier = verify::Verifier::new().with_reporter(sync::progress::reporter_for(
        config.progress_bar,
        config.status_every,
    ));
    let report = match config.mirror {
        StoreKind::Filesystem => verifier.verify(&grid, &fs).await?,
        StoreKind::Grid => verifier.verify(&fs, &grid).await?,
    };

    if !report.is_clean() {
        tracing::warn!(
            "{} of {} {} objects did not verify",
            report.mismatched,
            report.checked,
            config.mirror
        );
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_str())),
        )
        .init();

    match cli.command {
        Command::Dump(args) => run_sync(Config::from_dump(args)?).await,
        Command::Restore(args) => run_sync(Config::from_restore(args)?).await,
        Command::Verify(args) => run_verify(VerifyConfig::from_args(args)?).await,
    }
}
