use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::cli::{CommonArgs, RestoreArgs, TransferArgs, VerifyArgs};
use crate::grid::GridLocation;
use crate::sync::Direction;
use crate::transfer::marker::DEFAULT_FILE_NAME;
use crate::types::StoreKind;

/// Validated settings for a dump or restore run.
#[derive(Debug, Clone)]
pub struct Config {
    pub grid: GridLocation,
    pub directory: PathBuf,
    pub marker_file: PathBuf,
    pub prefix: String,
    pub recency_window: Duration,
    pub status_every: Option<NonZeroU64>,
    pub direction: Direction,
    pub fast_count: bool,
    pub progress_bar: bool,
    pub attach_content_hash: bool,
}

/// Validated settings for a verify run.
#[derive(Debug, Clone)]
pub struct VerifyConfig {
    pub grid: GridLocation,
    pub directory: PathBuf,
    pub prefix: String,
    pub recency_window: Duration,
    pub status_every: Option<NonZeroU64>,
    pub mirror: StoreKind,
    pub fast_count: bool,
    pub progress_bar: bool,
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

fn parse_grid(location: &str) -> anyhow::Result<GridLocation> {
    let parsed = GridLocation::parse(location)?;
    Ok(parsed.map_path(|path| expand_tilde(&path.to_string_lossy())))
}

fn status_every(value: Option<u64>) -> anyhow::Result<Option<NonZeroU64>> {
    value
        .map(|n| NonZeroU64::new(n).context("--status-every must be at least 1"))
        .transpose()
}

fn check_prefix(prefix: &str) -> anyhow::Result<()> {
    crate::grid::schema::validate_prefix(prefix)?;
    Ok(())
}

fn require_directory(path: &Path) -> anyhow::Result<()> {
    if !path.is_dir() {
        anyhow::bail!("Directory {} does not exist", path.display());
    }
    Ok(())
}

impl Config {
    pub fn from_dump(args: TransferArgs) -> anyhow::Result<Self> {
        let grid = parse_grid(&args.source).context("Invalid --source for dump")?;
        let directory = expand_tilde(&args.destination);
        Self::build(Direction::Dump, grid, directory, args.marker_file, args.common, false)
    }

    pub fn from_restore(args: RestoreArgs) -> anyhow::Result<Self> {
        let RestoreArgs {
            transfer,
            no_metadata_hash,
        } = args;
        let directory = expand_tilde(&transfer.source);
        require_directory(&directory)?;
        let grid = parse_grid(&transfer.destination).context("Invalid --destination for restore")?;
        Self::build(
            Direction::Restore,
            grid,
            directory,
            transfer.marker_file,
            transfer.common,
            !no_metadata_hash,
        )
    }

    fn build(
        direction: Direction,
        grid: GridLocation,
        directory: PathBuf,
        marker_file: Option<String>,
        common: CommonArgs,
        attach_content_hash: bool,
    ) -> anyhow::Result<Self> {
        check_prefix(&common.prefix)?;
        let marker_file = marker_file
            .map(|m| expand_tilde(&m))
            .unwrap_or_else(|| directory.join(DEFAULT_FILE_NAME));

        Ok(Self {
            grid,
            directory,
            marker_file,
            prefix: common.prefix,
            recency_window: Duration::from_secs(common.recency_window),
            status_every: status_every(common.status_every)?,
            direction,
            fast_count: common.fast_count,
            progress_bar: common.progress_bar,
            attach_content_hash,
        })
    }
}

impl VerifyConfig {
    pub fn from_args(args: VerifyArgs) -> anyhow::Result<Self> {
        let grid = parse_grid(&args.grid).context("Invalid --grid")?;
        let directory = expand_tilde(&args.directory);
        require_directory(&directory)?;
        check_prefix(&args.common.prefix)?;

        Ok(Self {
            grid,
            directory,
            prefix: args.common.prefix,
            recency_window: Duration::from_secs(args.common.recency_window),
            status_every: status_every(args.common.status_every)?,
            mirror: args.mirror,
            fast_count: args.common.fast_count,
            progress_bar: args.common.progress_bar,
        })
    }
}
