use clap::{Args, Parser, Subcommand};

use crate::types::{LogLevel, StoreKind};

#[derive(Parser, Debug)]
#[command(
    name = "gridmirror",
    version,
    about = "Mirror a grid blob store into a sharded directory tree and back"
)]
pub struct Cli {
    /// Log level (RUST_LOG takes precedence when set)
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Copy grid objects into a sharded directory tree
    Dump(TransferArgs),

    /// Copy objects from a sharded directory tree into the grid
    Restore(RestoreArgs),

    /// Compare mirrored objects against authoritative checksums
    Verify(VerifyArgs),
}

/// Options shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Object-group prefix (grid tables are <prefix>_files and <prefix>_chunks)
    #[arg(long, default_value = "fs")]
    pub prefix: String,

    /// Log progress every N files
    #[arg(long)]
    pub status_every: Option<u64>,

    /// Seconds a grid object must age before it is considered fully written
    #[arg(long, default_value_t = 60)]
    pub recency_window: u64,

    /// Count mirror files with find(1) when available
    #[arg(long)]
    pub fast_count: bool,

    /// Show a progress bar instead of progress log lines (TTY only)
    #[arg(long)]
    pub progress_bar: bool,
}

#[derive(Args, Debug, Clone)]
pub struct TransferArgs {
    /// Where objects are read from: a grid connection string
    /// (sqlite://<path>) for dump, a directory for restore
    #[arg(short = 's', long, env = "GRIDMIRROR_SOURCE")]
    pub source: String,

    /// Where objects are written to: a directory for dump, a grid
    /// connection string for restore
    #[arg(short = 'd', long, env = "GRIDMIRROR_DESTINATION")]
    pub destination: String,

    /// File recording the transfer in flight
    /// [default: <directory>/.gridmirror-transfer.json]
    #[arg(long)]
    pub marker_file: Option<String>,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug, Clone)]
pub struct RestoreArgs {
    #[command(flatten)]
    pub transfer: TransferArgs,

    /// Do not attach a SHA-512 of the content as object metadata
    #[arg(long)]
    pub no_metadata_hash: bool,
}

#[derive(Args, Debug, Clone)]
pub struct VerifyArgs {
    /// Grid connection string (sqlite://<path>)
    #[arg(long, env = "GRIDMIRROR_GRID")]
    pub grid: String,

    /// Root of the sharded directory tree
    #[arg(long)]
    pub directory: String,

    /// Which side is the copy being checked
    #[arg(long, value_enum, default_value = "filesystem")]
    pub mirror: StoreKind,

    #[command(flatten)]
    pub common: CommonArgs,
}
