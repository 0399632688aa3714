use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::export::ExportFormat;

/// Command-line options for mailkeep.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Config file (defaults to config.toml in the data directory).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Archive root holding index.db and blobs/.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Mailbox folder to operate on.
    #[arg(long, global = true)]
    pub folder: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download messages not yet in the archive.
    Sync {
        /// Maximum parallel fetch workers.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Skip read-back checksum verification of stored blobs.
        #[arg(long)]
        no_verify: bool,

        /// Only consider the latest N messages of the folder.
        #[arg(long)]
        limit: Option<usize>,

        /// Turn off pre-download screening (size, sender and subject rules).
        #[arg(long)]
        no_screening: bool,

        /// Give up on the pass after this many seconds (it is safe to re-run).
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Write the archive as a table.
    Export {
        /// Output file (defaults to export.<format> in the data directory).
        #[arg(long, short)]
        output: Option<PathBuf>,

        #[arg(long, value_parser = parse_format)]
        format: Option<ExportFormat>,

        /// Comma-separated field list, e.g. "date,sender,subject,size".
        #[arg(long)]
        fields: Option<String>,
    },
    /// Show record counts, sizes and messages with links per folder.
    Stats,
    /// Check that every archived message is present and intact.
    Verify,
}

fn parse_format(raw: &str) -> Result<ExportFormat, String> {
    raw.parse().map_err(|e: crate::errors::ArchiveError| e.to_string())
}
