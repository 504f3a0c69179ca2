use std::num::NonZeroU32;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use segdl::DownloadConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download one or more URLs, resuming any that were interrupted
    Get(GetArgs),

    /// List resumable downloads in a directory
    List {
        /// Directory to scan for checkpoints
        #[arg(short = 'd', long = "download-dir", default_value = "downloads")]
        download_dir: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct GetArgs {
    /// URLs to download, one after another
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Directory to save downloaded files
    #[arg(short = 'd', long = "download-dir", default_value = "downloads")]
    pub download_dir: PathBuf,

    /// File name to save as (single URL only; inferred from the URL otherwise)
    #[arg(short = 'o', long)]
    pub output: Option<String>,

    /// Number of ranges fetched in parallel (segmented download)
    #[arg(short = 's', long, default_value_t = 8, value_parser = clap::value_parser!(u16).range(1..))]
    pub split: u16,

    /// Rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long)]
    pub rate_limit: Option<NonZeroU32>,

    /// Known total size in bytes; skips the HEAD probe
    #[arg(long)]
    pub size: Option<u64>,

    /// Consecutive failures tolerated per range
    #[arg(long, default_value_t = 5)]
    pub retries: u32,

    /// Expected SHA-256 of the finished file (single URL only)
    #[arg(long = "sha256")]
    pub sha256: Option<String>,

    /// Ignore existing checkpoints and download from scratch
    #[arg(long)]
    pub restart: bool,
}

impl GetArgs {
    pub fn config(&self) -> DownloadConfig {
        DownloadConfig {
            workers: usize::from(self.split),
            max_retries: self.retries,
            rate_limit: self.rate_limit,
            ..DownloadConfig::default()
        }
    }
}
