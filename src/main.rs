mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stderr keeps the log away from the progress bars' redraws on stdout
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// Output dir might not exist yet, so resolve it against the current dir
fn absolute(dir: PathBuf) -> PathBuf {
    if dir.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            return cwd.join(dir);
        }
    }
    dir
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match cli.command {
            Command::Get(mut args) => {
                args.download_dir = absolute(args.download_dir);
                crate::commands::run_downloads(args).await
            }
            Command::List { download_dir } => {
                crate::commands::list_downloads(absolute(download_dir)).await
            }
        }
    })
}
