use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

use segdl::hashing::verify_sha256;
use segdl::state::{self, Checkpoint, SIDECAR_EXTENSION};
use segdl::utils::{filename_from_url, sanitize_filename};
use segdl::{DownloadTask, TaskRegistry, TaskState};

use crate::cli::GetArgs;

const REFRESH_INTERVAL: Duration = Duration::from_millis(200);

pub async fn run_downloads(args: GetArgs) -> Result<()> {
    if args.urls.len() > 1 && (args.output.is_some() || args.sha256.is_some()) {
        bail!("--output and --sha256 can only be used with a single URL");
    }

    if !args.download_dir.exists() {
        fs::create_dir_all(&args.download_dir)
            .await
            .context("Failed to create output directory")?;
    }

    let config = args.config();
    let registry = Arc::new(TaskRegistry::new());
    let interrupted = Arc::new(AtomicBool::new(false));

    // Ctrl-C pauses whatever is running; the checkpoint lets the next run resume.
    {
        let registry = registry.clone();
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupted.store(true, Ordering::SeqCst);
                let paused = registry.pause_running().await;
                info!(paused, "interrupted, progress saved");
            }
        });
    }

    let mut failed = 0;
    for url in &args.urls {
        if interrupted.load(Ordering::SeqCst) {
            break;
        }

        let filename = match &args.output {
            Some(name) => name.clone(),
            None => sanitize_filename(&filename_from_url(url).context("Invalid URL")?),
        };
        let destination = args.download_dir.join(filename);

        let mut task = DownloadTask::new(url.as_str(), destination, config.clone());
        if let Some(size) = args.size {
            task = task.with_size(size);
        }
        let task = Arc::new(task);
        let id = registry.insert(task.clone());

        let result = download_one(&task, args.restart, args.sha256.as_deref()).await;
        registry.remove(&id);

        if let Err(e) = result {
            eprintln!("Failed to download {}: {:#}", url, e);
            failed += 1;
        }
    }

    if failed > 0 {
        bail!("{} of {} downloads failed", failed, args.urls.len());
    }
    Ok(())
}

async fn download_one(task: &DownloadTask, restart: bool, sha256: Option<&str>) -> Result<()> {
    let name = task
        .destination()
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    if !restart && task.checkpoint().exists().await {
        info!(file = %name, "resuming from checkpoint");
        task.resume().await.context("Failed to resume")?;
    } else {
        task.start().await.context("Failed to start")?;
    }

    let pb = progress_bar(task.status().size)?;
    pb.set_message(format!("Downloading {}", name));
    while task.state() == TaskState::Running {
        let status = task.status();
        if let Some(size) = status.size {
            pb.set_length(size);
        }
        pb.set_position(status.downloaded);
        pb.set_message(format!("{}/s {}", HumanBytes(status.speed), name));
        tokio::select! {
            _ = task.wait() => {}
            _ = tokio::time::sleep(REFRESH_INTERVAL) => {}
        }
    }
    pb.set_position(task.status().downloaded);

    match task.state() {
        TaskState::Finished => {
            if let Some(expected) = sha256 {
                pb.set_message(format!("Verifying {}", name));
                verify_sha256(task.destination(), expected).await?;
                pb.finish_with_message(format!("Verified    {}", name));
            } else {
                pb.finish_with_message(format!("Completed   {}", name));
            }
            Ok(())
        }
        TaskState::Paused => {
            pb.abandon_with_message(format!("Paused      {} (run again to resume)", name));
            Ok(())
        }
        state => {
            pb.abandon_with_message(format!("Failed      {}", name));
            bail!("download ended {}", state)
        }
    }
}

fn progress_bar(size: Option<u64>) -> Result<ProgressBar> {
    let pb = match size {
        Some(size) => {
            let pb = ProgressBar::new(size);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {msg}")?
                    .progress_chars("=>-"),
            );
            pb
        }
        None => {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} [{elapsed_precise}] {bytes:>12} {msg}")?,
            );
            pb
        }
    };
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

/// One resumable download found in a directory.
struct PendingDownload {
    filename: String,
    downloaded: u64,
    total: Option<u64>,
    modified: Option<DateTime<Local>>,
    corrupt: bool,
}

async fn scan_checkpoints(dir: &Path) -> Result<Vec<PendingDownload>> {
    let mut found = Vec::new();
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read {:?}", dir))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().map_or(true, |ext| ext != SIDECAR_EXTENSION) {
            continue;
        }
        let filename = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let modified = entry
            .metadata()
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Local>::from);

        match Checkpoint::new(path.clone()).load().await {
            Ok(ranges) => found.push(PendingDownload {
                filename,
                downloaded: state::bytes_completed(&ranges),
                total: state::total_size(&ranges),
                modified,
                corrupt: false,
            }),
            Err(e) => {
                warn!(path = ?path, error = %e, "unreadable checkpoint");
                found.push(PendingDownload {
                    filename,
                    downloaded: 0,
                    total: None,
                    modified,
                    corrupt: true,
                });
            }
        }
    }

    found.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(found)
}

pub async fn list_downloads(download_dir: PathBuf) -> Result<()> {
    if !download_dir.exists() {
        println!("Output directory '{:?}' does not exist.", download_dir);
        println!("Tip: If you used a custom output directory, please specify it with --download-dir");
        return Ok(());
    }

    let pending = scan_checkpoints(&download_dir).await?;
    if pending.is_empty() {
        println!("No resumable downloads found in '{:?}'.", download_dir);
        return Ok(());
    }

    println!("{:<50} {:<12} {:<15} {:<17}", "Filename", "Progress", "Size", "Last write");
    println!("{:-<50} {:-<12} {:-<15} {:-<17}", "", "", "", "");

    for item in pending {
        let progress = match (item.corrupt, item.total) {
            (true, _) => "corrupt".to_string(),
            (false, Some(total)) if total > 0 => {
                format!("{:.2}%", item.downloaded as f64 / total as f64 * 100.0)
            }
            (false, _) => format!("{}", HumanBytes(item.downloaded)),
        };
        let size = item
            .total
            .map(|t| format!("{}", HumanBytes(t)))
            .unwrap_or_else(|| "unknown".to_string());
        let modified = item
            .modified
            .map(|m| m.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();

        println!("{:<50} {:<12} {:<15} {:<17}", item.filename, progress, size, modified);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use segdl::Range;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_scan_checkpoints() {
        let dir = TempDir::new().unwrap();
        Checkpoint::for_destination(&dir.path().join("b.iso"))
            .save(&[Range::new(50, 99), Range::new(150, 199)])
            .await
            .unwrap();
        Checkpoint::for_destination(&dir.path().join("a.bin"))
            .save(&[Range {
                begin: 10,
                end: None,
            }])
            .await
            .unwrap();
        fs::write(dir.path().join("c.zip.dl"), b"oops").await.unwrap();
        fs::write(dir.path().join("done.txt"), b"finished").await.unwrap();

        let found = scan_checkpoints(dir.path()).await.unwrap();
        let names: Vec<_> = found.iter().map(|p| p.filename.as_str()).collect();
        assert_eq!(names, vec!["a.bin", "b.iso", "c.zip"]);

        assert_eq!(found[0].downloaded, 10);
        assert_eq!(found[0].total, None);
        assert_eq!(found[1].downloaded, 100);
        assert_eq!(found[1].total, Some(200));
        assert!(found[2].corrupt);
    }
}
