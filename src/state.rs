//! Resume checkpoint stored next to the destination file.
//!
//! The sidecar holds the ordered list of ranges with their current cursors,
//! encoded as JSON. It records progress only; the URL and destination are
//! supplied again by whoever resumes the download.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tokio::fs;

use crate::error::{DownloadError, Result};
use crate::range::Range;

/// Extension appended to the destination path to form the sidecar path.
pub const SIDECAR_EXTENSION: &str = "dl";

/// Returns the sidecar path for a destination, e.g. `movie.mkv` -> `movie.mkv.dl`.
pub fn sidecar_path(destination: &Path) -> PathBuf {
    append_extension(destination, SIDECAR_EXTENSION)
}

fn append_extension(path: &Path, extension: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

/// Handle to a sidecar checkpoint file.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    path: PathBuf,
}

impl Checkpoint {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn for_destination(destination: &Path) -> Self {
        Self::new(sidecar_path(destination))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Overwrite the sidecar with the given ranges.
    ///
    /// The snapshot is written to a temporary file and renamed into place,
    /// so a reader sees either the previous snapshot or this one.
    pub async fn save(&self, ranges: &[Range]) -> Result<()> {
        let content = serde_json::to_vec(ranges).map_err(std::io::Error::other)?;
        let tmp = append_extension(&self.path, "tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Read the ranges back. A missing or unusable sidecar is an error.
    pub async fn load(&self) -> Result<Vec<Range>> {
        let content = match fs::read(&self.path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(DownloadError::CheckpointMissing {
                    path: self.path.clone(),
                });
            }
            Err(err) => return Err(err.into()),
        };

        let ranges: Vec<Range> =
            serde_json::from_slice(&content).map_err(|e| self.corrupt(e.to_string()))?;
        self.validate(&ranges)?;
        Ok(ranges)
    }

    /// Delete the sidecar. A sidecar that is already gone is not an error.
    pub async fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn validate(&self, ranges: &[Range]) -> Result<()> {
        if ranges.is_empty() {
            return Err(self.corrupt("no ranges".to_string()));
        }
        if ranges.len() > 1 && ranges.iter().any(|r| !r.is_bounded()) {
            return Err(self.corrupt("unbounded range in a multi-range plan".to_string()));
        }
        for (index, range) in ranges.iter().enumerate() {
            if let Some(end) = range.end {
                let Some(limit) = end.checked_add(1) else {
                    return Err(self.corrupt(format!("range {index} ends past the largest offset")));
                };
                if range.begin > limit {
                    return Err(self.corrupt(format!(
                        "range {index} cursor {} is past its end {end}",
                        range.begin
                    )));
                }
            }
        }
        // Cursors never move back, so what is left of each range must sit
        // after the end of the one before it.
        for (index, pair) in ranges.windows(2).enumerate() {
            let (prev, next) = (pair[0].end, pair[1].end);
            if let (Some(prev), Some(next)) = (prev, next) {
                if pair[1].begin <= prev || next <= prev {
                    return Err(self.corrupt(format!(
                        "range {} overlaps range {index}",
                        index + 1
                    )));
                }
            }
        }
        Ok(())
    }

    fn corrupt(&self, reason: String) -> DownloadError {
        DownloadError::CheckpointCorrupt {
            path: self.path.clone(),
            reason,
        }
    }
}

/// Size implied by a bounded plan: the last range ends on the last byte.
pub fn total_size(ranges: &[Range]) -> Option<u64> {
    ranges.last().and_then(|r| r.end).and_then(|end| end.checked_add(1))
}

/// Bytes already written according to a checkpoint.
pub fn bytes_completed(ranges: &[Range]) -> u64 {
    match total_size(ranges) {
        Some(size) => {
            let remaining: u64 = ranges.iter().filter_map(Range::remaining).sum();
            size.saturating_sub(remaining)
        }
        None => ranges.first().map_or(0, |r| r.begin),
    }
}
