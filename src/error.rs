//! Error types for the segmented downloader.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::task::TaskState;

/// A specialized `Result` type for download operations.
pub type Result<T> = std::result::Result<T, DownloadError>;

/// Errors that can occur while planning, fetching, or resuming a download.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// HTTP transport error.
    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("server returned status {status}")]
    HttpStatus { status: reqwest::StatusCode },

    /// I/O error while writing the destination or the checkpoint.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The storage directory could not be created.
    #[error("failed to create directory {path:?}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    /// The destination file could not be created or opened.
    #[error("failed to open {path:?}: {source}")]
    OpenFile { path: PathBuf, source: io::Error },

    /// The initial size probe failed.
    #[error("failed to probe {url}: {reason}")]
    Probe { url: String, reason: String },

    /// No bytes arrived within the configured read timeout.
    #[error("no data received for {timeout_secs}s")]
    ReadTimeout { timeout_secs: u64 },

    /// The body ended before the range was complete.
    #[error("range {index} ended early with {missing} bytes missing")]
    UnexpectedEof { index: usize, missing: u64 },

    /// A range kept failing after all retries.
    #[error("range {index} failed after {attempts} attempts: {source}")]
    RangeFailed {
        index: usize,
        attempts: u32,
        #[source]
        source: Box<DownloadError>,
    },

    /// Resume was requested but there is no sidecar.
    #[error("no checkpoint found at {path:?}")]
    CheckpointMissing { path: PathBuf },

    /// The sidecar exists but cannot be used.
    #[error("checkpoint {path:?} is corrupt: {reason}")]
    CheckpointCorrupt { path: PathBuf, reason: String },

    /// Resume was requested but the partially written file is gone.
    #[error("destination {path:?} is missing, cannot resume")]
    DestinationMissing { path: PathBuf },

    /// The planner was asked for zero ranges.
    #[error("worker count must be at least 1")]
    InvalidWorkerCount,

    /// A command was issued in a state that does not allow it.
    #[error("cannot {operation} a task that is {state}")]
    InvalidState {
        operation: &'static str,
        state: TaskState,
    },

    #[error("rate limiter rejected request: {0}")]
    RateLimit(String),

    /// The finished file does not hash to the expected digest.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

/// Coarse classification reported to [`TaskListener::on_error`](crate::TaskListener::on_error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Probe, directory, or file creation failed before any worker ran.
    Setup,
    /// A range failed permanently.
    Range,
    /// The checkpoint could not be used to resume.
    Resume,
    /// A command was issued in the wrong state.
    State,
    /// The downloaded data failed verification.
    Integrity,
}

impl ErrorKind {
    /// Stable numeric code for embedding applications.
    pub const fn code(self) -> u16 {
        match self {
            Self::Setup => 1,
            Self::Range => 2,
            Self::Resume => 3,
            Self::State => 4,
            Self::Integrity => 5,
        }
    }
}

impl DownloadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RangeFailed { .. }
            | Self::UnexpectedEof { .. }
            | Self::ReadTimeout { .. }
            | Self::RateLimit(_) => ErrorKind::Range,
            Self::CheckpointMissing { .. }
            | Self::CheckpointCorrupt { .. }
            | Self::DestinationMissing { .. } => ErrorKind::Resume,
            Self::InvalidState { .. } => ErrorKind::State,
            Self::ChecksumMismatch { .. } => ErrorKind::Integrity,
            Self::Http(_)
            | Self::HttpStatus { .. }
            | Self::Io(_)
            | Self::CreateDir { .. }
            | Self::OpenFile { .. }
            | Self::Probe { .. }
            | Self::InvalidWorkerCount => ErrorKind::Setup,
        }
    }

    /// Whether a range worker should retry after this error.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(err) => match err.status() {
                Some(status) => is_retryable_status(status),
                None => true,
            },
            Self::HttpStatus { status } => is_retryable_status(*status),
            Self::Io(_) | Self::ReadTimeout { .. } | Self::UnexpectedEof { .. } => true,
            _ => false,
        }
    }
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}
