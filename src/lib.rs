//! segdl - segmented, resumable HTTP downloads.
//!
//! A [`DownloadTask`] splits a resource into byte ranges, fetches them in
//! parallel, writes each range at its final offset, and keeps a sidecar
//! checkpoint so a paused or interrupted download can be resumed.
//!
//! ```no_run
//! use segdl::{DownloadConfig, DownloadTask, TaskState};
//!
//! # async fn example() -> segdl::Result<()> {
//! let task = DownloadTask::new(
//!     "https://example.com/big.iso",
//!     "downloads/big.iso",
//!     DownloadConfig::default(),
//! );
//! task.start().await?;
//! assert_eq!(task.wait().await, TaskState::Finished);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod hashing;
pub mod range;
pub mod registry;
pub mod speed;
pub mod state;
pub mod task;
pub mod utils;
mod worker;

#[cfg(test)]
mod test_support;

pub use config::DownloadConfig;
pub use error::{DownloadError, ErrorKind, Result};
pub use range::{plan_ranges, Range};
pub use registry::{TaskId, TaskRegistry};
pub use state::{sidecar_path, Checkpoint};
pub use task::{DownloadTask, NoListener, TaskListener, TaskState, TaskStatus};
