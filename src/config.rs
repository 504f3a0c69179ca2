//! Tunables for a download task.

use std::num::NonZeroU32;
use std::time::Duration;

/// Default number of ranges fetched in parallel.
pub const DEFAULT_WORKERS: usize = 4;

/// Default size of the per-worker read buffer (8 KiB).
///
/// Each filled buffer is one write and one checkpoint save, so larger
/// buffers trade memory for fewer syscalls.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Settings shared by every worker of a task.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Number of ranges to split a known-size resource into.
    pub workers: usize,
    /// Bytes read from the body per chunk.
    pub buffer_size: usize,
    /// How often the speed sampler measures throughput.
    pub sample_interval: Duration,
    /// Consecutive failures tolerated per range before the task fails.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on every further failure.
    pub retry_backoff: Duration,
    /// Upper bound for the retry delay.
    pub max_retry_backoff: Duration,
    pub connect_timeout: Duration,
    /// Maximum time a single body read may stall.
    pub read_timeout: Duration,
    pub user_agent: String,
    /// Optional download rate limit in bytes per second, shared by all workers.
    pub rate_limit: Option<NonZeroU32>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            sample_interval: Duration::from_secs(1),
            max_retries: 5,
            retry_backoff: Duration::from_millis(500),
            max_retry_backoff: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            user_agent: concat!("segdl/", env!("CARGO_PKG_VERSION")).to_string(),
            rate_limit: None,
        }
    }
}

impl DownloadConfig {
    /// Delay before retry number `attempt` (starting at 1).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_backoff
            .saturating_mul(factor)
            .min(self.max_retry_backoff)
    }

    pub(crate) fn build_client(&self) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .user_agent(self.user_agent.as_str())
            .connect_timeout(self.connect_timeout)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DownloadConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.buffer_size, 8192);
        assert_eq!(config.sample_interval, Duration::from_secs(1));
        assert!(config.user_agent.starts_with("segdl/"));
        assert!(config.rate_limit.is_none());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = DownloadConfig {
            retry_backoff: Duration::from_millis(100),
            max_retry_backoff: Duration::from_millis(1000),
            ..DownloadConfig::default()
        };

        assert_eq!(config.backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for(4), Duration::from_millis(800));
        assert_eq!(config.backoff_for(5), Duration::from_millis(1000));
        assert_eq!(config.backoff_for(60), Duration::from_millis(1000));
    }
}
