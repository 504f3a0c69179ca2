//! Periodic throughput measurement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Converts a byte delta observed over `interval` into bytes per second.
pub fn bytes_per_second(delta: u64, interval: Duration) -> u64 {
    let millis = interval.as_millis().max(1);
    (u128::from(delta) * 1000 / millis).min(u128::from(u64::MAX)) as u64
}

/// Samples the cumulative byte counter and publishes the current speed.
///
/// One sampler runs per generation of workers; it exits when the
/// generation's token is cancelled and leaves the speed at zero.
pub struct SpeedSampler {
    downloaded: Arc<AtomicU64>,
    speed: Arc<AtomicU64>,
    interval: Duration,
}

impl SpeedSampler {
    pub fn new(downloaded: Arc<AtomicU64>, speed: Arc<AtomicU64>, interval: Duration) -> Self {
        Self {
            downloaded,
            speed,
            interval,
        }
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }

    async fn run(self, token: CancellationToken) {
        loop {
            let before = self.downloaded.load(Ordering::Relaxed);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            let now = self.downloaded.load(Ordering::Relaxed);
            self.speed.store(
                bytes_per_second(now.saturating_sub(before), self.interval),
                Ordering::Relaxed,
            );
        }
        self.speed.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_per_second() {
        assert_eq!(bytes_per_second(1000, Duration::from_secs(1)), 1000);
        assert_eq!(bytes_per_second(1000, Duration::from_millis(250)), 4000);
        assert_eq!(bytes_per_second(0, Duration::from_millis(100)), 0);
        // A zero interval must not divide by zero.
        assert_eq!(bytes_per_second(5, Duration::ZERO), 5000);
    }

    #[tokio::test]
    async fn test_sampler_measures_progress() {
        let downloaded = Arc::new(AtomicU64::new(0));
        let speed = Arc::new(AtomicU64::new(0));
        let token = CancellationToken::new();
        let handle = SpeedSampler::new(
            downloaded.clone(),
            speed.clone(),
            Duration::from_millis(20),
        )
        .spawn(token.clone());

        let mut observed = 0;
        for _ in 0..100 {
            downloaded.fetch_add(512, Ordering::Relaxed);
            tokio::time::sleep(Duration::from_millis(5)).await;
            observed = observed.max(speed.load(Ordering::Relaxed));
        }
        assert!(observed > 0);

        token.cancel();
        handle.await.unwrap();
        assert_eq!(speed.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_sampler_zero_after_cancel() {
        let downloaded = Arc::new(AtomicU64::new(10_000));
        let speed = Arc::new(AtomicU64::new(12_345));
        let token = CancellationToken::new();
        let handle =
            SpeedSampler::new(downloaded, speed.clone(), Duration::from_secs(3600)).spawn(token.clone());

        token.cancel();
        handle.await.unwrap();
        assert_eq!(speed.load(Ordering::Relaxed), 0);
    }
}
