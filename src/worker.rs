//! Fetches one byte range and writes it at its final offset.

use std::io::{self, SeekFrom};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::TryStreamExt;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::{header, Client, StatusCode};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DownloadConfig;
use crate::error::{DownloadError, Result};
use crate::range::Range;
use crate::state::Checkpoint;

pub(crate) type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Builds the shared limiter for a task. The burst is at least one buffer so
/// a single chunk can always be admitted.
pub(crate) fn build_limiter(config: &DownloadConfig) -> Option<Arc<Limiter>> {
    config.rate_limit.map(|limit| {
        let buffer = u32::try_from(config.buffer_size).unwrap_or(u32::MAX);
        let burst = NonZeroU32::new(limit.get().max(buffer)).unwrap_or(limit);
        Arc::new(RateLimiter::direct(Quota::per_second(limit).allow_burst(burst)))
    })
}

/// How a worker stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerExit {
    /// The range was written through its last byte (or body EOF if unbounded).
    Completed,
    /// The generation was cancelled; the range stopped at a checkpointed cursor.
    Paused,
}

/// Resources shared by all workers of one task.
pub(crate) struct WorkerContext {
    pub client: Client,
    pub url: String,
    pub file: Arc<Mutex<File>>,
    pub ranges: Arc<Mutex<Vec<Range>>>,
    pub checkpoint: Checkpoint,
    pub downloaded: Arc<AtomicU64>,
    pub limiter: Option<Arc<Limiter>>,
    pub config: DownloadConfig,
}

/// Drives a single range to completion or to a pause boundary.
pub(crate) struct RangeWorker {
    index: usize,
    ctx: Arc<WorkerContext>,
    token: CancellationToken,
}

impl RangeWorker {
    pub fn new(index: usize, ctx: Arc<WorkerContext>, token: CancellationToken) -> Self {
        Self { index, ctx, token }
    }

    /// Fetch the range, retrying transient failures with backoff.
    ///
    /// The failure counter only counts consecutive attempts that made no
    /// progress.
    pub async fn run(self) -> Result<WorkerExit> {
        let mut failures = 0u32;
        loop {
            if self.token.is_cancelled() {
                return Ok(WorkerExit::Paused);
            }

            let before = self.snapshot().await.begin;
            let err = match self.fetch().await {
                Ok(exit) => return Ok(exit),
                Err(err) => err,
            };

            if self.snapshot().await.begin > before {
                failures = 0;
            }
            failures += 1;

            if !err.is_transient() || failures > self.ctx.config.max_retries {
                return Err(DownloadError::RangeFailed {
                    index: self.index,
                    attempts: failures,
                    source: Box::new(err),
                });
            }

            let delay = self.ctx.config.backoff_for(failures);
            warn!(
                range = self.index,
                attempt = failures,
                error = %err,
                ?delay,
                "range fetch failed, retrying"
            );
            tokio::select! {
                _ = self.token.cancelled() => return Ok(WorkerExit::Paused),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn snapshot(&self) -> Range {
        self.ctx.ranges.lock().await[self.index]
    }

    /// One GET for whatever is left of the range.
    async fn fetch(&self) -> Result<WorkerExit> {
        let mut cursor = self.snapshot().await;
        if cursor.is_complete() {
            return Ok(WorkerExit::Completed);
        }

        let range_header = cursor.header_value();
        let mut request = self.ctx.client.get(&self.ctx.url);
        if let Some(value) = &range_header {
            request = request.header(header::RANGE, value.as_str());
        }
        debug!(range = self.index, header = ?range_header, "requesting range");

        let response = tokio::select! {
            _ = self.token.cancelled() => return Ok(WorkerExit::Paused),
            response = request.send() => response?,
        };
        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE && !cursor.is_bounded() && cursor.begin > 0 {
            // Written through EOF before the last pause; only the EOF itself was missed.
            if unsatisfied_length(response.headers()).map_or(true, |len| len == cursor.begin) {
                debug!(range = self.index, at = cursor.begin, "nothing left past cursor");
                return Ok(WorkerExit::Completed);
            }
        }
        if !status.is_success() {
            return Err(DownloadError::HttpStatus { status });
        }

        // A full body in answer to a ranged request starts at byte 0.
        let mut skip = 0u64;
        if range_header.is_some() && status != StatusCode::PARTIAL_CONTENT {
            warn!(
                range = self.index,
                %status,
                skip = cursor.begin,
                "server ignored Range header, skipping to range start"
            );
            skip = cursor.begin;
        }

        let stream = response.bytes_stream().map_err(io::Error::other);
        let mut body = StreamReader::new(Box::pin(stream));
        let mut buf = vec![0u8; self.ctx.config.buffer_size.max(1)];

        loop {
            if self.token.is_cancelled() {
                return Ok(WorkerExit::Paused);
            }

            let n = tokio::select! {
                _ = self.token.cancelled() => return Ok(WorkerExit::Paused),
                n = self.read_chunk(&mut body, &mut buf) => n?,
            };
            if n == 0 {
                return match cursor.remaining() {
                    None | Some(0) => Ok(WorkerExit::Completed),
                    Some(missing) => Err(DownloadError::UnexpectedEof {
                        index: self.index,
                        missing,
                    }),
                };
            }

            let mut chunk = &buf[..n];
            if skip > 0 {
                let skipped = skip.min(n as u64) as usize;
                skip -= skipped as u64;
                chunk = &chunk[skipped..];
                if chunk.is_empty() {
                    continue;
                }
            }

            let chunk = clamp(chunk, cursor.remaining());
            self.write_chunk(cursor.begin, chunk).await?;
            cursor.begin += chunk.len() as u64;

            if cursor.is_complete() {
                return Ok(WorkerExit::Completed);
            }
        }
    }

    async fn read_chunk<R>(&self, body: &mut R, buf: &mut [u8]) -> Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        let timeout = self.ctx.config.read_timeout;
        match tokio::time::timeout(timeout, body.read(buf)).await {
            Ok(read) => Ok(read?),
            Err(_) => Err(DownloadError::ReadTimeout {
                timeout_secs: timeout.as_secs(),
            }),
        }
    }

    /// Write at `offset`, advance the cursor, count the bytes, checkpoint.
    async fn write_chunk(&self, offset: u64, chunk: &[u8]) -> Result<()> {
        if let Some(limiter) = &self.ctx.limiter {
            if let Some(n) = NonZeroU32::new(u32::try_from(chunk.len()).unwrap_or(u32::MAX)) {
                limiter
                    .until_n_ready(n)
                    .await
                    .map_err(|e| DownloadError::RateLimit(e.to_string()))?;
            }
        }

        {
            let mut file = self.ctx.file.lock().await;
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(chunk).await?;
            file.flush().await?;
        }

        let len = chunk.len() as u64;
        let mut ranges = self.ctx.ranges.lock().await;
        ranges[self.index].begin = offset + len;
        self.ctx.downloaded.fetch_add(len, Ordering::Relaxed);
        self.ctx.checkpoint.save(&ranges).await
    }
}

/// Resource length from a `Content-Range: bytes */N` reply header.
fn unsatisfied_length(headers: &header::HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_RANGE)?
        .to_str()
        .ok()?
        .strip_prefix("bytes */")?
        .trim()
        .parse()
        .ok()
}

/// Trim a chunk so it never runs past the end of the range.
pub(crate) fn clamp(chunk: &[u8], remaining: Option<u64>) -> &[u8] {
    match remaining {
        Some(remaining) if (chunk.len() as u64) > remaining => &chunk[..remaining as usize],
        _ => chunk,
    }
}
