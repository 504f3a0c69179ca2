//! Download task lifecycle: start, pause, resume, finish, fail.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DownloadConfig;
use crate::error::{DownloadError, ErrorKind, Result};
use crate::range::{plan_ranges, Range};
use crate::speed::SpeedSampler;
use crate::state::{self, Checkpoint};
use crate::worker::{build_limiter, RangeWorker, WorkerContext, WorkerExit};

/// Where a task is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Paused,
    Finished,
    Failed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Finished => "finished",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Snapshot returned by [`DownloadTask::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStatus {
    pub state: TaskState,
    /// Bytes written to the destination so far.
    pub downloaded: u64,
    /// Bytes per second over the last sampling interval.
    pub speed: u64,
    /// Total size, if known.
    pub size: Option<u64>,
}

/// Receives lifecycle events of a task.
///
/// Callbacks run on the task's own control path and never overlap for the
/// same task, so they should return quickly. The matching state is
/// published once the callback returns, so [`DownloadTask::wait`] never
/// observes an event before its listener has run. All methods default to
/// no-ops.
pub trait TaskListener: Send + Sync {
    fn on_start(&self) {}
    fn on_pause(&self) {}
    fn on_resume(&self) {}
    fn on_finish(&self) {}
    fn on_error(&self, _kind: ErrorKind, _message: &str) {}
}

/// A listener that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoListener;

impl TaskListener for NoListener {}

/// Resources of the current download, kept across pause and resume.
struct Active {
    ctx: Arc<WorkerContext>,
    range_count: usize,
}

struct Control {
    active: Option<Active>,
    token: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

struct Inner {
    url: String,
    destination: PathBuf,
    config: DownloadConfig,
    known_size: Option<u64>,
    listener: Arc<dyn TaskListener>,
    checkpoint: Checkpoint,
    size: std::sync::Mutex<Option<u64>>,
    downloaded: Arc<AtomicU64>,
    speed: Arc<AtomicU64>,
    state: watch::Sender<TaskState>,
    control: Mutex<Control>,
}

/// A single segmented download of `url` into `destination`.
///
/// The checkpoint lives next to the destination (see
/// [`sidecar_path`](crate::state::sidecar_path)) until the download finishes.
pub struct DownloadTask {
    inner: Arc<Inner>,
}

impl fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadTask")
            .field("url", &self.inner.url)
            .field("destination", &self.inner.destination)
            .field("status", &self.status())
            .finish()
    }
}

impl DownloadTask {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>, config: DownloadConfig) -> Self {
        let destination = destination.into();
        let (state, _) = watch::channel(TaskState::Created);
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                checkpoint: Checkpoint::for_destination(&destination),
                destination,
                config,
                known_size: None,
                listener: Arc::new(NoListener),
                size: std::sync::Mutex::new(None),
                downloaded: Arc::new(AtomicU64::new(0)),
                speed: Arc::new(AtomicU64::new(0)),
                state,
                control: Mutex::new(Control {
                    active: None,
                    token: CancellationToken::new(),
                    driver: None,
                }),
            }),
        }
    }

    /// Use a known total size instead of probing the server.
    ///
    /// Like [`with_listener`](Self::with_listener), this only takes effect
    /// before the task is started.
    pub fn with_size(mut self, size: u64) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.known_size = Some(size);
        }
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn TaskListener>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.listener = listener;
        }
        self
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn destination(&self) -> &Path {
        &self.inner.destination
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.inner.checkpoint
    }

    pub fn state(&self) -> TaskState {
        *self.inner.state.borrow()
    }

    /// Current progress. Never blocks on the workers.
    pub fn status(&self) -> TaskStatus {
        TaskStatus {
            state: self.state(),
            downloaded: self.inner.downloaded.load(Ordering::Relaxed),
            speed: self.inner.speed.load(Ordering::Relaxed),
            size: self.inner.size(),
        }
    }

    /// Start a fresh download, overwriting any existing destination.
    ///
    /// Setup failures are reported through `on_error`, leave the task
    /// `Failed`, and are returned.
    pub async fn start(&self) -> Result<()> {
        let mut control = self.inner.control.lock().await;
        self.inner.expect_state("start", &[TaskState::Created])?;

        let active = match self.inner.prepare_fresh().await {
            Ok(active) => active,
            Err(err) => {
                self.inner.fail(&err);
                return Err(err);
            }
        };
        control.active = Some(active);

        info!(url = %self.inner.url, destination = ?self.inner.destination, "download started");
        Inner::launch(&self.inner, &mut control, Event::Start);
        Ok(())
    }

    /// Stop all workers at their next chunk boundary.
    ///
    /// Returns once every worker has exited and the checkpoint reflects the
    /// final cursors. If the workers completed before noticing the pause the
    /// task finishes instead and `on_pause` does not fire.
    pub async fn pause(&self) -> Result<()> {
        let mut control = self.inner.control.lock().await;
        self.inner.expect_state("pause", &[TaskState::Running])?;

        control.token.cancel();
        if let Some(driver) = control.driver.take() {
            if let Err(err) = driver.await {
                warn!(error = %err, "download driver ended abnormally");
            }
        }

        if self.state() == TaskState::Running {
            info!(
                downloaded = self.inner.downloaded.load(Ordering::Relaxed),
                "download paused"
            );
            self.inner.listener.on_pause();
            self.inner.state.send_replace(TaskState::Paused);
        }
        Ok(())
    }

    /// Continue a paused task, or pick up a download left on disk.
    ///
    /// A task that has no ranges in memory loads them from the checkpoint;
    /// a missing or corrupt checkpoint is reported and the state is kept.
    pub async fn resume(&self) -> Result<()> {
        let mut control = self.inner.control.lock().await;
        self.inner
            .expect_state("resume", &[TaskState::Paused, TaskState::Created])?;

        if control.active.is_none() {
            match self.inner.prepare_resume().await {
                Ok(active) => control.active = Some(active),
                Err(err) => {
                    error!(error = %err, "cannot resume download");
                    self.inner.listener.on_error(err.kind(), &err.to_string());
                    return Err(err);
                }
            }
        }

        info!(
            downloaded = self.inner.downloaded.load(Ordering::Relaxed),
            "download resumed"
        );
        Inner::launch(&self.inner, &mut control, Event::Resume);
        Ok(())
    }

    /// Wait until the task is no longer running and return its state.
    pub async fn wait(&self) -> TaskState {
        let mut rx = self.inner.state.subscribe();
        let result = rx.wait_for(|state| *state != TaskState::Running).await;
        match result {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }
}

/// Dropping a running task stops its workers at their next chunk boundary.
/// The checkpoint stays valid for a later [`resume`](DownloadTask::resume),
/// but no `on_pause` fires and the state is left as it was.
impl Drop for DownloadTask {
    fn drop(&mut self) {
        if let Ok(control) = self.inner.control.try_lock() {
            if *self.inner.state.borrow() == TaskState::Running {
                debug!(url = %self.inner.url, "task dropped while running, stopping workers");
            }
            control.token.cancel();
        }
    }
}

enum Event {
    Start,
    Resume,
}

impl Inner {
    fn size(&self) -> Option<u64> {
        *self.size.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_size(&self, size: Option<u64>) {
        *self.size.lock().unwrap_or_else(|e| e.into_inner()) = size;
    }

    fn expect_state(&self, operation: &'static str, allowed: &[TaskState]) -> Result<()> {
        let state = *self.state.borrow();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(DownloadError::InvalidState { operation, state })
        }
    }

    fn fail(&self, err: &DownloadError) {
        error!(url = %self.url, error = %err, "download failed");
        self.listener.on_error(err.kind(), &err.to_string());
        self.state.send_replace(TaskState::Failed);
    }

    async fn prepare_fresh(&self) -> Result<Active> {
        if let Some(parent) = self.destination.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|source| DownloadError::CreateDir {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
        }

        let client = self.config.build_client()?;
        let (size, accepts_ranges) = match self.known_size {
            Some(size) => (Some(size), true),
            None => self.probe(&client).await?,
        };
        let workers = if accepts_ranges { self.config.workers } else { 1 };
        let ranges = plan_ranges(size, workers)?;
        debug!(?size, ranges = ranges.len(), "planned ranges");

        if self.checkpoint.exists().await {
            warn!(path = ?self.checkpoint.path(), "discarding checkpoint of an earlier download");
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.destination)
            .await
            .map_err(|source| self.open_error(source))?;
        if let Some(size) = size {
            file.set_len(size)
                .await
                .map_err(|source| self.open_error(source))?;
        }

        self.checkpoint.save(&ranges).await?;
        self.downloaded.store(0, Ordering::Relaxed);
        self.set_size(size);
        Ok(self.activate(client, file, ranges))
    }

    async fn prepare_resume(&self) -> Result<Active> {
        let ranges = self.checkpoint.load().await?;

        if !fs::try_exists(&self.destination).await.unwrap_or(false) {
            return Err(DownloadError::DestinationMissing {
                path: self.destination.clone(),
            });
        }
        let file = OpenOptions::new()
            .write(true)
            .open(&self.destination)
            .await
            .map_err(|source| self.open_error(source))?;

        let client = self.config.build_client()?;
        self.downloaded
            .store(state::bytes_completed(&ranges), Ordering::Relaxed);
        self.set_size(self.known_size.or_else(|| state::total_size(&ranges)));
        debug!(ranges = ?ranges, "loaded checkpoint");
        Ok(self.activate(client, file, ranges))
    }

    fn activate(&self, client: Client, file: File, ranges: Vec<Range>) -> Active {
        let range_count = ranges.len();
        let ctx = WorkerContext {
            client,
            url: self.url.clone(),
            file: Arc::new(Mutex::new(file)),
            ranges: Arc::new(Mutex::new(ranges)),
            checkpoint: self.checkpoint.clone(),
            downloaded: self.downloaded.clone(),
            limiter: build_limiter(&self.config),
            config: self.config.clone(),
        };
        Active {
            ctx: Arc::new(ctx),
            range_count,
        }
    }

    fn open_error(&self, source: io::Error) -> DownloadError {
        DownloadError::OpenFile {
            path: self.destination.clone(),
            source,
        }
    }

    /// HEAD the URL for its length and range support.
    async fn probe(&self, client: &Client) -> Result<(Option<u64>, bool)> {
        let response = client
            .head(&self.url)
            .send()
            .await
            .map_err(|e| DownloadError::Probe {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status == StatusCode::METHOD_NOT_ALLOWED || status == StatusCode::NOT_IMPLEMENTED {
            warn!(%status, "server does not answer HEAD, size unknown");
            return Ok((None, true));
        }
        if !status.is_success() {
            return Err(DownloadError::Probe {
                url: self.url.clone(),
                reason: format!("HEAD request failed with status {status}"),
            });
        }

        let headers = response.headers();
        let size = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|&size| size > 0);
        let accepts_ranges = headers
            .get(header::ACCEPT_RANGES)
            .map_or(true, |v| !v.as_bytes().eq_ignore_ascii_case(b"none"));

        debug!(?size, accepts_ranges, "probed remote resource");
        Ok((size, accepts_ranges))
    }

    /// Spawn a new generation of workers plus its sampler and fire the event.
    fn launch(inner: &Arc<Self>, control: &mut Control, event: Event) {
        let Some(active) = &control.active else {
            return;
        };

        let token = CancellationToken::new();
        control.token = token.clone();

        let workers: Vec<RangeWorker> = (0..active.range_count)
            .map(|index| RangeWorker::new(index, active.ctx.clone(), token.clone()))
            .collect();
        let sampler = SpeedSampler::new(
            inner.downloaded.clone(),
            inner.speed.clone(),
            inner.config.sample_interval,
        )
        .spawn(token.clone());

        inner.state.send_replace(TaskState::Running);
        match event {
            Event::Start => inner.listener.on_start(),
            Event::Resume => inner.listener.on_resume(),
        }

        let file = active.ctx.file.clone();
        control.driver = Some(tokio::spawn(Self::drive(
            inner.clone(),
            workers,
            sampler,
            token,
            file,
        )));
    }

    /// Join one generation and settle how it ended.
    async fn drive(
        self: Arc<Self>,
        workers: Vec<RangeWorker>,
        sampler: JoinHandle<()>,
        token: CancellationToken,
        file: Arc<Mutex<File>>,
    ) {
        let mut pending: FuturesUnordered<_> = workers
            .into_iter()
            .map(|worker| tokio::spawn(worker.run()))
            .collect();

        let mut paused = false;
        let mut failure: Option<DownloadError> = None;
        while let Some(joined) = pending.next().await {
            let result = joined.unwrap_or_else(|e| Err(DownloadError::Io(io::Error::other(e))));
            match result {
                Ok(WorkerExit::Completed) => {}
                Ok(WorkerExit::Paused) => paused = true,
                Err(err) if failure.is_none() => {
                    // Stop the other ranges on a checkpointed boundary.
                    token.cancel();
                    failure = Some(err);
                }
                Err(err) => debug!(error = %err, "additional range failure"),
            }
        }

        token.cancel();
        if let Err(err) = sampler.await {
            warn!(error = %err, "speed sampler ended abnormally");
        }
        self.speed.store(0, Ordering::Relaxed);

        if let Some(err) = failure {
            self.fail(&err);
            return;
        }
        if paused {
            return;
        }

        match self.finalize(&file).await {
            Ok(()) => {
                info!(
                    destination = ?self.destination,
                    bytes = self.downloaded.load(Ordering::Relaxed),
                    "download finished"
                );
                self.listener.on_finish();
                self.state.send_replace(TaskState::Finished);
            }
            Err(err) => self.fail(&err),
        }
    }

    async fn finalize(&self, file: &Mutex<File>) -> Result<()> {
        {
            let mut file = file.lock().await;
            file.flush().await?;
            file.sync_all().await?;
        }
        if self.size().is_none() {
            self.set_size(Some(self.downloaded.load(Ordering::Relaxed)));
        }
        self.checkpoint.remove().await
    }
}
