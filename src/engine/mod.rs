//! Client upload engine.
//!
//! Plans the chunk list, learns already-present chunks from the server, keeps
//! at most `max_concurrency` PUTs in flight through a small worker pool,
//! retries transient failures with exponential backoff, supports
//! pause/resume, and triggers finalization once every chunk is confirmed.

mod chunk;
mod error;
mod plan;
mod progress;

pub use error::{UploadError, UploadResult};
pub use plan::{ChunkPlan, ChunkSlot, ChunkState};
pub use progress::{
    FnProgress, NoOpProgress, ProgressCallback, ProgressTracker, ProgressUpdate, format_bytes,
    format_eta, format_speed,
};

use crate::config::{DEFAULT_CHUNK_SIZE, env_parse};
use chunk::ChunkDispatcher;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Engine configuration. Defaults mirror the server's negotiated values.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub base_url: String,
    pub chunk_size: u64,
    /// Upper bound on concurrently in-flight chunk PUTs.
    pub max_concurrency: usize,
    /// Transient failures tolerated per chunk before the transfer fails.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:4000".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrency: 3,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(base_url) = std::env::var("API_BASE_URL") {
            config.base_url = base_url;
        }
        config.chunk_size = env_parse("CHUNK_SIZE", config.chunk_size);
        config.max_concurrency = env_parse("MAX_CONCURRENCY", config.max_concurrency);
        config.max_retries = env_parse("MAX_RETRIES", config.max_retries);
        config
    }
}

/// Overall transfer status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineStatus {
    Idle,
    Uploading,
    Paused,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InitRequest {
    filename: String,
    total_size: u64,
    total_chunks: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitHandshake {
    upload_id: String,
    #[allow(dead_code)]
    status: String,
    uploaded_chunks: Vec<u64>,
}

/// The server's finalize result, handed to `on_complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeSummary {
    pub status: String,
    pub upload_id: String,
    /// Lowercase hex SHA-256 of the assembled file.
    pub hash: String,
    pub zip_content: Vec<String>,
}

/// `2^attempt · base`, capped. Growth is also capped at 2^10 so the shift
/// cannot overflow on absurd attempt counts.
fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    let delay_ms = base_ms.saturating_mul(1 << attempt.min(10));
    Duration::from_millis(delay_ms).min(max)
}

/// Cloneable handle to one file transfer. `start()` runs the transfer to a
/// terminal state; `pause()`/`resume()` may be called from other tasks while
/// it runs.
#[derive(Clone)]
pub struct UploadEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    base_url: String,
    http: HttpClient,
    dispatcher: ChunkDispatcher,
    file_path: PathBuf,
    filename: String,
    file_size: u64,
    status: RwLock<EngineStatus>,
    upload_id: OnceLock<String>,
    plan: OnceLock<ChunkPlan>,
    queue: Mutex<VecDeque<usize>>,
    paused: AtomicBool,
    pause_notify: Notify,
    cancel: CancellationToken,
    tracker: ProgressTracker,
    callback: Box<dyn ProgressCallback>,
    fatal: Mutex<Option<UploadError>>,
}

impl UploadEngine {
    pub fn new(
        file_path: impl Into<PathBuf>,
        config: EngineConfig,
        callback: impl ProgressCallback + 'static,
    ) -> UploadResult<Self> {
        let file_path = file_path.into();
        let metadata = std::fs::metadata(&file_path)
            .map_err(|err| UploadError::FileRead(err.to_string()))?;
        let filename = file_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| UploadError::FileRead("path has no file name".to_string()))?;

        let http = HttpClient::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| UploadError::Network(err.to_string()))?;

        let base_url = config.base_url.trim_end_matches('/').to_string();
        let file_size = metadata.len();

        Ok(Self {
            inner: Arc::new(EngineInner {
                dispatcher: ChunkDispatcher::new(http.clone(), base_url.clone()),
                base_url,
                http,
                file_path,
                filename,
                file_size,
                status: RwLock::new(EngineStatus::Idle),
                upload_id: OnceLock::new(),
                plan: OnceLock::new(),
                queue: Mutex::new(VecDeque::new()),
                paused: AtomicBool::new(false),
                pause_notify: Notify::new(),
                cancel: CancellationToken::new(),
                tracker: ProgressTracker::new(file_size),
                callback: Box::new(callback),
                fatal: Mutex::new(None),
                config,
            }),
        })
    }

    /// Run the transfer to a terminal state. Call once per engine; use
    /// `resume()` for another pass after a failure.
    pub async fn start(&self) -> UploadResult<FinalizeSummary> {
        {
            let mut status = self.inner.status.write().unwrap();
            if *status != EngineStatus::Idle {
                return Err(UploadError::InitFailed(format!(
                    "engine already started ({:?})",
                    *status
                )));
            }
            *status = EngineStatus::Uploading;
        }
        self.inner.tracker.mark_started();

        let outcome = self.inner.first_pass().await;
        self.finish(outcome)
    }

    /// Stop dispatching new chunks. In-flight requests complete and their
    /// results are applied.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::Release);
        let mut status = self.inner.status.write().unwrap();
        if *status == EngineStatus::Uploading {
            *status = EngineStatus::Paused;
            drop(status);
            info!(target: "engine", "Upload paused");
            self.inner.emit();
        }
    }

    /// Reopen the pause gate. From FAILED, run one more pass over every
    /// non-SUCCESS chunk with attempt counters retained; returns the finalize
    /// summary when that extra pass completed the transfer.
    pub async fn resume(&self) -> UploadResult<Option<FinalizeSummary>> {
        let current = self.status();
        match current {
            EngineStatus::Paused => {
                {
                    let mut status = self.inner.status.write().unwrap();
                    *status = EngineStatus::Uploading;
                }
                self.inner.paused.store(false, Ordering::Release);
                self.inner.pause_notify.notify_waiters();
                info!(target: "engine", "Upload resumed");
                self.inner.emit();
                Ok(None)
            }
            EngineStatus::Failed => {
                {
                    let mut status = self.inner.status.write().unwrap();
                    *status = EngineStatus::Uploading;
                }
                info!(target: "engine", "Retrying failed upload");
                self.inner.emit();
                let outcome = self.inner.retry_pass().await;
                self.finish(outcome).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Abort the transfer between attempts. Terminal; a cancelled engine
    /// cannot be resumed.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
        // Unpark any workers waiting at the pause gate so they observe it.
        self.inner.pause_notify.notify_waiters();
    }

    pub fn status(&self) -> EngineStatus {
        *self.inner.status.read().unwrap()
    }

    /// Current chunk table, ordered by index.
    pub fn chunks(&self) -> Vec<ChunkSlot> {
        self.inner
            .plan
            .get()
            .map(|plan| plan.snapshot())
            .unwrap_or_default()
    }

    pub fn upload_id(&self) -> Option<&str> {
        self.inner.upload_id.get().map(|id| id.as_str())
    }

    fn finish(&self, outcome: UploadResult<FinalizeSummary>) -> UploadResult<FinalizeSummary> {
        match outcome {
            Ok(summary) => Ok(summary),
            Err(err) => {
                self.inner.set_status(EngineStatus::Failed);
                self.inner.emit();
                warn!(target: "engine", error = %err, "Upload failed");
                self.inner.callback.on_error(&err);
                Err(err)
            }
        }
    }
}

impl EngineInner {
    async fn first_pass(self: &Arc<Self>) -> UploadResult<FinalizeSummary> {
        let handshake = self.handshake().await?;
        let already: Vec<usize> = handshake
            .uploaded_chunks
            .iter()
            .map(|&index| index as usize)
            .collect();

        let plan = ChunkPlan::new(self.file_size, self.config.chunk_size, &already);
        self.tracker.seed(plan.success_bytes());
        let pending = plan.pending_indices();
        let _ = self.upload_id.set(handshake.upload_id);
        let _ = self.plan.set(plan);

        self.emit();
        self.fill_queue(pending);
        self.drive().await;
        self.after_pass().await
    }

    async fn retry_pass(self: &Arc<Self>) -> UploadResult<FinalizeSummary> {
        let plan = self.plan()?;
        let remaining = plan.non_success_indices();
        for &index in &remaining {
            plan.set_state(index, ChunkState::Pending);
        }
        *self.fatal.lock().unwrap() = None;

        self.emit();
        self.fill_queue(remaining);
        self.drive().await;
        self.after_pass().await
    }

    /// Spawn the worker pool and wait for it to drain the queue. Each worker
    /// owns one concurrency slot for its whole attempt cycle, backoff
    /// included, so in-flight PUTs never exceed `max_concurrency`.
    async fn drive(self: &Arc<Self>) {
        let pass_token = self.cancel.child_token();
        let workers: Vec<_> = (0..self.config.max_concurrency.max(1))
            .map(|worker| {
                let inner = Arc::clone(self);
                let token = pass_token.clone();
                tokio::spawn(async move { inner.worker_loop(worker, token).await })
            })
            .collect();

        for handle in workers {
            let _ = handle.await;
        }
    }

    async fn worker_loop(&self, worker: usize, token: CancellationToken) {
        loop {
            if token.is_cancelled() {
                return;
            }
            self.wait_if_paused().await;

            let next = self.queue.lock().unwrap().pop_front();
            let Some(index) = next else { return };

            debug!(target: "engine", worker, chunk = index, "Worker picked up chunk");
            if let Err(err) = self.upload_with_retry(index, &token).await {
                self.record_fatal(err);
                // Stop the other workers; the transfer is failing.
                token.cancel();
                return;
            }
        }
    }

    async fn upload_with_retry(
        &self,
        index: usize,
        token: &CancellationToken,
    ) -> UploadResult<()> {
        let plan = self.plan()?;
        let upload_id = self
            .upload_id
            .get()
            .cloned()
            .ok_or_else(|| UploadError::InitFailed("upload id not set".to_string()))?;

        loop {
            if token.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            self.wait_if_paused().await;

            plan.set_state(index, ChunkState::Uploading);
            self.emit();

            let slot = plan
                .get(index)
                .ok_or_else(|| UploadError::InitFailed(format!("chunk {index} not in plan")))?;

            match self
                .dispatcher
                .put_chunk(&self.file_path, &upload_id, &slot)
                .await
            {
                Ok(()) => {
                    plan.set_state(index, ChunkState::Success);
                    self.tracker.add_bytes(slot.len());
                    self.emit();
                    return Ok(());
                }
                Err(err) if err.is_retryable() => {
                    let attempts = plan.record_attempt(index);
                    if attempts > self.config.max_retries {
                        plan.set_state(index, ChunkState::ErrorFatal);
                        self.emit();
                        return Err(UploadError::RetriesExhausted {
                            chunk_index: index,
                            attempts,
                            message: err.to_string(),
                        });
                    }

                    plan.set_state(index, ChunkState::ErrorRetry);
                    self.emit();

                    let delay = backoff_delay(
                        self.config.retry_base_delay,
                        self.config.retry_max_delay,
                        attempts,
                    );
                    debug!(
                        target: "engine",
                        chunk = index,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying chunk after backoff"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => return Err(UploadError::Cancelled),
                    }

                    plan.set_state(index, ChunkState::Pending);
                    self.emit();
                }
                Err(err) => {
                    // 4xx and file errors cannot succeed on retry.
                    plan.set_state(index, ChunkState::ErrorFatal);
                    self.emit();
                    return Err(err);
                }
            }
        }
    }

    async fn after_pass(&self) -> UploadResult<FinalizeSummary> {
        if let Some(err) = self.fatal.lock().unwrap().take() {
            return Err(err);
        }
        if self.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let plan = self.plan()?;
        if !plan.all_success() {
            return Err(UploadError::Cancelled);
        }

        self.finalize().await
    }

    async fn handshake(&self) -> UploadResult<InitHandshake> {
        let total_chunks = ChunkPlan::num_chunks_for(self.file_size, self.config.chunk_size);
        let request = InitRequest {
            filename: self.filename.clone(),
            total_size: self.file_size,
            total_chunks: total_chunks as u64,
        };

        let response = self
            .http
            .post(format!("{}/api/upload/init", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|err| UploadError::InitFailed(err.to_string()))?;

        if !response.status().is_success() {
            return Err(UploadError::InitFailed(format!(
                "server returned {}",
                response.status()
            )));
        }

        let handshake: InitHandshake = response
            .json()
            .await
            .map_err(|err| UploadError::InitFailed(err.to_string()))?;

        info!(
            target: "engine",
            upload_id = %handshake.upload_id,
            filename = %self.filename,
            total_chunks,
            resumed_chunks = handshake.uploaded_chunks.len(),
            "Upload session established"
        );
        Ok(handshake)
    }

    async fn finalize(&self) -> UploadResult<FinalizeSummary> {
        self.set_status(EngineStatus::Processing);
        self.emit();

        let upload_id = self
            .upload_id
            .get()
            .cloned()
            .ok_or_else(|| UploadError::InitFailed("upload id not set".to_string()))?;

        let response = self
            .http
            .post(format!("{}/api/upload/{}/finalize", self.base_url, upload_id))
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|err| UploadError::FinalizeFailed(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(UploadError::FinalizeFailed(format!(
                "server returned {status}: {message}"
            )));
        }

        let summary: FinalizeSummary = response
            .json()
            .await
            .map_err(|err| UploadError::FinalizeFailed(err.to_string()))?;

        self.set_status(EngineStatus::Completed);
        self.emit();
        info!(
            target: "engine",
            upload_id = %summary.upload_id,
            hash = %summary.hash,
            "Upload completed"
        );
        self.callback.on_complete(&summary);
        Ok(summary)
    }

    /// Park until the pause gate opens or the engine is cancelled.
    async fn wait_if_paused(&self) {
        loop {
            if !self.paused.load(Ordering::Acquire) || self.cancel.is_cancelled() {
                return;
            }
            let notified = self.pause_notify.notified();
            if !self.paused.load(Ordering::Acquire) || self.cancel.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    fn fill_queue(&self, indices: Vec<usize>) {
        let mut queue = self.queue.lock().unwrap();
        queue.clear();
        queue.extend(indices);
    }

    fn plan(&self) -> UploadResult<&ChunkPlan> {
        self.plan
            .get()
            .ok_or_else(|| UploadError::InitFailed("chunk plan not initialized".to_string()))
    }

    fn set_status(&self, status: EngineStatus) {
        *self.status.write().unwrap() = status;
    }

    fn record_fatal(&self, err: UploadError) {
        let mut slot = self.fatal.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn emit(&self) {
        let snapshot = self
            .plan
            .get()
            .map(|plan| plan.snapshot())
            .unwrap_or_default();
        let status = *self.status.read().unwrap();
        let update = self.tracker.create_update(status, snapshot);
        self.callback.on_progress(update);
    }
}
