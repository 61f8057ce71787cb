//! Progress reporting for the upload engine: byte accounting, speed and ETA,
//! and the callback seam the host application plugs into.

use super::{EngineStatus, FinalizeSummary};
use crate::engine::error::UploadError;
use crate::engine::plan::{ChunkSlot, ChunkState};
use std::fmt::{Debug, Formatter};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Progress update emitted after every state-changing event.
#[derive(Clone)]
pub struct ProgressUpdate {
    pub total_size: u64,
    /// Bytes confirmed by the server, including chunks resumed from a
    /// previous run.
    pub uploaded: u64,
    /// 0.0 – 100.0
    pub progress_pct: f64,
    /// Mean throughput since the engine started, in bytes per second.
    pub speed_bytes_per_sec: u64,
    /// None while the speed is zero.
    pub eta_seconds: Option<u64>,
    pub status: EngineStatus,
    pub total_chunks: usize,
    pub completed_chunks: usize,
    /// The full per-chunk status table.
    pub chunks: Vec<ChunkSlot>,
}

impl Debug for ProgressUpdate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} {:.1}% ({} / {}) @ {} | ETA: {} | chunks {}/{}",
            self.status,
            self.progress_pct,
            format_bytes(self.uploaded),
            format_bytes(self.total_size),
            format_speed(self.speed_bytes_per_sec),
            format_eta(self.eta_seconds),
            self.completed_chunks,
            self.total_chunks,
        )
    }
}

/// Format bytes into a human-readable string (e.g. "10.50 MB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec))
}

pub fn format_eta(eta_seconds: Option<u64>) -> String {
    match eta_seconds {
        None => "N/A".to_string(),
        Some(secs) => {
            let hours = secs / 3600;
            let minutes = (secs % 3600) / 60;
            let seconds = secs % 60;

            if hours > 0 {
                format!("{}h {}m {}s", hours, minutes, seconds)
            } else if minutes > 0 {
                format!("{}m {}s", minutes, seconds)
            } else {
                format!("{}s", seconds)
            }
        }
    }
}

/// Callbacks for upload lifecycle events. Retries are invisible here except
/// through chunk state changes; `on_error` fires only on fatal conditions.
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, update: ProgressUpdate);

    fn on_complete(&self, _summary: &FinalizeSummary) {}

    fn on_error(&self, _error: &UploadError) {}
}

/// No-op callback for hosts that poll the engine instead.
pub struct NoOpProgress;

impl ProgressCallback for NoOpProgress {
    fn on_progress(&self, _update: ProgressUpdate) {}
}

/// Closure-based progress callback
pub struct FnProgress<F>(pub F);

impl<F> ProgressCallback for FnProgress<F>
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    fn on_progress(&self, update: ProgressUpdate) {
        (self.0)(update)
    }
}

/// Byte-level accounting shared by the workers. Bytes are counted once the
/// server acknowledges a chunk, so the total never regresses on retry.
pub struct ProgressTracker {
    total_size: u64,
    uploaded: AtomicU64,
    started_at: Mutex<Option<Instant>>,
}

impl ProgressTracker {
    pub fn new(total_size: u64) -> Self {
        Self {
            total_size,
            uploaded: AtomicU64::new(0),
            started_at: Mutex::new(None),
        }
    }

    /// Stamp the transfer start; speed and ETA are measured from here.
    pub fn mark_started(&self) {
        let mut started = self.started_at.lock().unwrap();
        if started.is_none() {
            *started = Some(Instant::now());
        }
    }

    /// Seed the counter with bytes the server already confirmed.
    pub fn seed(&self, bytes: u64) {
        self.uploaded.store(bytes, Ordering::SeqCst);
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::SeqCst)
    }

    fn speed(&self) -> u64 {
        let started = self.started_at.lock().unwrap();
        let Some(started) = *started else { return 0 };
        let elapsed = started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }
        (self.uploaded() as f64 / elapsed) as u64
    }

    pub fn create_update(&self, status: EngineStatus, chunks: Vec<ChunkSlot>) -> ProgressUpdate {
        let uploaded = self.uploaded().min(self.total_size);
        let progress_pct = if self.total_size > 0 {
            (uploaded as f64 / self.total_size as f64 * 100.0).clamp(0.0, 100.0)
        } else {
            100.0
        };

        let speed = self.speed();
        let remaining = self.total_size - uploaded;
        let eta_seconds = if speed > 0 && remaining > 0 {
            Some(remaining / speed)
        } else {
            None
        };

        let completed_chunks = chunks
            .iter()
            .filter(|slot| slot.state == ChunkState::Success)
            .count();

        ProgressUpdate {
            total_size: self.total_size,
            uploaded,
            progress_pct,
            speed_bytes_per_sec: speed,
            eta_seconds,
            status,
            total_chunks: chunks.len(),
            completed_chunks,
            chunks,
        }
    }
}
