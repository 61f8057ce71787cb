//! Tracing setup: rolling JSON log files plus a compact stdout layer.
//!
//! Log targets follow the module they report on: `api`, `api::upload`,
//! `store`, `blob`, `finalize`, `engine`, `engine::chunk`, `sweep`, `main`.
//! Levels are tuned per target through `RUST_LOG`, e.g.
//! `RUST_LOG=api=debug,engine::chunk=trace`.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub struct LogConfig {
    pub log_dir: PathBuf,
    pub file_prefix: String,
    /// Rotated daily; files beyond this count are pruned.
    pub max_files: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        let log_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".chunkferry")
            .join("logs");

        Self {
            log_dir,
            file_prefix: "chunkferry".to_string(),
            max_files: 5,
        }
    }
}

/// Install the global subscriber. The returned guard owns the non-blocking
/// file writer and must live for the whole process.
pub fn init_logging(config: LogConfig) -> Result<LogGuard> {
    std::fs::create_dir_all(&config.log_dir).context("Failed to create log directory")?;

    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(&config.file_prefix)
        .filename_suffix("log")
        .max_log_files(config.max_files)
        .build(&config.log_dir)
        .context("Failed to create file appender")?;

    let (non_blocking_file, worker_guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = fmt::layer()
        .json()
        .with_writer(non_blocking_file)
        .with_target(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_filter(env_filter.clone());

    let stdout_layer = fmt::layer()
        .compact()
        .with_target(true)
        .with_ansi(true)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .init();

    tracing::info!(
        target: "main",
        log_dir = %config.log_dir.display(),
        max_files = config.max_files,
        "Logging initialized"
    );

    Ok(LogGuard {
        _worker_guard: worker_guard,
    })
}

pub struct LogGuard {
    _worker_guard: tracing_appender::non_blocking::WorkerGuard,
}
