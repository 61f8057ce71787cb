//! Runtime configuration resolved from environment variables.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Default chunk size shared by client and server: 5 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Server-side settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Negotiated chunk size handed to clients.
    pub chunk_size: u64,
    /// Directory holding `{upload_id}.bin` blobs.
    pub uploads_dir: PathBuf,
    /// SQLite store path.
    pub database_path: PathBuf,
    pub port: u16,
    /// Age after which an UPLOADING upload is eligible for the stale sweep.
    pub stale_ttl: Duration,
    /// Cadence of the background sweep task.
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            uploads_dir: data_dir.join("blobs"),
            database_path: data_dir.join("meta.db"),
            port: 4000,
            stale_ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl ServerConfig {
    /// Resolve the configuration from the environment, falling back to
    /// defaults for anything unset or malformed.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            chunk_size: env_parse("CHUNK_SIZE", defaults.chunk_size),
            uploads_dir: std::env::var("UPLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.uploads_dir),
            database_path: std::env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            port: env_parse("SERVER_PORT", defaults.port),
            stale_ttl: Duration::from_secs(env_parse(
                "STALE_TTL_SECS",
                defaults.stale_ttl.as_secs(),
            )),
            sweep_interval: Duration::from_secs(env_parse(
                "SWEEP_INTERVAL_SECS",
                defaults.sweep_interval.as_secs(),
            )),
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.uploads_dir).with_context(|| {
            format!("Failed to create uploads dir {}", self.uploads_dir.display())
        })?;
        if let Some(parent) = self.database_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data dir {}", parent.display()))?;
        }
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chunkferry")
}

pub(crate) fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(target: "main", var = name, value = %raw, "Ignoring malformed env value");
                default
            }
        },
        Err(_) => default,
    }
}
