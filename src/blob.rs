//! Random-access blob storage for in-flight and assembled uploads.
//!
//! One file per upload id under the uploads directory. Writes land at the
//! offset the client names, so chunks may arrive in any order and leave
//! sparse holes until the transfer fills them.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::debug;

pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open a blob store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create uploads dir {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn path(&self, upload_id: &str) -> PathBuf {
        self.root.join(format!("{upload_id}.bin"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self, upload_id: &str) -> bool {
        self.path(upload_id).is_file()
    }

    /// Ensure the blob file exists, zero-length if newly created.
    pub async fn ensure(&self, upload_id: &str) -> Result<()> {
        let path = self.path(upload_id);
        OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to create blob {}", path.display()))?;
        Ok(())
    }

    /// Write `bytes` at an absolute offset. Concurrent writes to disjoint
    /// ranges are legal; each call opens its own handle.
    pub async fn write_at(&self, upload_id: &str, offset: u64, bytes: &[u8]) -> Result<()> {
        let path = self.path(upload_id);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open blob {}", path.display()))?;

        file.seek(SeekFrom::Start(offset))
            .await
            .context("Failed to seek blob")?;
        file.write_all(bytes).await.context("Failed to write blob")?;
        file.flush().await.context("Failed to flush blob")?;

        debug!(
            target: "blob",
            upload_id = %upload_id,
            offset,
            len = bytes.len(),
            "Chunk written"
        );
        Ok(())
    }

    /// Open the blob for streaming reads from offset 0.
    pub async fn reader(&self, upload_id: &str) -> Result<File> {
        let path = self.path(upload_id);
        File::open(&path)
            .await
            .with_context(|| format!("Failed to open blob {}", path.display()))
    }

    pub async fn len(&self, upload_id: &str) -> Result<u64> {
        let meta = fs::metadata(self.path(upload_id))
            .await
            .context("Failed to stat blob")?;
        Ok(meta.len())
    }

    /// Delete the blob if present. Missing files are not an error, so the
    /// stale sweep stays idempotent.
    pub async fn remove(&self, upload_id: &str) -> Result<()> {
        let path = self.path(upload_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to remove blob {}", path.display()))
            }
        }
    }
}
