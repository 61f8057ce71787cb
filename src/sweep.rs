//! Stale-upload cleanup: abandoned UPLOADING uploads are failed and their
//! blobs reclaimed.

use crate::blob::BlobStore;
use crate::store::StoreDb;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Fail every UPLOADING upload untouched for longer than `ttl` and remove its
/// blob. Returns the number of uploads swept. Safe to call repeatedly; an
/// upload swept once is terminal and never matches again.
pub async fn sweep_stale(store: &StoreDb, blobs: &BlobStore, ttl: Duration) -> Result<usize> {
    let cutoff = Utc::now().timestamp() - ttl.as_secs() as i64;
    let stale = store.stale_uploading(cutoff)?;
    if stale.is_empty() {
        return Ok(0);
    }

    let mut cleaned = 0usize;
    for upload in stale {
        if !store.fail_upload(&upload.id)? {
            // Raced a finalize; the upload is no longer ours to clean.
            continue;
        }
        if let Err(err) = blobs.remove(&upload.id).await {
            warn!(
                target: "sweep",
                upload_id = %upload.id,
                error = %err,
                "Failed to remove blob for stale upload"
            );
        }
        cleaned += 1;
    }

    info!(target: "sweep", cleaned, "Stale uploads swept");
    Ok(cleaned)
}

/// Background sweep loop, cancelled on shutdown.
pub async fn run_periodic(
    store: Arc<StoreDb>,
    blobs: Arc<BlobStore>,
    ttl: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Err(err) = sweep_stale(&store, &blobs, ttl).await {
                    warn!(target: "sweep", error = %err, "Periodic sweep failed");
                }
            }
            _ = cancel.cancelled() => {
                break;
            }
        }
    }
}
