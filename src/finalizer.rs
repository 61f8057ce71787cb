//! Single-winner finalization: verify completeness, claim the upload, stream
//! the blob through SHA-256, peek at archive entry names, and commit the
//! terminal state.

use crate::blob::BlobStore;
use crate::store::{StoreDb, UploadStatus};
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

/// Streaming buffer for hashing; the blob is never materialized in memory.
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Sentinel entry list for blobs that do not parse as a ZIP archive.
pub const NOT_A_ZIP: &str = "(Not a valid ZIP archive)";

/// What a finalize attempt observed. The HTTP layer maps each variant to a
/// status code; only `Completed` carries the committed result.
#[derive(Debug)]
pub enum FinalizeOutcome {
    Completed {
        hash: String,
        zip_content: Vec<String>,
    },
    /// Another finalizer holds the PROCESSING claim, or the upload already
    /// failed.
    Conflict(UploadStatus),
    /// Not every chunk has been received; nothing was mutated.
    Incomplete { received: i64, expected: i64 },
    /// Client digest disagrees with the server digest; the upload is FAILED.
    HashMismatch {
        server_hash: String,
        client_hash: String,
    },
    NotFound,
}

pub struct Finalizer {
    store: Arc<StoreDb>,
    blobs: Arc<BlobStore>,
}

impl Finalizer {
    pub fn new(store: Arc<StoreDb>, blobs: Arc<BlobStore>) -> Self {
        Self { store, blobs }
    }

    pub async fn finalize(
        &self,
        upload_id: &str,
        client_hash: Option<&str>,
    ) -> Result<FinalizeOutcome> {
        let Some(upload) = self.store.get_upload(upload_id)? else {
            return Ok(FinalizeOutcome::NotFound);
        };

        match upload.status {
            UploadStatus::Completed => {
                // Idempotent replay: the digest is durable, entry names are
                // metadata-only and re-read from the blob.
                let hash = upload
                    .final_hash
                    .clone()
                    .context("COMPLETED upload is missing its final hash")?;
                let zip_content = self.read_archive_names(upload_id).await;
                return Ok(FinalizeOutcome::Completed { hash, zip_content });
            }
            UploadStatus::Processing | UploadStatus::Failed => {
                return Ok(FinalizeOutcome::Conflict(upload.status));
            }
            UploadStatus::Uploading => {}
        }

        // Completeness gate, checked while the upload is still UPLOADING so a
        // rejection leaves the client free to push the missing chunks.
        let received = self.store.chunk_count(upload_id)?;
        if received != upload.total_chunks {
            warn!(
                target: "finalize",
                upload_id = %upload_id,
                received,
                expected = upload.total_chunks,
                "Finalize rejected, upload incomplete"
            );
            return Ok(FinalizeOutcome::Incomplete {
                received,
                expected: upload.total_chunks,
            });
        }

        if !self.store.claim_processing(upload_id)? {
            // Lost the race. Whoever won either still holds PROCESSING or has
            // already committed a terminal state.
            let current = self
                .store
                .get_upload(upload_id)?
                .context("Upload disappeared during finalize")?;
            if current.status == UploadStatus::Completed {
                let hash = current
                    .final_hash
                    .clone()
                    .context("COMPLETED upload is missing its final hash")?;
                let zip_content = self.read_archive_names(upload_id).await;
                return Ok(FinalizeOutcome::Completed { hash, zip_content });
            }
            return Ok(FinalizeOutcome::Conflict(current.status));
        }

        info!(target: "finalize", upload_id = %upload_id, "Processing claimed, hashing blob");

        let server_hash = match self.hash_blob(upload_id).await {
            Ok(hash) => hash,
            Err(err) => {
                self.store.fail_upload(upload_id)?;
                return Err(err.context("Failed to stream blob for hashing"));
            }
        };

        if let Some(client_hash) = client_hash {
            if !client_hash.eq_ignore_ascii_case(&server_hash) {
                warn!(
                    target: "finalize",
                    upload_id = %upload_id,
                    server_hash = %server_hash,
                    client_hash = %client_hash,
                    "Hash mismatch, failing upload"
                );
                self.store.fail_upload(upload_id)?;
                return Ok(FinalizeOutcome::HashMismatch {
                    server_hash,
                    client_hash: client_hash.to_string(),
                });
            }
        }

        let zip_content = self.read_archive_names(upload_id).await;

        self.store.complete_upload(upload_id, &server_hash)?;
        info!(
            target: "finalize",
            upload_id = %upload_id,
            hash = %server_hash,
            entries = zip_content.len(),
            "Upload completed"
        );

        Ok(FinalizeOutcome::Completed {
            hash: server_hash,
            zip_content,
        })
    }

    /// SHA-256 of the assembled blob, streamed with a bounded buffer.
    async fn hash_blob(&self, upload_id: &str) -> Result<String> {
        let mut file = self.blobs.reader(upload_id).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_BUFFER_SIZE];

        loop {
            let n = file.read(&mut buf).await.context("Failed to read blob")?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Entry names from the blob's ZIP central directory, payloads untouched.
    /// Anything that fails to parse yields the sentinel list instead of an
    /// error; this is informational output.
    async fn read_archive_names(&self, upload_id: &str) -> Vec<String> {
        let path = self.blobs.path(upload_id);
        let names = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let file = std::fs::File::open(&path)?;
            let mut archive = zip::ZipArchive::new(file)?;
            let mut names = Vec::with_capacity(archive.len());
            for i in 0..archive.len() {
                names.push(archive.by_index(i)?.name().to_string());
            }
            Ok(names)
        })
        .await;

        match names {
            Ok(Ok(names)) => names,
            _ => vec![NOT_A_ZIP.to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    struct Fixture {
        store: Arc<StoreDb>,
        blobs: Arc<BlobStore>,
        finalizer: Finalizer,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store = Arc::new(StoreDb::with_path(dir.path().join("meta.db")).unwrap());
        let blobs = Arc::new(BlobStore::new(dir.path().join("blobs")).unwrap());
        let finalizer = Finalizer::new(Arc::clone(&store), Arc::clone(&blobs));
        Fixture {
            store,
            blobs,
            finalizer,
            _dir: dir,
        }
    }

    async fn seed_upload(fx: &Fixture, payload: &[u8], chunk_size: usize) -> String {
        let total_chunks = payload.len().div_ceil(chunk_size) as i64;
        let upload = fx
            .store
            .insert_upload("file.bin", payload.len() as i64, total_chunks)
            .unwrap();
        for (i, part) in payload.chunks(chunk_size).enumerate() {
            fx.blobs
                .write_at(&upload.id, (i * chunk_size) as u64, part)
                .await
                .unwrap();
            fx.store.upsert_chunk(&upload.id, i as i64).unwrap();
        }
        upload.id
    }

    fn sha256_hex(bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }

    #[tokio::test]
    async fn happy_path_hashes_the_assembled_blob() {
        let fx = fixture();
        let payload = vec![0x41u8; 48];
        let id = seed_upload(&fx, &payload, 16).await;

        match fx.finalizer.finalize(&id, None).await.unwrap() {
            FinalizeOutcome::Completed { hash, zip_content } => {
                assert_eq!(hash, sha256_hex(&payload));
                assert_eq!(zip_content, vec![NOT_A_ZIP.to_string()]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let record = fx.store.get_upload(&id).unwrap().unwrap();
        assert_eq!(record.status, UploadStatus::Completed);
        assert_eq!(record.final_hash.as_deref(), Some(sha256_hex(&payload).as_str()));
    }

    #[tokio::test]
    async fn incomplete_upload_is_rejected_without_mutation() {
        let fx = fixture();
        let upload = fx.store.insert_upload("file.bin", 32, 2).unwrap();
        fx.blobs.write_at(&upload.id, 0, &[0u8; 16]).await.unwrap();
        fx.store.upsert_chunk(&upload.id, 0).unwrap();

        match fx.finalizer.finalize(&upload.id, None).await.unwrap() {
            FinalizeOutcome::Incomplete { received, expected } => {
                assert_eq!(received, 1);
                assert_eq!(expected, 2);
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let record = fx.store.get_upload(&upload.id).unwrap().unwrap();
        assert_eq!(record.status, UploadStatus::Uploading);
    }

    #[tokio::test]
    async fn client_hash_mismatch_fails_the_upload() {
        let fx = fixture();
        let id = seed_upload(&fx, b"payload bytes", 8).await;

        let bogus = "0".repeat(64);
        match fx.finalizer.finalize(&id, Some(&bogus)).await.unwrap() {
            FinalizeOutcome::HashMismatch {
                server_hash,
                client_hash,
            } => {
                assert_eq!(server_hash, sha256_hex(b"payload bytes"));
                assert_eq!(client_hash, bogus);
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let record = fx.store.get_upload(&id).unwrap().unwrap();
        assert_eq!(record.status, UploadStatus::Failed);
        assert!(record.final_hash.is_none());
    }

    #[tokio::test]
    async fn matching_client_hash_completes() {
        let fx = fixture();
        let id = seed_upload(&fx, b"payload bytes", 8).await;

        let expected = sha256_hex(b"payload bytes");
        match fx.finalizer.finalize(&id, Some(&expected)).await.unwrap() {
            FinalizeOutcome::Completed { hash, .. } => assert_eq!(hash, expected),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_finalize_replays_the_stored_result() {
        let fx = fixture();
        let id = seed_upload(&fx, b"same bytes either way", 8).await;

        let first = fx.finalizer.finalize(&id, None).await.unwrap();
        let second = fx.finalizer.finalize(&id, None).await.unwrap();

        match (first, second) {
            (
                FinalizeOutcome::Completed { hash: h1, .. },
                FinalizeOutcome::Completed { hash: h2, .. },
            ) => assert_eq!(h1, h2),
            other => panic!("unexpected outcomes {other:?}"),
        }
    }

    #[tokio::test]
    async fn finalize_during_processing_conflicts() {
        let fx = fixture();
        let id = seed_upload(&fx, b"contended", 4).await;

        assert!(fx.store.claim_processing(&id).unwrap());
        match fx.finalizer.finalize(&id, None).await.unwrap() {
            FinalizeOutcome::Conflict(UploadStatus::Processing) => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_finalizes_agree_on_one_result() {
        let fx = fixture();
        let id = seed_upload(&fx, b"raced bytes", 4).await;
        let expected = sha256_hex(b"raced bytes");

        let other = Finalizer::new(Arc::clone(&fx.store), Arc::clone(&fx.blobs));
        let (first, second) = tokio::join!(
            fx.finalizer.finalize(&id, None),
            other.finalize(&id, None)
        );

        let mut hashes = Vec::new();
        for outcome in [first.unwrap(), second.unwrap()] {
            match outcome {
                FinalizeOutcome::Completed { hash, .. } => hashes.push(hash),
                FinalizeOutcome::Conflict(UploadStatus::Processing) => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        // At least one caller committed; every observer saw the same digest.
        assert!(!hashes.is_empty());
        assert!(hashes.iter().all(|hash| hash == &expected));

        let record = fx.store.get_upload(&id).unwrap().unwrap();
        assert_eq!(record.status, UploadStatus::Completed);
        assert_eq!(record.final_hash.as_deref(), Some(expected.as_str()));
    }

    #[tokio::test]
    async fn unknown_upload_is_not_found() {
        let fx = fixture();
        match fx.finalizer.finalize("missing", None).await.unwrap() {
            FinalizeOutcome::NotFound => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn zip_blob_reports_entry_names_without_decompression() {
        let fx = fixture();

        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::FileOptions::default();
            writer.start_file("a.txt", options).unwrap();
            writer.write_all(b"alpha").unwrap();
            writer.start_file("b/c.txt", options).unwrap();
            writer.write_all(b"nested").unwrap();
            writer.finish().unwrap();
        }
        let payload = cursor.into_inner();
        let id = seed_upload(&fx, &payload, 64).await;

        match fx.finalizer.finalize(&id, None).await.unwrap() {
            FinalizeOutcome::Completed { hash, zip_content } => {
                assert_eq!(hash, sha256_hex(&payload));
                assert_eq!(zip_content, vec!["a.txt".to_string(), "b/c.txt".to_string()]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
