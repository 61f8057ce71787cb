use super::{AppError, AppState};
use crate::finalizer::{FinalizeOutcome, Finalizer};
use crate::store::UploadStatus;
use crate::sweep;
use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Absolute file offset for a chunk body. Authoritative for placement, so
/// variable chunk sizes stay possible.
const CHUNK_OFFSET_HEADER: &str = "X-Chunk-Offset";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    pub filename: String,
    pub total_size: i64,
    pub total_chunks: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    pub upload_id: String,
    pub status: String,
    pub uploaded_chunks: Vec<i64>,
}

#[derive(Debug, Serialize)]
pub struct ChunkReceipt {
    pub success: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub client_hash: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    pub status: String,
    pub upload_id: String,
    pub hash: String,
    pub zip_content: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub cleaned: usize,
}

/// Health check endpoint
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "chunkferry"
    }))
}

/// Start or reattach an upload. Resume equivalence is `(filename, totalSize)`;
/// a reattached client receives the chunk indices the server already holds.
pub async fn init_upload(
    State(state): State<AppState>,
    Json(req): Json<InitRequest>,
) -> Result<Json<InitResponse>, AppError> {
    if req.total_size < 0 {
        return Err(AppError::BadRequest("totalSize must be nonnegative".into()));
    }
    if req.total_chunks <= 0 {
        return Err(AppError::BadRequest("totalChunks must be positive".into()));
    }

    if let Some(existing) = state.store.find_resumable(&req.filename, req.total_size)? {
        if state.blobs.exists(&existing.id) {
            let uploaded_chunks = state.store.uploaded_chunks(&existing.id)?;
            info!(
                target: "api::upload",
                upload_id = %existing.id,
                filename = %req.filename,
                resumed_chunks = uploaded_chunks.len(),
                "Reattached to existing upload"
            );
            return Ok(Json(InitResponse {
                upload_id: existing.id,
                status: UploadStatus::Uploading.as_str().to_string(),
                uploaded_chunks,
            }));
        }

        // The record survived a restart but the blob did not. Chunk receipts
        // without bytes behind them are worthless, so start the byte store
        // over under the same id.
        info!(
            target: "api::upload",
            upload_id = %existing.id,
            "Blob missing for resumable upload, resetting chunk state"
        );
        state.store.delete_chunks(&existing.id)?;
        state.blobs.ensure(&existing.id).await?;
        return Ok(Json(InitResponse {
            upload_id: existing.id,
            status: UploadStatus::Uploading.as_str().to_string(),
            uploaded_chunks: Vec::new(),
        }));
    }

    let record = state
        .store
        .insert_upload(&req.filename, req.total_size, req.total_chunks)?;
    state.blobs.ensure(&record.id).await?;
    info!(
        target: "api::upload",
        upload_id = %record.id,
        filename = %req.filename,
        total_size = req.total_size,
        total_chunks = req.total_chunks,
        "Upload created"
    );

    Ok(Json(InitResponse {
        upload_id: record.id,
        status: UploadStatus::Uploading.as_str().to_string(),
        uploaded_chunks: Vec::new(),
    }))
}

/// Receive one chunk. Chunks arrive in any order; re-uploads of an index
/// overwrite the same byte range and refresh the same chunk row.
pub async fn put_chunk(
    State(state): State<AppState>,
    Path((upload_id, chunk_index)): Path<(String, i64)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ChunkReceipt>, AppError> {
    let upload = state
        .store
        .get_upload(&upload_id)?
        .ok_or_else(|| AppError::NotFound(format!("Unknown upload: {upload_id}")))?;

    if upload.status != UploadStatus::Uploading {
        return Err(AppError::Conflict(format!(
            "Upload is {}",
            upload.status.as_str()
        )));
    }

    if chunk_index < 0 || chunk_index >= upload.total_chunks {
        return Err(AppError::BadRequest(format!(
            "Chunk index {chunk_index} out of range"
        )));
    }

    let offset = headers
        .get(CHUNK_OFFSET_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| {
            AppError::BadRequest(format!("Missing or invalid {CHUNK_OFFSET_HEADER} header"))
        })?;

    if offset.saturating_add(body.len() as u64) > upload.total_size as u64 {
        return Err(AppError::BadRequest(format!(
            "Offset {offset} with {} body bytes exceeds total size {}",
            body.len(),
            upload.total_size
        )));
    }

    state.blobs.write_at(&upload_id, offset, &body).await?;
    state.store.upsert_chunk(&upload_id, chunk_index)?;

    debug!(
        target: "api::upload",
        upload_id = %upload_id,
        chunk_index,
        offset,
        len = body.len(),
        "Chunk received"
    );

    Ok(Json(ChunkReceipt { success: true }))
}

/// Finalize an upload. Exactly one caller performs the hash and commit; late
/// callers observe 409 while PROCESSING or the stored result once COMPLETED.
pub async fn finalize_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    payload: Option<Json<FinalizeRequest>>,
) -> Result<Json<FinalizeResponse>, AppError> {
    let client_hash = payload.and_then(|Json(req)| req.client_hash);
    let finalizer = Finalizer::new(Arc::clone(&state.store), Arc::clone(&state.blobs));

    match finalizer
        .finalize(&upload_id, client_hash.as_deref())
        .await?
    {
        FinalizeOutcome::Completed { hash, zip_content } => Ok(Json(FinalizeResponse {
            status: UploadStatus::Completed.as_str().to_string(),
            upload_id,
            hash,
            zip_content,
        })),
        FinalizeOutcome::Conflict(status) => Err(AppError::Conflict(format!(
            "Upload is {}",
            status.as_str()
        ))),
        FinalizeOutcome::Incomplete { received, expected } => Err(AppError::BadRequest(format!(
            "Upload incomplete: {received} of {expected} chunks received"
        ))),
        FinalizeOutcome::HashMismatch {
            server_hash,
            client_hash,
        } => Err(AppError::HashMismatch {
            server_hash,
            client_hash,
        }),
        FinalizeOutcome::NotFound => {
            Err(AppError::NotFound(format!("Unknown upload: {upload_id}")))
        }
    }
}

/// Sweep stale uploads on demand.
pub async fn cleanup_files(
    State(state): State<AppState>,
) -> Result<Json<CleanupResponse>, AppError> {
    let cleaned =
        sweep::sweep_stale(&state.store, &state.blobs, state.config.stale_ttl).await?;
    Ok(Json(CleanupResponse { cleaned }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::create_router;
    use crate::blob::BlobStore;
    use crate::config::ServerConfig;
    use crate::store::StoreDb;
    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use sha2::{Digest, Sha256};
    use std::time::Duration;
    use tempfile::tempdir;
    use tower::ServiceExt;

    struct Fixture {
        app: Router,
        state: AppState,
        _dir: tempfile::TempDir,
    }

    fn fixture_with_ttl(stale_ttl: Duration) -> Fixture {
        let dir = tempdir().unwrap();
        let state = AppState {
            store: Arc::new(StoreDb::with_path(dir.path().join("meta.db")).unwrap()),
            blobs: Arc::new(BlobStore::new(dir.path().join("blobs")).unwrap()),
            config: Arc::new(ServerConfig {
                chunk_size: 4,
                uploads_dir: dir.path().join("blobs"),
                database_path: dir.path().join("meta.db"),
                stale_ttl,
                ..ServerConfig::default()
            }),
        };
        Fixture {
            app: create_router(state.clone()),
            state,
            _dir: dir,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_ttl(Duration::from_secs(86_400))
    }

    async fn send_json(
        app: &Router,
        method: &str,
        uri: &str,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn init(app: &Router, filename: &str, total_size: i64, total_chunks: i64) -> String {
        let (status, body) = send_json(
            app,
            "POST",
            "/api/upload/init",
            serde_json::json!({
                "filename": filename,
                "totalSize": total_size,
                "totalChunks": total_chunks,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["uploadId"].as_str().unwrap().to_string()
    }

    async fn put_chunk_raw(
        app: &Router,
        upload_id: &str,
        index: i64,
        offset: Option<&str>,
        bytes: &[u8],
    ) -> StatusCode {
        let mut builder = Request::builder()
            .method("PUT")
            .uri(format!("/api/upload/{upload_id}/chunk/{index}"))
            .header("content-type", "application/octet-stream")
            .header("X-Chunk-Index", index.to_string());
        if let Some(offset) = offset {
            builder = builder.header("X-Chunk-Offset", offset);
        }
        app.clone()
            .oneshot(builder.body(Body::from(bytes.to_vec())).unwrap())
            .await
            .unwrap()
            .status()
    }

    async fn put_chunk_at(app: &Router, upload_id: &str, index: i64, offset: u64, bytes: &[u8]) {
        let status = put_chunk_raw(app, upload_id, index, Some(&offset.to_string()), bytes).await;
        assert_eq!(status, StatusCode::OK);
    }

    async fn finalize(app: &Router, upload_id: &str) -> (StatusCode, serde_json::Value) {
        send_json(
            app,
            "POST",
            &format!("/api/upload/{upload_id}/finalize"),
            serde_json::json!({}),
        )
        .await
    }

    fn sha256_hex(bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }

    #[tokio::test]
    async fn init_creates_a_fresh_upload() {
        let fx = fixture();
        let (status, body) = send_json(
            &fx.app,
            "POST",
            "/api/upload/init",
            serde_json::json!({ "filename": "a.bin", "totalSize": 10, "totalChunks": 3 }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "UPLOADING");
        assert_eq!(body["uploadedChunks"], serde_json::json!([]));
        let id = body["uploadId"].as_str().unwrap();
        assert!(fx.state.blobs.exists(id));
    }

    #[tokio::test]
    async fn init_rejects_invalid_geometry() {
        let fx = fixture();
        let (status, _) = send_json(
            &fx.app,
            "POST",
            "/api/upload/init",
            serde_json::json!({ "filename": "a.bin", "totalSize": -1, "totalChunks": 3 }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send_json(
            &fx.app,
            "POST",
            "/api/upload/init",
            serde_json::json!({ "filename": "a.bin", "totalSize": 10, "totalChunks": 0 }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn init_reattaches_and_reports_uploaded_chunks() {
        let fx = fixture();
        let id = init(&fx.app, "resume.bin", 10, 3).await;

        put_chunk_at(&fx.app, &id, 0, 0, b"AAAA").await;
        put_chunk_at(&fx.app, &id, 1, 4, b"BBBB").await;

        let (status, body) = send_json(
            &fx.app,
            "POST",
            "/api/upload/init",
            serde_json::json!({ "filename": "resume.bin", "totalSize": 10, "totalChunks": 3 }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["uploadId"], id);
        assert_eq!(body["uploadedChunks"], serde_json::json!([0, 1]));
    }

    #[tokio::test]
    async fn init_resets_chunk_state_when_blob_is_lost() {
        let fx = fixture();
        let id = init(&fx.app, "lost.bin", 8, 2).await;
        put_chunk_at(&fx.app, &id, 0, 0, b"AAAA").await;

        fx.state.blobs.remove(&id).await.unwrap();

        let (status, body) = send_json(
            &fx.app,
            "POST",
            "/api/upload/init",
            serde_json::json!({ "filename": "lost.bin", "totalSize": 8, "totalChunks": 2 }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["uploadId"], id);
        assert_eq!(body["uploadedChunks"], serde_json::json!([]));
        assert!(fx.state.blobs.exists(&id));
        assert_eq!(fx.state.store.chunk_count(&id).unwrap(), 0);
    }

    #[tokio::test]
    async fn put_chunk_requires_a_parseable_offset() {
        let fx = fixture();
        let id = init(&fx.app, "a.bin", 8, 2).await;

        let status = put_chunk_raw(&fx.app, &id, 0, None, b"AAAA").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let status = put_chunk_raw(&fx.app, &id, 0, Some("not-a-number"), b"AAAA").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn put_chunk_validates_bounds() {
        let fx = fixture();
        let id = init(&fx.app, "a.bin", 8, 2).await;

        // Offset past the end of the file.
        let status = put_chunk_raw(&fx.app, &id, 1, Some("6"), b"AAAA").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Index outside the chunk plan.
        let status = put_chunk_raw(&fx.app, &id, 5, Some("0"), b"AAAA").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let status = put_chunk_raw(&fx.app, "nope", 0, Some("0"), b"AAAA").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn repeated_put_of_the_same_chunk_is_idempotent() {
        let fx = fixture();
        let id = init(&fx.app, "a.bin", 8, 2).await;

        put_chunk_at(&fx.app, &id, 0, 0, b"AAAA").await;
        put_chunk_at(&fx.app, &id, 0, 0, b"AAAA").await;
        put_chunk_at(&fx.app, &id, 1, 4, b"BBBB").await;

        assert_eq!(fx.state.store.chunk_count(&id).unwrap(), 2);

        let (status, body) = finalize(&fx.app, &id).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hash"], sha256_hex(b"AAAABBBB"));
    }

    #[tokio::test]
    async fn out_of_order_upload_produces_the_same_hash() {
        let fx = fixture();
        let payload = b"ABCDEFGHIJ";

        let natural = init(&fx.app, "natural.bin", 10, 3).await;
        put_chunk_at(&fx.app, &natural, 0, 0, &payload[0..4]).await;
        put_chunk_at(&fx.app, &natural, 1, 4, &payload[4..8]).await;
        put_chunk_at(&fx.app, &natural, 2, 8, &payload[8..10]).await;
        let (_, natural_body) = finalize(&fx.app, &natural).await;

        let permuted = init(&fx.app, "permuted.bin", 10, 3).await;
        put_chunk_at(&fx.app, &permuted, 2, 8, &payload[8..10]).await;
        put_chunk_at(&fx.app, &permuted, 0, 0, &payload[0..4]).await;
        put_chunk_at(&fx.app, &permuted, 1, 4, &payload[4..8]).await;
        let (_, permuted_body) = finalize(&fx.app, &permuted).await;

        assert_eq!(natural_body["hash"], permuted_body["hash"]);
        assert_eq!(natural_body["hash"], sha256_hex(payload).as_str());
        assert_eq!(
            natural_body["zipContent"],
            serde_json::json!(["(Not a valid ZIP archive)"])
        );
    }

    #[tokio::test]
    async fn finalize_rejects_incomplete_uploads() {
        let fx = fixture();
        let id = init(&fx.app, "a.bin", 8, 2).await;
        put_chunk_at(&fx.app, &id, 0, 0, b"AAAA").await;

        let (status, _) = finalize(&fx.app, &id).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // The upload is still UPLOADING and accepts the missing chunk.
        put_chunk_at(&fx.app, &id, 1, 4, b"BBBB").await;
        let (status, _) = finalize(&fx.app, &id).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn finalize_reports_hash_mismatch_details() {
        let fx = fixture();
        let id = init(&fx.app, "a.bin", 4, 1).await;
        put_chunk_at(&fx.app, &id, 0, 0, b"AAAA").await;

        let bogus = "0".repeat(64);
        let (status, body) = send_json(
            &fx.app,
            "POST",
            &format!("/api/upload/{id}/finalize"),
            serde_json::json!({ "clientHash": bogus }),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Hash mismatch");
        assert_eq!(body["serverHash"], sha256_hex(b"AAAA"));
        assert_eq!(body["clientHash"], bogus.as_str());

        // Terminal failure: subsequent chunk PUTs are refused.
        let status = put_chunk_raw(&fx.app, &id, 0, Some("0"), b"AAAA").await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn finalize_twice_is_idempotent_after_completion() {
        let fx = fixture();
        let id = init(&fx.app, "a.bin", 4, 1).await;
        put_chunk_at(&fx.app, &id, 0, 0, b"AAAA").await;

        let (first_status, first) = finalize(&fx.app, &id).await;
        let (second_status, second) = finalize(&fx.app, &id).await;

        assert_eq!(first_status, StatusCode::OK);
        assert_eq!(second_status, StatusCode::OK);
        assert_eq!(first["hash"], second["hash"]);
    }

    #[tokio::test]
    async fn finalize_conflicts_while_processing() {
        let fx = fixture();
        let id = init(&fx.app, "a.bin", 4, 1).await;
        put_chunk_at(&fx.app, &id, 0, 0, b"AAAA").await;

        assert!(fx.state.store.claim_processing(&id).unwrap());
        let (status, _) = finalize(&fx.app, &id).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn cleanup_sweeps_stale_uploads() {
        let fx = fixture_with_ttl(Duration::from_secs(0));
        let id = init(&fx.app, "stale.bin", 8, 2).await;

        let response = fx
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/files")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["cleaned"], 1);

        let record = fx.state.store.get_upload(&id).unwrap().unwrap();
        assert_eq!(record.status, UploadStatus::Failed);
        assert!(!fx.state.blobs.exists(&id));
    }
}
