mod error;
mod handlers;

pub use error::AppError;

use crate::blob::BlobStore;
use crate::config::ServerConfig;
use crate::store::StoreDb;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<StoreDb>,
    pub blobs: Arc<BlobStore>,
    pub config: Arc<ServerConfig>,
}

/// Create the API router. CORS is wide open so browser clients can talk to
/// the server directly; the body limit admits one chunk plus slack.
pub fn create_router(state: AppState) -> Router {
    tracing::debug!(target: "api", "Creating API router");

    let body_limit = state.config.chunk_size as usize + 64 * 1024;

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/upload/init", post(handlers::init_upload))
        .route(
            "/api/upload/:upload_id/chunk/:chunk_index",
            put(handlers::put_chunk),
        )
        .route(
            "/api/upload/:upload_id/finalize",
            post(handlers::finalize_upload),
        )
        .route("/api/files", delete(handlers::cleanup_files))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
