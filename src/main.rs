use anyhow::{Context, Result};
use chunkferry::api::{AppState, create_router};
use chunkferry::blob::BlobStore;
use chunkferry::config::ServerConfig;
use chunkferry::logging::{self, LogConfig};
use chunkferry::store::StoreDb;
use chunkferry::sweep;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> Result<()> {
    // Keep the guard alive for the entire process so file logs flush on exit.
    let _log_guard =
        logging::init_logging(LogConfig::default()).context("Failed to initialize logging")?;

    tracing::info!(target: "main", "Starting chunkferry server...");

    let config = Arc::new(ServerConfig::from_env());
    config.ensure_dirs()?;

    let store = Arc::new(
        StoreDb::with_path(config.database_path.clone()).context("Failed to open store")?,
    );
    let blobs = Arc::new(BlobStore::new(&config.uploads_dir).context("Failed to open blob store")?);
    tracing::info!(
        target: "main",
        database = %config.database_path.display(),
        uploads_dir = %config.uploads_dir.display(),
        chunk_size = config.chunk_size,
        "Storage initialized"
    );

    // Periodic stale-upload sweep, in addition to the DELETE /api/files route.
    let sweeper_cancel = CancellationToken::new();
    let sweeper = tokio::spawn(sweep::run_periodic(
        Arc::clone(&store),
        Arc::clone(&blobs),
        config.stale_ttl,
        config.sweep_interval,
        sweeper_cancel.clone(),
    ));

    let state = AppState {
        store,
        blobs,
        config: Arc::clone(&config),
    };
    let app = create_router(state).layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context(format!("Failed to bind to {addr}"))?;

    tracing::info!(target: "main", "HTTP server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!(target: "main", "Shutting down...");
    sweeper_cancel.cancel();
    let _ = sweeper.await;
    tracing::info!(target: "main", "Server shutdown complete");

    Ok(())
}

/// Wait for ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!(target: "main", "Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!(target: "main", "Received SIGTERM signal");
        },
    }
}
