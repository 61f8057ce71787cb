//! Command-line client: ferry one file to a chunkferry server.

use anyhow::Result;
use chunkferry::engine::{
    EngineConfig, FnProgress, UploadEngine, format_bytes, format_eta, format_speed,
};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "upload", about = "Upload a file to a chunkferry server")]
struct Args {
    /// File to upload
    file: PathBuf,

    /// Server base URL; defaults to API_BASE_URL or http://127.0.0.1:4000
    #[arg(long)]
    server: Option<String>,

    /// Chunk size in bytes
    #[arg(long)]
    chunk_size: Option<u64>,

    /// Maximum chunks in flight
    #[arg(long)]
    concurrency: Option<usize>,

    /// Transient failures tolerated per chunk
    #[arg(long)]
    retries: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();

    let mut config = EngineConfig::from_env();
    if let Some(server) = args.server {
        config.base_url = server;
    }
    if let Some(chunk_size) = args.chunk_size {
        config.chunk_size = chunk_size;
    }
    if let Some(concurrency) = args.concurrency {
        config.max_concurrency = concurrency;
    }
    if let Some(retries) = args.retries {
        config.max_retries = retries;
    }

    let progress = FnProgress(|update: chunkferry::engine::ProgressUpdate| {
        print!(
            "\r[{:?}] {:5.1}% {} / {} @ {} | ETA {} | chunks {}/{}   ",
            update.status,
            update.progress_pct,
            format_bytes(update.uploaded),
            format_bytes(update.total_size),
            format_speed(update.speed_bytes_per_sec),
            format_eta(update.eta_seconds),
            update.completed_chunks,
            update.total_chunks,
        );
        let _ = std::io::stdout().flush();
    });

    let engine = UploadEngine::new(&args.file, config, progress)?;
    let summary = engine.start().await?;

    println!();
    println!("Upload {} complete", summary.upload_id);
    println!("SHA-256: {}", summary.hash);
    if summary.zip_content.len() == 1 && summary.zip_content[0].starts_with('(') {
        println!("Archive: {}", summary.zip_content[0]);
    } else {
        println!("Archive entries:");
        for name in &summary.zip_content {
            println!("  {name}");
        }
    }

    Ok(())
}
