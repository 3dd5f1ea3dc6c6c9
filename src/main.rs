use std::time::Instant;

use tokio::net::TcpListener;
use tracing::info;

use ytgrab::{
    cleanup::{ManifestStore, spawn_sweeper},
    config::Config,
    handlers::{AppState, router},
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "ytgrab=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> std::io::Result<()> {
    let config = Config::from_env();
    info!("Max file size: {}MB", config.max_file_bytes / 1_048_576);
    info!("Cleanup interval: {}s", config.cleanup_interval.as_secs());

    let manifest = ManifestStore::load(&config.temp_root).await;
    spawn_sweeper(
        manifest.clone(),
        config.temp_root.clone(),
        config.cleanup_interval,
    );

    let state = AppState {
        started_at: Instant::now(),
        manifest,
        config: config.clone(),
    };

    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!(
        "Starting YouTube Downloader API on http://{}",
        config.bind_addr
    );

    axum::serve(listener, router(state)).await
}
