mod config;
mod context;
mod detector;
mod fetch;
mod manager;
mod postprocess;
mod server;
mod stability;
mod store;
mod types;
mod worker;

use anyhow::Result;
use context::AppContext;
use std::sync::Arc;
use tracing::info;
use types::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "snapcount=info,ort=warn".to_string()),
        )
        .init();

    info!("📷 snapcount starting");

    let config_path =
        std::env::var("SNAPCOUNT_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
    let config = Config::load_or_default(&config_path)?;
    info!(
        "Detection thresholds: conf={:.2}, fast_open={:.2}, iou={:.2}, class={}",
        config.detection.confidence_threshold,
        config.detection.fast_open_threshold,
        config.detection.iou_threshold,
        config.detection.target_class_id
    );
    info!(
        "Stability: window={}, close_zero_run={}, heartbeat={}s",
        config.stability.window_size, config.stability.close_zero_run, config.stream.heartbeat_sec
    );

    let bind_addr = config.server.bind_addr.clone();
    let ctx = AppContext::new(config)?;
    let app = server::router(Arc::clone(&ctx));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("🚀 Listening on http://{bind_addr}");
    axum::serve(listener, app).await?;

    Ok(())
}
