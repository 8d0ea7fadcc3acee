//! livehub server with every listener enabled
//!
//! Run with: cargo run --example live_server [CONFIG.json]
//!
//! Without a config file the defaults apply:
//!   RTMP      0.0.0.0:1935
//!   HTTP-FLV  0.0.0.0:8080   http://host:8080/live/test.flv
//!   HTTP-TS   0.0.0.0:8080   http://host:8080/live/test.ts
//!   RTSP      0.0.0.0:5544   rtsp://host:5544/live/test (publish only)
//!
//! ## Publishing
//!
//!   ffmpeg -re -i input.mp4 -c copy -f flv rtmp://localhost/live/test
//!   ffmpeg -re -i input.mp4 -c copy -f rtsp -rtsp_transport tcp rtsp://localhost:5544/live/test
//!
//! ## Playing
//!
//!   ffplay rtmp://localhost/live/test
//!   ffplay http://localhost:8080/live/test.flv
//!   ffplay http://localhost:8080/live/test.ts

use livehub::{LiveServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("livehub=info".parse()?)
                .add_directive("live_server=debug".parse()?),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::load(&path)?,
        None => ServerConfig::default(),
    };
    tracing::info!(server_id = %config.server_id, "Starting livehub");

    let server = LiveServer::new(config).await?;
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
            }
        })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}
