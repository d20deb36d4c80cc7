#![forbid(unsafe_code)]

use anyhow::Result;
use std::sync::Arc;
use streamrooms::config::ServerConfig;
use streamrooms::media::MediaServer;
use streamrooms::metrics::ServerMetrics;
use streamrooms::room::RoomManager;
use streamrooms::signaling::SignalingServer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "streamrooms=debug,mediasoup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("StreamRooms - Starting server");

    let config = ServerConfig::from_env();
    info!(
        "Port {}, default room {}, announce IP {}",
        config.port, config.default_room, config.announce_ip
    );

    let media_server = MediaServer::new(config.media_config()).await?;
    let metrics = ServerMetrics::new();
    let room_manager = Arc::new(RoomManager::new(media_server.clone(), metrics.clone()));

    info!("Room manager and media server initialized");

    let signaling_server = SignalingServer::new(room_manager.clone(), &config, metrics);

    tokio::select! {
        result = signaling_server.serve(config.port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    // Rooms hold routers, so they go before the workers.
    room_manager.shutdown().await;
    media_server.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
