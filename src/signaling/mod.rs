#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server

pub mod connection;
pub mod coordinator;
pub mod protocol;

pub use coordinator::SessionCoordinator;

use crate::config::ServerConfig;
use crate::metrics::ServerMetrics;
use crate::room::RoomManager;
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    room_manager: Arc<RoomManager>,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
    default_room: String,
    router_ready_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct WsParams {
    room: Option<String>,
}

impl SignalingServer {
    pub fn new(room_manager: Arc<RoomManager>, config: &ServerConfig, metrics: ServerMetrics) -> Self {
        info!("Max connections: {}", config.max_connections);
        Self {
            room_manager,
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            default_room: config.default_room.clone(),
            router_ready_timeout: config.router_ready_timeout,
        }
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Starts the signaling server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, self.router()).await?;

        Ok(())
    }
}

async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "rooms": server.room_manager.room_count(),
        "peers": server.room_manager.total_peer_count(),
    }))
}

/// Prometheus text exposition
async fn metrics_handler(State(server): State<SignalingServer>) -> Response {
    let body = server.metrics.render_prometheus(
        server.room_manager.room_count(),
        server.room_manager.total_peer_count(),
    );
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// WebSocket upgrade handler; `?room=` selects the room, defaulting to the configured one
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(server): State<SignalingServer>,
) -> Response {
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    let room_name = params
        .room
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| server.default_room.clone());

    ws.max_message_size(65_536)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(
                socket,
                server.room_manager,
                room_name,
                server.router_ready_timeout,
                server.metrics,
                permit,
            )
        })
}
