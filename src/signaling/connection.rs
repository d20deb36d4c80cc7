#![forbid(unsafe_code)]

// WebSocket connection handler for individual peers

use super::coordinator::SessionCoordinator;
use super::protocol::{ErrorBody, ServerMessage};
use crate::metrics::ServerMetrics;
use crate::room::RoomManager;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded outbound queue per peer.
const CHANNEL_CAPACITY: usize = 64;

/// Close the connection if nothing arrives within this window.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Serialize a ServerMessage and queue it, waiting for capacity.
async fn send_json(sender: &mpsc::Sender<Arc<String>>, msg: &ServerMessage) -> anyhow::Result<()> {
    let json = Arc::new(serde_json::to_string(msg)?);
    sender
        .send(json)
        .await
        .map_err(|_| anyhow::anyhow!("peer channel closed"))
}

/// Handles a single WebSocket connection: one connection is one peer.
pub async fn handle_connection(
    socket: WebSocket,
    room_manager: Arc<RoomManager>,
    room_name: String,
    router_ready_timeout: Duration,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let peer_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {} (room {})", peer_id, room_name);

    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let send_peer_id = peer_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            if ws_sender
                .send(Message::Text((*json).clone().into()))
                .await
                .is_err()
            {
                break;
            }
        }
        debug!("Send task finished for peer: {}", send_peer_id);
    });

    let room = match room_manager.join(&room_name, &peer_id, tx.clone()) {
        Ok(room) => room,
        Err(e) => {
            warn!("Peer {} could not join room {}: {}", peer_id, room_name, e);
            let _ = send_json(
                &tx,
                &ServerMessage::Error {
                    id: None,
                    error: ErrorBody::from(&e),
                },
            )
            .await;
            drop(tx);
            let _ = send_task.await;
            return;
        }
    };

    let welcome = ServerMessage::Welcome {
        peer_id: peer_id.clone(),
        room: room_name.clone(),
    };
    if send_json(&tx, &welcome).await.is_ok() {
        let coordinator =
            SessionCoordinator::new(room, peer_id.clone(), router_ready_timeout, metrics.clone());
        receive_loop(&mut ws_receiver, &coordinator, &tx).await;
    }

    if let Err(e) = room_manager.leave(&room_name, &peer_id).await {
        warn!("Error removing peer {} from room {}: {}", peer_id, room_name, e);
    }

    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished for peer: {}", peer_id);
}

/// Requests of one peer are handled in arrival order.
async fn receive_loop(
    ws_receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    coordinator: &SessionCoordinator,
    tx: &mpsc::Sender<Arc<String>>,
) {
    let peer_id = coordinator.peer_id();

    loop {
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => {
                warn!("Idle timeout for peer {}", peer_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                let Some(reply) = coordinator.handle_text(text.as_str()).await else {
                    continue;
                };
                if send_json(tx, &reply).await.is_err() {
                    debug!("Send task gone for peer {}, closing", peer_id);
                    break;
                }
            }
            Message::Close(_) => {
                info!("Peer {} closed connection", peer_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // handled by axum
            }
            _ => {
                warn!("Unexpected binary frame from peer {}", peer_id);
                let reply = ServerMessage::Error {
                    id: None,
                    error: ErrorBody::invalid_request("Binary frames are not supported"),
                };
                if send_json(tx, &reply).await.is_err() {
                    break;
                }
            }
        }
    }
}
