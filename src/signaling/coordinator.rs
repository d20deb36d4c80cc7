#![forbid(unsafe_code)]

// Per-connection request dispatcher: maps signaling requests onto room operations

use super::protocol::{ClientRequest, ErrorBody, RequestEnvelope, ResponsePayload, ServerMessage};
use crate::media::types::{MediaError, MediaResult, ProduceParams};
use crate::metrics::ServerMetrics;
use crate::room::Room;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Dispatches the requests of one peer against its room.
///
/// Every request carrying an id yields exactly one reply. Requests without
/// an id only produce a reply when they fail.
pub struct SessionCoordinator {
    room: Arc<Room>,
    peer_id: String,
    router_ready_timeout: Duration,
    metrics: ServerMetrics,
}

impl SessionCoordinator {
    pub fn new(
        room: Arc<Room>,
        peer_id: impl Into<String>,
        router_ready_timeout: Duration,
        metrics: ServerMetrics,
    ) -> Self {
        Self {
            room,
            peer_id: peer_id.into(),
            router_ready_timeout,
            metrics,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Parses and handles one text frame
    pub async fn handle_text(&self, text: &str) -> Option<ServerMessage> {
        match serde_json::from_str::<RequestEnvelope>(text) {
            Ok(envelope) => self.handle(envelope).await,
            Err(e) => {
                warn!("Invalid request from peer {}: {}", self.peer_id, e);
                self.metrics.inc_errors();
                // Recover the correlation id if the envelope itself was readable
                let id = serde_json::from_str::<serde_json::Value>(text)
                    .ok()
                    .and_then(|v| v.get("id").and_then(serde_json::Value::as_u64));
                Some(ServerMessage::Error {
                    id,
                    error: ErrorBody::invalid_request(format!("Invalid request: {e}")),
                })
            }
        }
    }

    pub async fn handle(&self, envelope: RequestEnvelope) -> Option<ServerMessage> {
        let RequestEnvelope { id, request } = envelope;
        let name = request.name();
        debug!("Peer {} -> {} (id {:?})", self.peer_id, name, id);

        self.metrics.inc_requests();
        let start = Instant::now();
        let result = self.dispatch(request).await;
        self.metrics.observe_request_handling(start.elapsed());

        match result {
            Ok(result) => id.map(|id| ServerMessage::Response { id, result }),
            Err(e) => {
                debug!("Peer {} {} failed: {}", self.peer_id, name, e);
                self.metrics.inc_errors();
                Some(ServerMessage::Error {
                    id,
                    error: ErrorBody::from(&e),
                })
            }
        }
    }

    async fn dispatch(&self, request: ClientRequest) -> MediaResult<ResponsePayload> {
        let room = &self.room;
        let peer_id = self.peer_id.as_str();

        match request {
            ClientRequest::RtpCapabilities => {
                room.wait_router_ready(self.router_ready_timeout).await?;
                Ok(ResponsePayload::RtpCapabilities(room.rtp_capabilities()?))
            }
            ClientRequest::CreateTransport => {
                room.wait_router_ready(self.router_ready_timeout).await?;
                Ok(ResponsePayload::Transport(room.create_transport(peer_id).await?))
            }
            ClientRequest::TransportConnect {
                transport_id,
                dtls_parameters,
            } => {
                room.connect_peer_transport(peer_id, &transport_id, dtls_parameters)
                    .await?;
                Ok(ResponsePayload::ack())
            }
            ClientRequest::Produce {
                transport_id,
                kind,
                rtp_parameters,
                app_data,
            } => {
                let params = ProduceParams {
                    kind,
                    rtp_parameters,
                    app_data,
                };
                let producer = room.produce(peer_id, &transport_id, params).await?;
                room.notify_new_producer(peer_id, &producer.id, producer.kind)
                    .await;
                Ok(ResponsePayload::Producer(producer))
            }
            ClientRequest::GetProducers => {
                Ok(ResponsePayload::Producers(room.get_producer_list().await))
            }
            ClientRequest::Consume {
                consumer_transport_id,
                producer_id,
                rtp_capabilities,
            } => {
                room.wait_router_ready(self.router_ready_timeout).await?;
                match room
                    .consume(peer_id, &consumer_transport_id, &producer_id, rtp_capabilities)
                    .await
                {
                    Ok(consumer) => Ok(ResponsePayload::Consumer(consumer)),
                    Err(MediaError::IncompatibleCapabilities(_)) => {
                        debug!("Peer {} cannot consume {}", peer_id, producer_id);
                        Ok(ResponsePayload::cannot_consume(producer_id))
                    }
                    Err(e) => Err(e),
                }
            }
            ClientRequest::ResumeConsumer { consumer_id } => {
                room.resume_consumer(peer_id, &consumer_id).await?;
                Ok(ResponsePayload::ack())
            }
            ClientRequest::ProducerClosed { producer_id } => {
                room.close_producer(peer_id, &producer_id).await?;
                Ok(ResponsePayload::ack())
            }
        }
    }
}
