#![forbid(unsafe_code)]

// Room module - router ownership, peer registry and cross-peer notifications

pub mod manager;
pub mod peer;

pub use manager::RoomManager;
pub use peer::{Peer, PublishedProducers};

use crate::media::engine::MediaRouter;
use crate::media::types::{ConsumerInfo, MediaError, MediaResult, ProduceParams, ProducerInfo, TransportInfo};
use crate::media::MediaServer;
use crate::metrics::ServerMetrics;
use crate::signaling::protocol::ServerMessage;
use mediasoup::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock as StdRwLock;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Events raised from synchronous engine callbacks, drained by the room's event task
#[derive(Debug)]
pub enum RoomEvent {
    /// The source producer of a consumer closed
    ProducerClosed { peer_id: String, consumer_id: String },
    ConsumerTransportClosed { peer_id: String, consumer_id: String },
    ProducerTransportClosed { peer_id: String, producer_id: String },
}

/// Lifecycle of the room's router
pub enum RouterState {
    Pending,
    Ready(Arc<dyn MediaRouter>),
    Failed(String),
    Closed,
}

/// Live producers grouped by owning peer. Peers without producers are omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ProducerDirectory(BTreeMap<String, Vec<String>>);

impl ProducerDirectory {
    pub fn owner_of(&self, producer_id: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(_, producers)| producers.iter().any(|p| p == producer_id))
            .map(|(peer_id, _)| peer_id.as_str())
    }

    pub fn producer_ids(&self) -> impl Iterator<Item = &str> {
        self.0.values().flatten().map(String::as_str)
    }

    pub fn peers(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone)]
struct PeerSlot {
    sender: mpsc::Sender<Arc<String>>,
    peer: Arc<TokioMutex<Peer>>,
    published: PublishedProducers,
}

/// A named session scope with one router and the peers attached to it.
///
/// The peer map lock is only held for lookups. Each peer's engine calls run
/// under that peer's own mutex and no path holds two peer mutexes at once.
pub struct Room {
    name: String,
    router_tx: watch::Sender<RouterState>,
    peers: StdRwLock<HashMap<String, PeerSlot>>,
    events: mpsc::UnboundedSender<RoomEvent>,
    metrics: ServerMetrics,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Room {
    /// Creates the room and starts resolving its router in the background.
    pub fn new(name: impl Into<String>, media_server: &MediaServer, metrics: ServerMetrics) -> Arc<Self> {
        let name = name.into();
        let (router_tx, _) = watch::channel(RouterState::Pending);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let room = Arc::new(Self {
            name,
            router_tx,
            peers: StdRwLock::new(HashMap::new()),
            events: events_tx,
            metrics,
        });

        tokio::spawn(Self::router_task(Arc::downgrade(&room), media_server.clone()));
        tokio::spawn(Self::event_task(events_rx, Arc::downgrade(&room)));

        info!("Created room {}", room.name);
        room
    }

    async fn router_task(weak_room: Weak<Room>, media_server: MediaServer) {
        let name = match weak_room.upgrade() {
            Some(room) => room.name.clone(),
            None => return,
        };

        let state = match media_server.create_router(&name).await {
            Ok(router) => {
                info!("Router {} ready for room {}", router.id(), name);
                RouterState::Ready(router)
            }
            Err(e) => {
                warn!("Router creation failed for room {}: {}", name, e);
                RouterState::Failed(e.to_string())
            }
        };

        // A room closed while pending keeps its Closed state and the router is dropped.
        if let Some(room) = weak_room.upgrade() {
            room.router_tx.send_if_modified(|current| {
                if matches!(current, RouterState::Pending) {
                    *current = state;
                    true
                } else {
                    false
                }
            });
        }
    }

    /// Background task for engine callbacks. Exits when the room is dropped.
    async fn event_task(mut rx: mpsc::UnboundedReceiver<RoomEvent>, weak_room: Weak<Room>) {
        while let Some(event) = rx.recv().await {
            let room = match weak_room.upgrade() {
                Some(r) => r,
                None => break,
            };

            match event {
                RoomEvent::ProducerClosed {
                    peer_id,
                    consumer_id,
                } => room.handle_consumer_lost(&peer_id, &consumer_id).await,
                RoomEvent::ConsumerTransportClosed {
                    peer_id,
                    consumer_id,
                } => {
                    warn!(
                        "Transport of consumer {} (peer {}) closed by the engine",
                        consumer_id, peer_id
                    );
                    room.handle_consumer_lost(&peer_id, &consumer_id).await
                }
                RoomEvent::ProducerTransportClosed {
                    peer_id,
                    producer_id,
                } => room.handle_producer_lost(&peer_id, &producer_id).await,
            }
        }
    }

    /// Forgets a consumer the engine closed and tells its peer, once.
    async fn handle_consumer_lost(&self, peer_id: &str, consumer_id: &str) {
        let Some(slot) = self.slot(peer_id) else {
            return;
        };

        let removed = {
            let mut peer = slot.peer.lock().await;
            !peer.is_closed() && peer.remove_consumer(consumer_id)
        };
        if !removed {
            return;
        }

        debug!("Consumer {} closed, notifying peer {}", consumer_id, peer_id);
        self.send_consumer_close(peer_id, &slot.sender, consumer_id);
    }

    /// Drops a producer whose transport the engine closed. Its consumers are
    /// cleaned up through their producer-close observers.
    async fn handle_producer_lost(&self, peer_id: &str, producer_id: &str) {
        let Some(slot) = self.slot(peer_id) else {
            return;
        };

        let mut peer = slot.peer.lock().await;
        if peer.is_closed() {
            return;
        }
        if peer.close_producer(producer_id).is_ok() {
            warn!(
                "Transport of producer {} (peer {}) closed by the engine, producer removed",
                producer_id, peer_id
            );
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn slot(&self, peer_id: &str) -> Option<PeerSlot> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer_id)
            .cloned()
    }

    fn slots(&self) -> Vec<(String, PeerSlot)> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect()
    }

    /// Locks a registered, still-open peer
    async fn locked_peer(&self, peer_id: &str) -> MediaResult<OwnedMutexGuard<Peer>> {
        let slot = self
            .slot(peer_id)
            .ok_or_else(|| MediaError::PeerNotFound(peer_id.to_string()))?;
        let peer = slot.peer.lock_owned().await;
        if peer.is_closed() {
            return Err(MediaError::PeerNotFound(peer_id.to_string()));
        }
        Ok(peer)
    }

    /// Current router, failing fast if it is not resolved
    fn router(&self) -> MediaResult<Arc<dyn MediaRouter>> {
        match &*self.router_tx.borrow() {
            RouterState::Ready(router) => Ok(Arc::clone(router)),
            RouterState::Pending => Err(MediaError::RouterNotReady(self.name.clone())),
            RouterState::Failed(reason) => Err(MediaError::EngineFailure(format!(
                "router for room {} failed: {}",
                self.name, reason
            ))),
            RouterState::Closed => Err(MediaError::RoomNotFound(self.name.clone())),
        }
    }

    /// Waits up to `timeout` for the router to leave the pending state.
    pub async fn wait_router_ready(&self, timeout: Duration) -> MediaResult<()> {
        let mut rx = self.router_tx.subscribe();
        let settled = tokio::time::timeout(timeout, async move {
            rx.wait_for(|state| !matches!(state, RouterState::Pending))
                .await
                .map(|_| ())
        })
        .await;

        match settled {
            Ok(Ok(())) => self.router().map(|_| ()),
            Ok(Err(_)) => Err(MediaError::RoomNotFound(self.name.clone())),
            Err(_) => Err(MediaError::RouterNotReady(self.name.clone())),
        }
    }

    pub fn rtp_capabilities(&self) -> MediaResult<RtpCapabilitiesFinalized> {
        Ok(self.router()?.rtp_capabilities())
    }

    /// Registers a peer. An id already present is rejected rather than replaced.
    pub fn add_peer(&self, peer_id: &str, sender: mpsc::Sender<Arc<String>>) -> MediaResult<()> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if peers.contains_key(peer_id) {
            return Err(MediaError::DuplicatePeer(peer_id.to_string()));
        }
        let peer = Peer::new(peer_id, self.events.clone());
        peers.insert(
            peer_id.to_string(),
            PeerSlot {
                sender,
                published: peer.published(),
                peer: Arc::new(TokioMutex::new(peer)),
            },
        );
        info!("Peer {} joined room {}", peer_id, self.name);
        Ok(())
    }

    /// Releases every handle held by the peer and forgets it.
    pub async fn remove_peer(&self, peer_id: &str) -> MediaResult<()> {
        let slot = self
            .peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer_id)
            .ok_or_else(|| MediaError::PeerNotFound(peer_id.to_string()))?;

        slot.peer.lock().await.close();
        info!("Peer {} left room {}", peer_id, self.name);
        Ok(())
    }

    pub async fn create_transport(&self, peer_id: &str) -> MediaResult<TransportInfo> {
        let router = self.router()?;
        let mut peer = self.locked_peer(peer_id).await?;
        let transport = router.create_transport().await.map_err(|e| {
            warn!("Transport creation failed for peer {}: {}", peer_id, e);
            e
        })?;
        Ok(peer.add_transport(transport))
    }

    pub async fn connect_peer_transport(
        &self,
        peer_id: &str,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> MediaResult<()> {
        let peer = self.locked_peer(peer_id).await?;
        peer.connect_transport(transport_id, dtls_parameters).await
    }

    pub async fn produce(
        &self,
        peer_id: &str,
        transport_id: &str,
        params: ProduceParams,
    ) -> MediaResult<ProducerInfo> {
        let mut peer = self.locked_peer(peer_id).await?;
        let info = peer.create_producer(transport_id, params).await.map_err(|e| {
            warn!("Produce failed for peer {}: {}", peer_id, e);
            e
        })?;
        self.metrics.inc_producers_created();
        info!(
            "Peer {} producing {:?} as {} in room {}",
            peer_id, info.kind, info.id, self.name
        );
        Ok(info)
    }

    /// Subscribes `peer_id` to `producer_id` through one of its own transports.
    ///
    /// The consumer is created paused. If the source producer closes before the
    /// consumer is registered the consumer is released and `ProducerNotFound`
    /// is returned.
    pub async fn consume(
        &self,
        peer_id: &str,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> MediaResult<ConsumerInfo> {
        let router = self.router()?;
        if self.producer_owner(producer_id).is_none() {
            return Err(MediaError::ProducerNotFound(producer_id.to_string()));
        }
        if !router.can_consume(producer_id, &rtp_capabilities) {
            return Err(MediaError::IncompatibleCapabilities(producer_id.to_string()));
        }

        let info = {
            let mut peer = self.locked_peer(peer_id).await?;
            peer.create_consumer(transport_id, producer_id, rtp_capabilities)
                .await
                .map_err(|e| {
                    warn!("Consume failed for peer {}: {}", peer_id, e);
                    e
                })?
        };

        if self.producer_owner(producer_id).is_none() {
            if let Ok(mut peer) = self.locked_peer(peer_id).await {
                peer.remove_consumer(&info.id);
            }
            debug!(
                "Producer {} closed while consumer {} was being created",
                producer_id, info.id
            );
            return Err(MediaError::ProducerNotFound(producer_id.to_string()));
        }

        self.metrics.inc_consumers_created();
        debug!(
            "Peer {} consuming producer {} as {}",
            peer_id, producer_id, info.id
        );
        Ok(info)
    }

    pub async fn resume_consumer(&self, peer_id: &str, consumer_id: &str) -> MediaResult<()> {
        let peer = self.locked_peer(peer_id).await?;
        peer.resume_consumer(consumer_id).await
    }

    /// Releases a producer. Consumers fed by it are cleaned up by their observers.
    pub async fn close_producer(&self, peer_id: &str, producer_id: &str) -> MediaResult<()> {
        let mut peer = self.locked_peer(peer_id).await?;
        peer.close_producer(producer_id)?;
        info!(
            "Peer {} closed producer {} in room {}",
            peer_id, producer_id, self.name
        );
        Ok(())
    }

    /// Builds the directory from current peer state.
    ///
    /// Reads each peer's published snapshot, so it never waits on a peer
    /// that is busy in an engine call.
    pub async fn get_producer_list(&self) -> ProducerDirectory {
        let directory = self
            .slots()
            .into_iter()
            .filter_map(|(peer_id, slot)| {
                let producers = slot.published.ids();
                (!producers.is_empty()).then_some((peer_id, producers))
            })
            .collect();
        ProducerDirectory(directory)
    }

    fn producer_owner(&self, producer_id: &str) -> Option<String> {
        self.slots()
            .into_iter()
            .find(|(_, slot)| slot.published.contains(producer_id))
            .map(|(peer_id, _)| peer_id)
    }

    /// Announces a producer to every other peer, if it is still live.
    /// Returns the number of peers the announcement was queued for.
    pub async fn notify_new_producer(
        &self,
        peer_id: &str,
        producer_id: &str,
        kind: MediaKind,
    ) -> usize {
        let live = self
            .slot(peer_id)
            .is_some_and(|slot| slot.published.contains(producer_id));
        if !live {
            debug!(
                "Skipping new-producer for {}: closed before announcement",
                producer_id
            );
            return 0;
        }

        self.broadcast_except(
            peer_id,
            &ServerMessage::NewProducer {
                peer_id: peer_id.to_string(),
                producer_id: producer_id.to_string(),
                kind,
            },
        )
    }

    /// Broadcast a message to all peers except the sender
    fn broadcast_except(&self, sender_id: &str, message: &ServerMessage) -> usize {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return 0;
            }
        };

        let mut queued = 0;
        for (id, slot) in self.slots() {
            if id == sender_id {
                continue;
            }
            match slot.sender.try_send(json.clone()) {
                Ok(()) => queued += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Channel full for peer {} in room {}, dropping message", id, self.name);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Channel closed for peer {} in room {} (disconnected)", id, self.name);
                }
            }
        }
        queued
    }

    /// Sends `consumer-close` from a detached task that waits for channel capacity.
    /// Only a disconnected peer loses the notice.
    fn send_consumer_close(&self, peer_id: &str, sender: &mpsc::Sender<Arc<String>>, consumer_id: &str) {
        let message = ServerMessage::ConsumerClose {
            consumer_id: consumer_id.to_string(),
        };
        let json = match serde_json::to_string(&message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize message for peer {}: {}", peer_id, e);
                return;
            }
        };

        let sender = sender.clone();
        let metrics = self.metrics.clone();
        let peer_id = peer_id.to_string();
        let room_name = self.name.clone();
        tokio::spawn(async move {
            if sender.send(json).await.is_err() {
                debug!("Channel closed for peer {} in room {} (disconnected)", peer_id, room_name);
                return;
            }
            metrics.inc_consumer_close_notifications();
        });
    }

    /// Releases every peer and the router
    pub async fn close(&self) {
        self.router_tx.send_replace(RouterState::Closed);

        let slots: Vec<PeerSlot> = self
            .peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        for slot in slots {
            slot.peer.lock().await.close();
        }
        info!("Closed room {}", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::config::MediaConfig;
    use crate::media::testing::{self, LoopbackEngine};
    use serde_json::Value;

    const WAIT: Duration = Duration::from_secs(2);

    struct Fixture {
        engine: Arc<LoopbackEngine>,
        room: Arc<Room>,
        metrics: ServerMetrics,
    }

    async fn fixture_with(engine: LoopbackEngine) -> Fixture {
        let engine = Arc::new(engine);
        let media = MediaServer::with_engine(engine.clone(), MediaConfig::default());
        let metrics = ServerMetrics::new();
        let room = Room::new("Test_Room", &media, metrics.clone());
        Fixture {
            engine,
            room,
            metrics,
        }
    }

    async fn fixture() -> Fixture {
        let fixture = fixture_with(LoopbackEngine::new()).await;
        fixture.room.wait_router_ready(WAIT).await.unwrap();
        fixture
    }

    fn join(room: &Room, peer_id: &str) -> mpsc::Receiver<Arc<String>> {
        let (tx, rx) = mpsc::channel(64);
        room.add_peer(peer_id, tx).unwrap();
        rx
    }

    async fn publish(room: &Room, peer_id: &str, kind: MediaKind) -> String {
        let transport = room.create_transport(peer_id).await.unwrap();
        room.produce(peer_id, &transport.id, testing::produce_params(kind))
            .await
            .unwrap()
            .id
    }

    async fn subscribe(room: &Room, peer_id: &str, producer_id: &str) -> ConsumerInfo {
        let transport = room.create_transport(peer_id).await.unwrap();
        room.consume(peer_id, &transport.id, producer_id, testing::device_capabilities())
            .await
            .unwrap()
    }

    async fn next_message(rx: &mut mpsc::Receiver<Arc<String>>) -> Value {
        let json = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed");
        serde_json::from_str(&json).unwrap()
    }

    async fn consumer_ids(room: &Room, peer_id: &str) -> Vec<String> {
        let slot = room.slot(peer_id).unwrap();
        let peer = slot.peer.lock().await;
        peer.consumer_ids()
    }

    async fn consumer_paused(room: &Room, peer_id: &str, consumer_id: &str) -> Option<bool> {
        let slot = room.slot(peer_id).unwrap();
        let peer = slot.peer.lock().await;
        peer.consumer_paused(consumer_id)
    }

    #[tokio::test]
    async fn operations_before_router_ready_fail_with_router_not_ready() {
        let f = fixture_with(LoopbackEngine::gated()).await;
        let _rx = join(&f.room, "a");

        let err = f.room.create_transport("a").await.unwrap_err();
        assert_eq!(err, MediaError::RouterNotReady("Test_Room".into()));
        assert!(err.is_retryable());
        assert!(matches!(
            f.room.rtp_capabilities(),
            Err(MediaError::RouterNotReady(_))
        ));
        let err = f
            .room
            .consume("a", "t", "p", testing::device_capabilities())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "router-not-ready");
        assert_eq!(
            f.room.wait_router_ready(Duration::from_millis(20)).await,
            Err(MediaError::RouterNotReady("Test_Room".into()))
        );

        f.engine.open_gate();
        f.room.wait_router_ready(WAIT).await.unwrap();
        assert!(f.room.create_transport("a").await.is_ok());
    }

    #[tokio::test]
    async fn failed_router_is_reported_as_engine_failure() {
        let engine = LoopbackEngine::new();
        engine.fail_routers(true);
        let f = fixture_with(engine).await;

        let err = f.room.wait_router_ready(WAIT).await.unwrap_err();
        assert_eq!(err.code(), "engine-failure");
    }

    #[tokio::test]
    async fn duplicate_peer_is_rejected() {
        let f = fixture().await;
        let _rx = join(&f.room, "a");
        let (tx, _rx2) = mpsc::channel(1);
        assert_eq!(
            f.room.add_peer("a", tx),
            Err(MediaError::DuplicatePeer("a".into()))
        );
        assert_eq!(f.room.peer_count(), 1);
    }

    #[tokio::test]
    async fn unknown_peer_and_transport_errors() {
        let f = fixture().await;
        let _rx = join(&f.room, "a");

        assert_eq!(
            f.room.create_transport("ghost").await.unwrap_err(),
            MediaError::PeerNotFound("ghost".into())
        );
        assert_eq!(
            f.room
                .connect_peer_transport("a", "nope", testing::dtls_parameters())
                .await
                .unwrap_err(),
            MediaError::TransportNotFound("nope".into())
        );
        assert_eq!(
            f.room
                .produce("a", "nope", testing::produce_params(MediaKind::Audio))
                .await
                .unwrap_err(),
            MediaError::TransportNotFound("nope".into())
        );
    }

    #[tokio::test]
    async fn transport_of_another_peer_cannot_be_used() {
        let f = fixture().await;
        let _a = join(&f.room, "a");
        let _b = join(&f.room, "b");

        let transport = f.room.create_transport("a").await.unwrap();
        let err = f
            .room
            .produce("b", &transport.id, testing::produce_params(MediaKind::Video))
            .await
            .unwrap_err();
        assert_eq!(err, MediaError::TransportNotFound(transport.id));
    }

    #[tokio::test]
    async fn directory_tracks_interleaved_joins_publishes_and_leaves() {
        let f = fixture().await;
        let _a = join(&f.room, "a");
        let _b = join(&f.room, "b");
        let _c = join(&f.room, "c");

        assert!(f.room.get_producer_list().await.is_empty());

        let a_video = publish(&f.room, "a", MediaKind::Video).await;
        let b_audio = publish(&f.room, "b", MediaKind::Audio).await;
        let a_audio = publish(&f.room, "a", MediaKind::Audio).await;

        let directory = f.room.get_producer_list().await;
        assert_eq!(directory.owner_of(&a_video), Some("a"));
        assert_eq!(directory.owner_of(&a_audio), Some("a"));
        assert_eq!(directory.owner_of(&b_audio), Some("b"));
        assert_eq!(directory.peers().count(), 2);

        f.room.remove_peer("b").await.unwrap();
        f.room.close_producer("a", &a_video).await.unwrap();

        let directory = f.room.get_producer_list().await;
        let ids: Vec<&str> = directory.producer_ids().collect();
        assert_eq!(ids, vec![a_audio.as_str()]);
        assert_eq!(directory.owner_of(&b_audio), None);

        let value = serde_json::to_value(&directory).unwrap();
        assert_eq!(value, serde_json::json!({ "a": [a_audio] }));
    }

    #[tokio::test]
    async fn consume_requires_compatible_capabilities() {
        let f = fixture().await;
        let _a = join(&f.room, "a");
        let _b = join(&f.room, "b");
        let producer = publish(&f.room, "a", MediaKind::Video).await;
        let transport = f.room.create_transport("b").await.unwrap();

        let err = f
            .room
            .consume("b", &transport.id, &producer, testing::incompatible_capabilities())
            .await
            .unwrap_err();
        assert_eq!(err, MediaError::IncompatibleCapabilities(producer.clone()));
        assert!(consumer_ids(&f.room, "b").await.is_empty());

        let err = f
            .room
            .consume("b", &transport.id, "missing", testing::device_capabilities())
            .await
            .unwrap_err();
        assert_eq!(err, MediaError::ProducerNotFound("missing".into()));
        assert_eq!(f.engine.live_consumers(), 0);
    }

    #[tokio::test]
    async fn consumer_is_created_paused_and_resume_is_idempotent() {
        let f = fixture().await;
        let _a = join(&f.room, "a");
        let _b = join(&f.room, "b");
        let producer = publish(&f.room, "a", MediaKind::Audio).await;
        let consumer = subscribe(&f.room, "b", &producer).await;

        assert_eq!(consumer.producer_id, producer);
        assert_eq!(consumer.kind, MediaKind::Audio);

        assert_eq!(consumer_paused(&f.room, "b", &consumer.id).await, Some(true));

        f.room.resume_consumer("b", &consumer.id).await.unwrap();
        f.room.resume_consumer("b", &consumer.id).await.unwrap();
        assert_eq!(consumer_paused(&f.room, "b", &consumer.id).await, Some(false));

        assert_eq!(
            f.room.resume_consumer("b", "unknown").await,
            Err(MediaError::ConsumerNotFound("unknown".into()))
        );
    }

    #[tokio::test]
    async fn closing_producer_notifies_exactly_its_consumers() {
        let f = fixture().await;
        let mut a = join(&f.room, "a");
        let mut viewers = Vec::new();
        let producer = publish(&f.room, "a", MediaKind::Video).await;

        for peer_id in ["b", "c", "d"] {
            let rx = join(&f.room, peer_id);
            let consumer = subscribe(&f.room, peer_id, &producer).await;
            viewers.push((peer_id, rx, consumer.id));
        }
        let mut bystander = join(&f.room, "e");

        f.room.close_producer("a", &producer).await.unwrap();

        for (peer_id, rx, consumer_id) in viewers.iter_mut() {
            let message = next_message(rx).await;
            assert_eq!(message["type"], "consumer-close");
            assert_eq!(message["consumerId"], consumer_id.as_str());
            assert!(consumer_ids(&f.room, *peer_id).await.is_empty());
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.try_recv().is_err());
        assert!(bystander.try_recv().is_err());
        assert_eq!(f.metrics.consumer_close_notifications_total(), 3);
        assert_eq!(f.engine.live_consumers(), 0);
    }

    #[tokio::test]
    async fn remove_peer_twice_reports_peer_not_found() {
        let f = fixture().await;
        let _a = join(&f.room, "a");
        let mut b = join(&f.room, "b");
        publish(&f.room, "a", MediaKind::Audio).await;
        let other = publish(&f.room, "b", MediaKind::Audio).await;

        f.room.remove_peer("a").await.unwrap();
        let before = f.room.get_producer_list().await;

        assert_eq!(
            f.room.remove_peer("a").await,
            Err(MediaError::PeerNotFound("a".into()))
        );
        assert_eq!(f.room.get_producer_list().await, before);
        assert_eq!(before.owner_of(&other), Some("b"));
        assert_eq!(f.room.peer_count(), 1);
        assert!(b.try_recv().is_err());
    }

    #[tokio::test]
    async fn removing_publisher_closes_remote_consumers() {
        let f = fixture().await;
        let _a = join(&f.room, "a");
        let mut b = join(&f.room, "b");
        let producer = publish(&f.room, "a", MediaKind::Video).await;
        let consumer = subscribe(&f.room, "b", &producer).await;

        f.room.remove_peer("a").await.unwrap();

        let message = next_message(&mut b).await;
        assert_eq!(message["type"], "consumer-close");
        assert_eq!(message["consumerId"], consumer.id.as_str());
        assert_eq!(f.engine.live_transports(), 1);
    }

    #[tokio::test]
    async fn new_producer_is_announced_to_other_peers_only() {
        let f = fixture().await;
        let mut a = join(&f.room, "a");
        let mut b = join(&f.room, "b");
        let producer = publish(&f.room, "a", MediaKind::Video).await;

        assert_eq!(f.room.notify_new_producer("a", &producer, MediaKind::Video).await, 1);
        let message = next_message(&mut b).await;
        assert_eq!(message["type"], "new-producer");
        assert_eq!(message["peerId"], "a");
        assert_eq!(message["producerId"], producer.as_str());
        assert!(a.try_recv().is_err());

        f.room.close_producer("a", &producer).await.unwrap();
        assert_eq!(f.room.notify_new_producer("a", &producer, MediaKind::Video).await, 0);
    }

    #[tokio::test]
    async fn operations_on_removed_peer_fail() {
        let f = fixture().await;
        let _a = join(&f.room, "a");
        let transport = f.room.create_transport("a").await.unwrap();
        f.room.remove_peer("a").await.unwrap();

        let err = f
            .room
            .produce("a", &transport.id, testing::produce_params(MediaKind::Audio))
            .await
            .unwrap_err();
        assert_eq!(err, MediaError::PeerNotFound("a".into()));
        assert_eq!(f.engine.live_transports(), 0);
    }

    #[tokio::test]
    async fn close_releases_router_and_peers() {
        let f = fixture().await;
        let _a = join(&f.room, "a");
        publish(&f.room, "a", MediaKind::Audio).await;

        f.room.close().await;
        assert_eq!(f.room.peer_count(), 0);
        assert_eq!(f.engine.live_producers(), 0);
        assert_eq!(f.engine.live_routers(), 0);
        assert_eq!(
            f.room.create_transport("a").await.unwrap_err(),
            MediaError::RoomNotFound("Test_Room".into())
        );
    }

    #[tokio::test]
    async fn stalled_peer_does_not_hold_back_other_notices() {
        let f = fixture().await;
        let _a = join(&f.room, "a");
        let first = publish(&f.room, "a", MediaKind::Video).await;
        let second = publish(&f.room, "a", MediaKind::Audio).await;

        let (tx, mut stalled) = mpsc::channel(1);
        f.room.add_peer("b", tx.clone()).unwrap();
        tx.try_send(Arc::new("unread".to_string())).unwrap();
        let mut healthy = join(&f.room, "c");

        let stalled_consumer = subscribe(&f.room, "b", &first).await;
        let healthy_consumer = subscribe(&f.room, "c", &second).await;

        f.room.close_producer("a", &first).await.unwrap();
        f.room.close_producer("a", &second).await.unwrap();

        let message = next_message(&mut healthy).await;
        assert_eq!(message["type"], "consumer-close");
        assert_eq!(message["consumerId"], healthy_consumer.id.as_str());
        assert!(consumer_ids(&f.room, "b").await.is_empty());
        assert!(consumer_ids(&f.room, "c").await.is_empty());

        assert_eq!(stalled.recv().await.unwrap().as_str(), "unread");
        let message = next_message(&mut stalled).await;
        assert_eq!(message["consumerId"], stalled_consumer.id.as_str());
    }

    #[tokio::test]
    async fn engine_closing_transports_clears_stale_entries() {
        let f = fixture().await;
        let _a = join(&f.room, "a");
        let mut b = join(&f.room, "b");
        let producer = publish(&f.room, "a", MediaKind::Video).await;
        let consumer = subscribe(&f.room, "b", &producer).await;

        f.engine.close_all_transports();

        let message = next_message(&mut b).await;
        assert_eq!(message["type"], "consumer-close");
        assert_eq!(message["consumerId"], consumer.id.as_str());

        tokio::time::timeout(WAIT, async {
            while !f.room.get_producer_list().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stale producer left in directory");
        assert!(consumer_ids(&f.room, "b").await.is_empty());
        assert_eq!(f.engine.live_producers(), 0);
        assert_eq!(f.engine.live_consumers(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b.try_recv().is_err());
    }

    #[tokio::test]
    async fn remove_peer_during_produce_leaves_no_producer() {
        let f = fixture().await;
        let _a = join(&f.room, "a");
        let mut b = join(&f.room, "b");
        let transport = f.room.create_transport("a").await.unwrap();

        f.engine.hold_media();
        let producing = tokio::spawn({
            let room = Arc::clone(&f.room);
            async move {
                room.produce("a", &transport.id, testing::produce_params(MediaKind::Video))
                    .await
            }
        });
        testing::media_parked(&f.engine, 1).await;

        let removing = tokio::spawn({
            let room = Arc::clone(&f.room);
            async move { room.remove_peer("a").await }
        });
        while f.room.peer_count() != 1 {
            tokio::task::yield_now().await;
        }
        f.engine.release_media();

        removing.await.unwrap().unwrap();
        if let Ok(producer) = producing.await.unwrap() {
            assert_eq!(
                f.room.notify_new_producer("a", &producer.id, producer.kind).await,
                0
            );
        }

        assert!(f.room.get_producer_list().await.is_empty());
        assert_eq!(f.engine.live_producers(), 0);
        assert!(b.try_recv().is_err());
    }

    #[tokio::test]
    async fn producer_closed_during_consume_is_rolled_back() {
        let f = fixture().await;
        let _a = join(&f.room, "a");
        let mut b = join(&f.room, "b");
        let producer = publish(&f.room, "a", MediaKind::Audio).await;
        let transport = f.room.create_transport("b").await.unwrap();

        f.engine.hold_media();
        let consuming = tokio::spawn({
            let room = Arc::clone(&f.room);
            let producer = producer.clone();
            async move {
                room.consume("b", &transport.id, &producer, testing::device_capabilities())
                    .await
            }
        });
        testing::media_parked(&f.engine, 1).await;

        f.room.close_producer("a", &producer).await.unwrap();
        f.engine.release_media();

        let err = consuming.await.unwrap().unwrap_err();
        assert_eq!(err, MediaError::ProducerNotFound(producer));
        assert!(consumer_ids(&f.room, "b").await.is_empty());
        assert_eq!(f.engine.live_consumers(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b.try_recv().is_err());
    }

    #[tokio::test]
    async fn directory_does_not_wait_for_busy_peer() {
        let f = fixture().await;
        let _a = join(&f.room, "a");
        let _b = join(&f.room, "b");
        let producer = publish(&f.room, "a", MediaKind::Video).await;
        let transport = f.room.create_transport("b").await.unwrap();

        f.engine.hold_media();
        let busy = tokio::spawn({
            let room = Arc::clone(&f.room);
            async move {
                room.produce("b", &transport.id, testing::produce_params(MediaKind::Audio))
                    .await
            }
        });
        testing::media_parked(&f.engine, 1).await;

        let directory = tokio::time::timeout(Duration::from_millis(200), f.room.get_producer_list())
            .await
            .expect("directory query blocked behind a busy peer");
        assert_eq!(directory.owner_of(&producer), Some("a"));
        assert_eq!(directory.peers().count(), 1);

        f.engine.release_media();
        busy.await.unwrap().unwrap();
        assert_eq!(f.room.get_producer_list().await.peers().count(), 2);
    }

    #[tokio::test]
    async fn failed_produce_publishes_nothing() {
        let f = fixture().await;
        let _a = join(&f.room, "a");
        let mut b = join(&f.room, "b");
        let transport = f.room.create_transport("a").await.unwrap();

        f.engine.fail_produce(true);
        let err = f
            .room
            .produce("a", &transport.id, testing::produce_params(MediaKind::Video))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "engine-failure");
        assert!(err.is_retryable());
        assert!(f.room.get_producer_list().await.is_empty());
        assert_eq!(f.engine.live_producers(), 0);
        assert!(b.try_recv().is_err());
    }
}
