#![forbid(unsafe_code)]

// Per-connection media bookkeeping: transports, producers and consumers owned by one peer

use crate::media::engine::{MediaConsumer, MediaProducer, MediaTransport, Subscription};
use crate::media::types::{ConsumerInfo, MediaError, MediaResult, ProduceParams, ProducerInfo, TransportInfo};
use crate::room::RoomEvent;
use mediasoup::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

struct ProducerEntry {
    producer: Box<dyn MediaProducer>,
    transport_id: String,
    _on_transport_close: Subscription,
}

struct ConsumerEntry {
    consumer: Box<dyn MediaConsumer>,
    transport_id: String,
    // Dropping the entry unregisters both observers.
    _on_producer_close: Subscription,
    _on_transport_close: Subscription,
}

/// Ids of a peer's live producers, readable without the peer's lock.
///
/// Only the owning `Peer` writes it.
#[derive(Debug, Clone, Default)]
pub struct PublishedProducers(Arc<RwLock<BTreeSet<String>>>);

impl PublishedProducers {
    pub fn ids(&self) -> Vec<String> {
        self.0
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn contains(&self, producer_id: &str) -> bool {
        self.0
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(producer_id)
    }

    fn insert(&self, producer_id: String) {
        self.0.write().unwrap_or_else(|e| e.into_inner()).insert(producer_id);
    }

    fn remove(&self, producer_id: &str) {
        self.0.write().unwrap_or_else(|e| e.into_inner()).remove(producer_id);
    }

    fn clear(&self) {
        self.0.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Media state of a single connected client.
///
/// Every producer and consumer is created through a transport registered on
/// this peer. Releasing a handle closes the engine resource. Engine-side
/// closures are reported on `events` as `RoomEvent`s.
pub struct Peer {
    id: String,
    transports: HashMap<String, Box<dyn MediaTransport>>,
    producers: HashMap<String, ProducerEntry>,
    consumers: HashMap<String, ConsumerEntry>,
    published: PublishedProducers,
    events: mpsc::UnboundedSender<RoomEvent>,
    closed: bool,
}

impl Peer {
    pub fn new(id: impl Into<String>, events: mpsc::UnboundedSender<RoomEvent>) -> Self {
        Self {
            id: id.into(),
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            published: PublishedProducers::default(),
            events,
            closed: false,
        }
    }

    /// Set once the peer has been removed from its room
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn published(&self) -> PublishedProducers {
        self.published.clone()
    }

    pub fn add_transport(&mut self, transport: Box<dyn MediaTransport>) -> TransportInfo {
        let info = transport.info();
        debug!("Peer {} registered transport {}", self.id, info.id);
        self.transports.insert(info.id.clone(), transport);
        info
    }

    pub async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> MediaResult<()> {
        self.transport(transport_id)?.connect(dtls_parameters).await
    }

    pub async fn create_producer(
        &mut self,
        transport_id: &str,
        params: ProduceParams,
    ) -> MediaResult<ProducerInfo> {
        let producer = self.transport(transport_id)?.produce(params).await?;
        let info = ProducerInfo {
            id: producer.id(),
            kind: producer.kind(),
        };

        let events = self.events.clone();
        let peer_id = self.id.clone();
        let producer_id = info.id.clone();
        let on_transport_close = producer.on_transport_close(Box::new(move || {
            let _ = events.send(RoomEvent::ProducerTransportClosed {
                peer_id,
                producer_id,
            });
        }));

        self.producers.insert(
            info.id.clone(),
            ProducerEntry {
                producer,
                transport_id: transport_id.to_string(),
                _on_transport_close: on_transport_close,
            },
        );
        self.published.insert(info.id.clone());
        Ok(info)
    }

    /// Creates a paused consumer and arranges for a `RoomEvent` to be queued
    /// when its source producer or its transport goes away.
    pub async fn create_consumer(
        &mut self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> MediaResult<ConsumerInfo> {
        let consumer = self
            .transport(transport_id)?
            .consume(producer_id, rtp_capabilities)
            .await?;
        let info = consumer.info();

        let on_producer_close = {
            let events = self.events.clone();
            let peer_id = self.id.clone();
            let consumer_id = info.id.clone();
            consumer.on_producer_close(Box::new(move || {
                let _ = events.send(RoomEvent::ProducerClosed {
                    peer_id,
                    consumer_id,
                });
            }))
        };
        let on_transport_close = {
            let events = self.events.clone();
            let peer_id = self.id.clone();
            let consumer_id = info.id.clone();
            consumer.on_transport_close(Box::new(move || {
                let _ = events.send(RoomEvent::ConsumerTransportClosed {
                    peer_id,
                    consumer_id,
                });
            }))
        };

        self.consumers.insert(
            info.id.clone(),
            ConsumerEntry {
                consumer,
                transport_id: transport_id.to_string(),
                _on_producer_close: on_producer_close,
                _on_transport_close: on_transport_close,
            },
        );
        Ok(info)
    }

    pub async fn resume_consumer(&self, consumer_id: &str) -> MediaResult<()> {
        self.consumers
            .get(consumer_id)
            .ok_or_else(|| MediaError::ConsumerNotFound(consumer_id.to_string()))?
            .consumer
            .resume()
            .await
    }

    /// Returns whether the consumer was registered
    pub fn remove_consumer(&mut self, consumer_id: &str) -> bool {
        self.consumers.remove(consumer_id).is_some()
    }

    pub fn close_producer(&mut self, producer_id: &str) -> MediaResult<()> {
        let entry = self
            .producers
            .remove(producer_id)
            .ok_or_else(|| MediaError::ProducerNotFound(producer_id.to_string()))?;
        self.published.remove(producer_id);
        debug!(
            "Peer {} closed producer {} on transport {}",
            self.id, producer_id, entry.transport_id
        );
        drop(entry.producer);
        Ok(())
    }

    pub fn producer_ids(&self) -> Vec<String> {
        self.published.ids()
    }

    pub fn consumer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.consumers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// `None` if the consumer is not registered
    pub fn consumer_paused(&self, consumer_id: &str) -> Option<bool> {
        self.consumers.get(consumer_id).map(|e| e.consumer.paused())
    }

    /// Releases consumers, then producers, then transports
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.published.clear();

        for (consumer_id, entry) in self.consumers.drain() {
            debug!(
                "Peer {} releasing consumer {} on transport {}",
                self.id, consumer_id, entry.transport_id
            );
        }
        for (producer_id, entry) in self.producers.drain() {
            debug!(
                "Peer {} releasing producer {} on transport {}",
                self.id, producer_id, entry.transport_id
            );
        }
        self.transports.clear();
    }

    fn transport(&self, transport_id: &str) -> MediaResult<&dyn MediaTransport> {
        self.transports
            .get(transport_id)
            .map(|t| t.as_ref())
            .ok_or_else(|| MediaError::TransportNotFound(transport_id.to_string()))
    }
}
