#![forbid(unsafe_code)]

// Capability surface of the media engine consumed by rooms and peers.
//
// Handles are released by dropping them; the engine closes the underlying
// resource and cascades (transport -> producers/consumers, producer -> the
// consumers fed by it).

use crate::media::config::RouterConfig;
use crate::media::types::{ConsumerInfo, MediaResult, ProduceParams, TransportInfo};
use async_trait::async_trait;
use mediasoup::prelude::*;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};

/// One-shot engine notification
pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// Creates routers. One instance lives for the whole process.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_router(&self, config: &RouterConfig) -> MediaResult<Arc<dyn MediaRouter>>;
}

/// Per-room routing context.
#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn id(&self) -> String;

    /// Codecs and header extensions supported by this router
    fn rtp_capabilities(&self) -> RtpCapabilitiesFinalized;

    /// Capability-intersection check between a producer and a receiving device.
    /// Unknown producers are never consumable.
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn create_transport(&self) -> MediaResult<Box<dyn MediaTransport>>;
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> String;

    fn info(&self) -> TransportInfo;

    async fn connect(&self, dtls_parameters: DtlsParameters) -> MediaResult<()>;

    async fn produce(&self, params: ProduceParams) -> MediaResult<Box<dyn MediaProducer>>;

    /// Creates a consumer in the paused state.
    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> MediaResult<Box<dyn MediaConsumer>>;
}

pub trait MediaProducer: Send + Sync {
    fn id(&self) -> String;

    fn kind(&self) -> MediaKind;

    /// Fired if the engine closes the producer's transport underneath it
    /// (router or worker death). Not fired when the handle is dropped.
    fn on_transport_close(&self, callback: CloseCallback) -> Subscription;
}

#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> String;

    fn producer_id(&self) -> String;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    fn paused(&self) -> bool;

    /// Resuming an already flowing consumer is a no-op.
    async fn resume(&self) -> MediaResult<()>;

    /// Registers a callback fired once when the source producer closes.
    /// The callback stays registered only while the returned subscription lives.
    fn on_producer_close(&self, callback: CloseCallback) -> Subscription;

    fn on_transport_close(&self, callback: CloseCallback) -> Subscription;

    fn info(&self) -> ConsumerInfo {
        ConsumerInfo {
            id: self.id(),
            producer_id: self.producer_id(),
            kind: self.kind(),
            rtp_parameters: self.rtp_parameters(),
        }
    }
}

/// Keeps an engine event handler registered; dropping it unregisters the handler.
pub struct Subscription {
    // Mutex makes the guard Sync; it is never locked.
    _guard: Mutex<Box<dyn Any + Send>>,
}

impl Subscription {
    pub fn new<G: Any + Send>(guard: G) -> Self {
        Self {
            _guard: Mutex::new(Box::new(guard)),
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Subscription")
    }
}
