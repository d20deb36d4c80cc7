#![forbid(unsafe_code)]

// mediasoup-backed implementations of the engine capability traits

use crate::media::config::WebRtcTransportConfig;
use crate::media::engine::{
    CloseCallback, MediaConsumer, MediaProducer, MediaRouter, MediaTransport, Subscription,
};
use crate::media::types::{MediaError, MediaResult, ProduceParams, TransportInfo};
use async_trait::async_trait;
use mediasoup::prelude::*;
use tracing::{debug, info, warn};

pub struct MediasoupRouter {
    router: Router,
    transport_config: WebRtcTransportConfig,
}

impl MediasoupRouter {
    pub fn new(router: Router, transport_config: WebRtcTransportConfig) -> Self {
        Self {
            router,
            transport_config,
        }
    }
}

#[async_trait]
impl MediaRouter for MediasoupRouter {
    fn id(&self) -> String {
        self.router.id().to_string()
    }

    fn rtp_capabilities(&self) -> RtpCapabilitiesFinalized {
        self.router.rtp_capabilities().clone()
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool {
        match producer_id.parse::<ProducerId>() {
            Ok(id) => self.router.can_consume(&id, rtp_capabilities),
            Err(_) => false,
        }
    }

    async fn create_transport(&self) -> MediaResult<Box<dyn MediaTransport>> {
        let transport = self
            .router
            .create_webrtc_transport(self.transport_config.to_transport_options())
            .await
            .map_err(|e| MediaError::EngineFailure(format!("Failed to create transport: {e}")))?;

        setup_transport_handlers(&transport);
        Ok(Box::new(MediasoupTransport { transport }))
    }
}

pub struct MediasoupTransport {
    transport: WebRtcTransport,
}

#[async_trait]
impl MediaTransport for MediasoupTransport {
    fn id(&self) -> String {
        self.transport.id().to_string()
    }

    fn info(&self) -> TransportInfo {
        TransportInfo::from(&self.transport)
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> MediaResult<()> {
        self.transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| MediaError::EngineFailure(format!("Failed to connect transport: {e}")))
    }

    async fn produce(&self, params: ProduceParams) -> MediaResult<Box<dyn MediaProducer>> {
        let mut options = ProducerOptions::new(params.kind, params.rtp_parameters);
        options.app_data = AppData::new(params.app_data);

        let producer = self
            .transport
            .produce(options)
            .await
            .map_err(|e| MediaError::EngineFailure(format!("Failed to create producer: {e}")))?;

        setup_producer_handlers(&producer);
        Ok(Box::new(MediasoupProducer { producer }))
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> MediaResult<Box<dyn MediaConsumer>> {
        let producer_id: ProducerId = producer_id
            .parse()
            .map_err(|_| MediaError::ProducerNotFound(producer_id.to_string()))?;

        let mut options = ConsumerOptions::new(producer_id, rtp_capabilities);
        options.paused = true;

        let consumer = self
            .transport
            .consume(options)
            .await
            .map_err(|e| MediaError::EngineFailure(format!("Failed to create consumer: {e}")))?;

        setup_consumer_handlers(&consumer);
        Ok(Box::new(MediasoupConsumer { consumer }))
    }
}

pub struct MediasoupProducer {
    producer: Producer,
}

impl MediaProducer for MediasoupProducer {
    fn id(&self) -> String {
        self.producer.id().to_string()
    }

    fn kind(&self) -> MediaKind {
        self.producer.kind()
    }

    fn on_transport_close(&self, callback: CloseCallback) -> Subscription {
        Subscription::new(self.producer.on_transport_close(callback))
    }
}

pub struct MediasoupConsumer {
    consumer: Consumer,
}

#[async_trait]
impl MediaConsumer for MediasoupConsumer {
    fn id(&self) -> String {
        self.consumer.id().to_string()
    }

    fn producer_id(&self) -> String {
        self.consumer.producer_id().to_string()
    }

    fn kind(&self) -> MediaKind {
        self.consumer.kind()
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.consumer.rtp_parameters().clone()
    }

    fn paused(&self) -> bool {
        self.consumer.paused()
    }

    async fn resume(&self) -> MediaResult<()> {
        self.consumer
            .resume()
            .await
            .map_err(|e| MediaError::EngineFailure(format!("Failed to resume consumer: {e}")))
    }

    fn on_producer_close(&self, callback: CloseCallback) -> Subscription {
        Subscription::new(self.consumer.on_producer_close(callback))
    }

    fn on_transport_close(&self, callback: CloseCallback) -> Subscription {
        Subscription::new(self.consumer.on_transport_close(callback))
    }
}

// Diagnostic handlers are detached so they persist for the resource's lifetime.

fn setup_transport_handlers(transport: &WebRtcTransport) {
    let transport_id = transport.id().to_string();

    transport
        .on_close({
            let transport_id = transport_id.clone();
            Box::new(move || {
                debug!("Transport {} closed", transport_id);
            })
        })
        .detach();

    transport
        .on_dtls_state_change({
            let transport_id = transport_id.clone();
            move |dtls_state| {
                info!("DTLS state: {:?} for transport {}", dtls_state, transport_id);
            }
        })
        .detach();

    transport
        .on_ice_state_change(move |ice_state| {
            debug!("ICE state: {:?} for transport {}", ice_state, transport_id);
        })
        .detach();
}

fn setup_producer_handlers(producer: &Producer) {
    let producer_id = producer.id().to_string();

    producer
        .on_transport_close({
            let producer_id = producer_id.clone();
            move || {
                warn!("Transport closed underneath producer {}", producer_id);
            }
        })
        .detach();

    producer
        .on_close(move || {
            debug!("Producer {} closed", producer_id);
        })
        .detach();
}

fn setup_consumer_handlers(consumer: &Consumer) {
    let consumer_id = consumer.id().to_string();

    consumer
        .on_close(move || {
            debug!("Consumer {} closed", consumer_id);
        })
        .detach();
}
