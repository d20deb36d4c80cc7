#![forbid(unsafe_code)]

// In-process loopback engine for exercising rooms and signaling without worker processes

use crate::media::config::RouterConfig;
use crate::media::engine::{
    CloseCallback, MediaConsumer, MediaEngine, MediaProducer, MediaRouter, MediaTransport,
    Subscription,
};
use crate::media::types::{MediaError, MediaResult, ProduceParams, TransportInfo};
use async_trait::async_trait;
use mediasoup::prelude::*;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Engine double. Routers are created instantly unless a gate is installed.
#[derive(Default)]
pub struct LoopbackEngine {
    gate: Option<Arc<Semaphore>>,
    fail_routers: AtomicBool,
    switches: Arc<Switches>,
    routers: Mutex<Vec<Arc<RouterShared>>>,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Router creation blocks until `open_gate` is called.
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        }
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn fail_routers(&self, fail: bool) {
        self.fail_routers.store(fail, Ordering::SeqCst);
    }

    pub fn fail_transports(&self, fail: bool) {
        self.switches.fail_transports.store(fail, Ordering::SeqCst);
    }

    pub fn fail_produce(&self, fail: bool) {
        self.switches.fail_produce.store(fail, Ordering::SeqCst);
    }

    /// Produce and consume calls park before returning until `release_media`.
    pub fn hold_media(&self) {
        if let Ok(mut gate) = self.switches.media_gate.lock() {
            *gate = Some(Arc::new(Semaphore::new(0)));
        }
    }

    pub fn release_media(&self) {
        let gate = self.switches.media_gate.lock().ok().and_then(|mut g| g.take());
        if let Some(gate) = gate {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    /// Produce and consume calls currently parked by `hold_media`
    pub fn media_waiters(&self) -> usize {
        self.switches.media_waiters.load(Ordering::SeqCst)
    }

    /// Closes every transport from the engine side, as a router or worker death would.
    /// Handles stay valid; only the transport-close observers fire.
    pub fn close_all_transports(&self) {
        let transports: Vec<Arc<Listeners>> = self
            .routers
            .lock()
            .map(|routers| {
                routers
                    .iter()
                    .filter_map(|r| r.transports.lock().ok().map(|t| t.values().cloned().collect::<Vec<_>>()))
                    .flatten()
                    .collect()
            })
            .unwrap_or_default();
        for listeners in transports {
            listeners.fire();
        }
    }

    pub fn routers_created(&self) -> usize {
        self.routers.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Routers whose handle is still held by someone
    pub fn live_routers(&self) -> usize {
        self.routers
            .lock()
            .map(|r| r.iter().filter(|s| s.alive.load(Ordering::SeqCst)).count())
            .unwrap_or(0)
    }

    pub fn live_producers(&self) -> usize {
        self.sum(|s| s.producers.lock().map(|p| p.len()).unwrap_or(0))
    }

    pub fn live_consumers(&self) -> usize {
        self.sum(|s| s.live_consumers.load(Ordering::SeqCst))
    }

    pub fn live_transports(&self) -> usize {
        self.sum(|s| s.live_transports.load(Ordering::SeqCst))
    }

    fn sum(&self, f: impl Fn(&RouterShared) -> usize) -> usize {
        self.routers
            .lock()
            .map(|r| r.iter().map(|s| f(s)).sum())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_router(&self, _config: &RouterConfig) -> MediaResult<Arc<dyn MediaRouter>> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| MediaError::EngineFailure(e.to_string()))?
                .forget();
        }
        if self.fail_routers.load(Ordering::SeqCst) {
            return Err(MediaError::EngineFailure("router creation refused".into()));
        }

        let shared = Arc::new(RouterShared {
            alive: AtomicBool::new(true),
            switches: Arc::clone(&self.switches),
            ..RouterShared::default()
        });
        if let Ok(mut routers) = self.routers.lock() {
            routers.push(Arc::clone(&shared));
        }

        Ok(Arc::new(LoopbackRouter {
            id: Uuid::new_v4().to_string(),
            shared,
        }))
    }
}

/// Fault and timing controls shared by every router of an engine
#[derive(Default)]
struct Switches {
    fail_transports: AtomicBool,
    fail_produce: AtomicBool,
    media_gate: Mutex<Option<Arc<Semaphore>>>,
    media_waiters: AtomicUsize,
}

impl Switches {
    async fn pass_media_gate(&self) -> MediaResult<()> {
        let gate = self.media_gate.lock().ok().and_then(|g| g.clone());
        let Some(gate) = gate else {
            return Ok(());
        };
        self.media_waiters.fetch_add(1, Ordering::SeqCst);
        let permit = gate.acquire().await;
        self.media_waiters.fetch_sub(1, Ordering::SeqCst);
        permit
            .map_err(|e| MediaError::EngineFailure(e.to_string()))?
            .forget();
        Ok(())
    }
}

/// Registered one-shot observers of a single engine event
#[derive(Default)]
struct Listeners {
    next: AtomicU64,
    callbacks: Mutex<HashMap<u64, CloseCallback>>,
}

impl Listeners {
    fn subscribe(self: &Arc<Self>, callback: CloseCallback) -> Subscription {
        let key = self.next.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.insert(key, callback);
        }
        Subscription::new(ListenerGuard {
            listeners: Arc::downgrade(self),
            key,
        })
    }

    fn fire(&self) {
        let callbacks: Vec<CloseCallback> = self
            .callbacks
            .lock()
            .map(|mut c| c.drain().map(|(_, cb)| cb).collect())
            .unwrap_or_default();
        for callback in callbacks {
            callback();
        }
    }
}

struct ListenerGuard {
    listeners: Weak<Listeners>,
    key: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            if let Ok(mut callbacks) = listeners.callbacks.lock() {
                callbacks.remove(&self.key);
            }
        }
    }
}

#[derive(Default)]
struct RouterShared {
    alive: AtomicBool,
    switches: Arc<Switches>,
    producers: Mutex<HashMap<String, Arc<ProducerShared>>>,
    // transport id -> transport-close observers
    transports: Mutex<HashMap<String, Arc<Listeners>>>,
    live_consumers: AtomicUsize,
    live_transports: AtomicUsize,
}

struct ProducerShared {
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    on_close: Arc<Listeners>,
}

pub struct LoopbackRouter {
    id: String,
    shared: Arc<RouterShared>,
}

impl Drop for LoopbackRouter {
    fn drop(&mut self) {
        self.shared.alive.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaRouter for LoopbackRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> RtpCapabilitiesFinalized {
        RtpCapabilitiesFinalized::default()
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool {
        let Ok(producers) = self.shared.producers.lock() else {
            return false;
        };
        let Some(producer) = producers.get(producer_id) else {
            return false;
        };
        rtp_capabilities.codecs.iter().any(|codec| {
            matches!(
                (producer.kind, codec),
                (MediaKind::Audio, RtpCodecCapability::Audio { .. })
                    | (MediaKind::Video, RtpCodecCapability::Video { .. })
            )
        })
    }

    async fn create_transport(&self) -> MediaResult<Box<dyn MediaTransport>> {
        if self.shared.switches.fail_transports.load(Ordering::SeqCst) {
            return Err(MediaError::EngineFailure("transport creation refused".into()));
        }
        let id = Uuid::new_v4().to_string();
        let on_close = Arc::new(Listeners::default());
        self.shared
            .transports
            .lock()
            .map_err(|e| MediaError::EngineFailure(e.to_string()))?
            .insert(id.clone(), Arc::clone(&on_close));
        self.shared.live_transports.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(LoopbackTransport {
            id,
            router: Arc::clone(&self.shared),
            connected: AtomicBool::new(false),
            on_close,
        }))
    }
}

pub struct LoopbackTransport {
    id: String,
    router: Arc<RouterShared>,
    connected: AtomicBool,
    on_close: Arc<Listeners>,
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        if let Ok(mut transports) = self.router.transports.lock() {
            transports.remove(&self.id);
        }
        self.router.live_transports.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn info(&self) -> TransportInfo {
        TransportInfo {
            id: self.id.clone(),
            ice_parameters: serde_json::from_value(json!({
                "usernameFragment": "loopback",
                "password": "loopback",
                "iceLite": true,
            }))
            .expect("valid ice parameters"),
            ice_candidates: Vec::new(),
            dtls_parameters: dtls_parameters(),
        }
    }

    async fn connect(&self, _dtls_parameters: DtlsParameters) -> MediaResult<()> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(MediaError::EngineFailure(format!(
                "transport {} already connected",
                self.id
            )));
        }
        Ok(())
    }

    async fn produce(&self, params: ProduceParams) -> MediaResult<Box<dyn MediaProducer>> {
        if self.router.switches.fail_produce.load(Ordering::SeqCst) {
            return Err(MediaError::EngineFailure("produce refused".into()));
        }

        let id = Uuid::new_v4().to_string();
        let shared = Arc::new(ProducerShared {
            kind: params.kind,
            rtp_parameters: params.rtp_parameters,
            on_close: Arc::new(Listeners::default()),
        });
        self.router
            .producers
            .lock()
            .map_err(|e| MediaError::EngineFailure(e.to_string()))?
            .insert(id.clone(), shared);

        // Built before the gate so an abandoned call still unregisters the producer.
        let producer = LoopbackProducer {
            id,
            kind: params.kind,
            router: Arc::clone(&self.router),
            on_transport_close: Arc::clone(&self.on_close),
        };
        self.router.switches.pass_media_gate().await?;
        Ok(Box::new(producer))
    }

    async fn consume(
        &self,
        producer_id: &str,
        _rtp_capabilities: RtpCapabilities,
    ) -> MediaResult<Box<dyn MediaConsumer>> {
        let producer = self
            .router
            .producers
            .lock()
            .map_err(|e| MediaError::EngineFailure(e.to_string()))?
            .get(producer_id)
            .cloned()
            .ok_or_else(|| MediaError::ProducerNotFound(producer_id.to_string()))?;

        self.router.live_consumers.fetch_add(1, Ordering::SeqCst);
        let consumer = LoopbackConsumer {
            id: Uuid::new_v4().to_string(),
            producer_id: producer_id.to_string(),
            kind: producer.kind,
            rtp_parameters: producer.rtp_parameters.clone(),
            paused: AtomicBool::new(true),
            on_producer_close: Arc::downgrade(&producer.on_close),
            on_transport_close: Arc::clone(&self.on_close),
            router: Arc::clone(&self.router),
        };
        drop(producer);

        self.router.switches.pass_media_gate().await?;
        Ok(Box::new(consumer))
    }
}

pub struct LoopbackProducer {
    id: String,
    kind: MediaKind,
    router: Arc<RouterShared>,
    on_transport_close: Arc<Listeners>,
}

impl MediaProducer for LoopbackProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn on_transport_close(&self, callback: CloseCallback) -> Subscription {
        self.on_transport_close.subscribe(callback)
    }
}

impl Drop for LoopbackProducer {
    fn drop(&mut self) {
        let removed = self
            .router
            .producers
            .lock()
            .ok()
            .and_then(|mut p| p.remove(&self.id));
        if let Some(producer) = removed {
            producer.on_close.fire();
        }
    }
}

pub struct LoopbackConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    on_producer_close: Weak<Listeners>,
    on_transport_close: Arc<Listeners>,
    router: Arc<RouterShared>,
}

impl Drop for LoopbackConsumer {
    fn drop(&mut self) {
        self.router.live_consumers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaConsumer for LoopbackConsumer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn producer_id(&self) -> String {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> MediaResult<()> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    // A producer that is already gone never fires.
    fn on_producer_close(&self, callback: CloseCallback) -> Subscription {
        match self.on_producer_close.upgrade() {
            Some(listeners) => listeners.subscribe(callback),
            None => Subscription::new(()),
        }
    }

    fn on_transport_close(&self, callback: CloseCallback) -> Subscription {
        self.on_transport_close.subscribe(callback)
    }
}

pub fn dtls_parameters() -> DtlsParameters {
    serde_json::from_value(json!({ "role": "auto", "fingerprints": [] }))
        .expect("valid dtls parameters")
}

/// Capabilities of a device that can receive every default codec
pub fn device_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: RouterConfig::default_codecs(),
        header_extensions: Vec::new(),
    }
}

/// Capabilities of a device that shares no codec with the router
pub fn incompatible_capabilities() -> RtpCapabilities {
    RtpCapabilities::default()
}

pub fn produce_params(kind: MediaKind) -> ProduceParams {
    ProduceParams {
        kind,
        rtp_parameters: RtpParameters::default(),
        app_data: serde_json::Value::Null,
    }
}

/// Waits until `count` produce/consume calls are parked on the media gate
pub async fn media_parked(engine: &LoopbackEngine, count: usize) {
    tokio::time::timeout(std::time::Duration::from_secs(2), async {
        while engine.media_waiters() < count {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("media call never reached the gate");
}
