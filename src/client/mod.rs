#![forbid(unsafe_code)]

// Client session state machine: the canonical publish/subscribe flow against the signaling server.
//
// The session performs no I/O. Feed it server frames with `handle_text` or
// `on_message` and send the request envelopes it returns.

use crate::media::types::{ConsumerInfo, ProducerInfo, TransportInfo};
use crate::signaling::protocol::{ClientRequest, ErrorBody, RequestEnvelope};
use mediasoup::prelude::*;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use thiserror::Error;
use tracing::{debug, warn};

/// Retryable server errors are re-issued at most this many times per request.
const MAX_RETRIES: u32 = 3;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Invalid in state {state:?}: {action}")]
    InvalidState {
        state: SessionState,
        action: &'static str,
    },

    #[error("Reply to unknown request {0}")]
    UnexpectedReply(u64),

    #[error("Server error {}: {}", .0.code, .0.message)]
    Server(ErrorBody),

    #[error("Malformed server message: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    CapabilitiesLoaded,
    Active { publishing: bool, subscribing: bool },
    Closed,
}

/// Server frames as seen by a client
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Welcome { peer_id: String, room: String },
    Response { id: u64, result: serde_json::Value },
    Error { id: Option<u64>, error: ErrorBody },
    #[serde(rename_all = "camelCase")]
    NewProducer {
        peer_id: String,
        producer_id: String,
        kind: MediaKind,
    },
    #[serde(rename_all = "camelCase")]
    ConsumerClose { consumer_id: String },
}

/// Local media endpoint parameters
#[derive(Debug, Clone)]
pub struct ClientDevice {
    pub rtp_capabilities: RtpCapabilities,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Send,
    Recv,
}

#[derive(Debug, Default)]
struct TransportSlot {
    id: Option<String>,
    requested: bool,
    connected: bool,
}

#[derive(Debug)]
struct Pending {
    request: ClientRequest,
    retries: u32,
}

pub struct ClientSession {
    device: ClientDevice,
    state: SessionState,
    peer_id: Option<String>,
    room: Option<String>,
    router_capabilities: Option<serde_json::Value>,
    next_id: u64,
    pending: HashMap<u64, Pending>,
    send_transport: TransportSlot,
    recv_transport: TransportSlot,
    queued_tracks: VecDeque<(MediaKind, RtpParameters)>,
    queued_subscriptions: VecDeque<String>,
    requested_subscriptions: HashSet<String>,
    producers: BTreeMap<String, MediaKind>,
    consumers: BTreeMap<String, ConsumerInfo>,
    errors: Vec<ErrorBody>,
}

impl ClientSession {
    pub fn new(device: ClientDevice) -> Self {
        Self {
            device,
            state: SessionState::Idle,
            peer_id: None,
            room: None,
            router_capabilities: None,
            next_id: 0,
            pending: HashMap::new(),
            send_transport: TransportSlot::default(),
            recv_transport: TransportSlot::default(),
            queued_tracks: VecDeque::new(),
            queued_subscriptions: VecDeque::new(),
            requested_subscriptions: HashSet::new(),
            producers: BTreeMap::new(),
            consumers: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    pub fn router_capabilities(&self) -> Option<&serde_json::Value> {
        self.router_capabilities.as_ref()
    }

    /// Own live producers
    pub fn producers(&self) -> impl Iterator<Item = (&str, MediaKind)> {
        self.producers.iter().map(|(id, kind)| (id.as_str(), *kind))
    }

    /// Live consumers keyed by consumer id
    pub fn consumers(&self) -> &BTreeMap<String, ConsumerInfo> {
        &self.consumers
    }

    /// Non-retryable errors reported by the server
    pub fn errors(&self) -> &[ErrorBody] {
        &self.errors
    }

    pub fn has_pending_requests(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Begins the flow by asking for router capabilities
    pub fn start(&mut self) -> ClientResult<Vec<RequestEnvelope>> {
        if self.state != SessionState::Idle {
            return Err(self.invalid("start"));
        }
        Ok(vec![self.request(ClientRequest::RtpCapabilities)])
    }

    /// Publishes a local track once a connected send transport exists
    pub fn publish(
        &mut self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> ClientResult<Vec<RequestEnvelope>> {
        if self.state == SessionState::Closed {
            return Err(self.invalid("publish"));
        }
        self.queued_tracks.push_back((kind, rtp_parameters));
        Ok(self.flush())
    }

    pub fn unpublish(&mut self, producer_id: &str) -> ClientResult<Vec<RequestEnvelope>> {
        if self.state == SessionState::Closed || !self.producers.contains_key(producer_id) {
            return Err(self.invalid("unpublish"));
        }
        Ok(vec![self.request(ClientRequest::ProducerClosed {
            producer_id: producer_id.to_string(),
        })])
    }

    /// Drops every piece of session state. The caller closes the connection.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
        self.pending.clear();
        self.queued_tracks.clear();
        self.queued_subscriptions.clear();
        self.requested_subscriptions.clear();
        self.producers.clear();
        self.consumers.clear();
        self.send_transport = TransportSlot::default();
        self.recv_transport = TransportSlot::default();
    }

    pub fn handle_text(&mut self, text: &str) -> ClientResult<Vec<RequestEnvelope>> {
        let event: ServerEvent = serde_json::from_str(text)?;
        self.on_message(event)
    }

    pub fn on_message(&mut self, event: ServerEvent) -> ClientResult<Vec<RequestEnvelope>> {
        if self.state == SessionState::Closed {
            return Ok(Vec::new());
        }

        match event {
            ServerEvent::Welcome { peer_id, room } => {
                debug!("Joined room {} as {}", room, peer_id);
                self.peer_id = Some(peer_id);
                self.room = Some(room);
                Ok(Vec::new())
            }
            ServerEvent::Response { id, result } => {
                let pending = self
                    .pending
                    .remove(&id)
                    .ok_or(ClientError::UnexpectedReply(id))?;
                self.on_response(pending.request, result)
            }
            ServerEvent::Error { id, error } => self.on_error(id, error),
            ServerEvent::NewProducer {
                peer_id,
                producer_id,
                kind,
            } => {
                if self.peer_id.as_deref() == Some(peer_id.as_str()) {
                    return Ok(Vec::new());
                }
                debug!("New {:?} producer {} from {}", kind, producer_id, peer_id);
                self.subscribe(producer_id);
                Ok(self.flush())
            }
            ServerEvent::ConsumerClose { consumer_id } => {
                if let Some(consumer) = self.consumers.remove(&consumer_id) {
                    debug!("Consumer {} closed by server", consumer_id);
                    self.requested_subscriptions.remove(&consumer.producer_id);
                }
                self.refresh_activity();
                Ok(Vec::new())
            }
        }
    }

    fn on_response(
        &mut self,
        request: ClientRequest,
        result: serde_json::Value,
    ) -> ClientResult<Vec<RequestEnvelope>> {
        match request {
            ClientRequest::RtpCapabilities => {
                self.router_capabilities = Some(result);
                if self.state == SessionState::Idle {
                    self.state = SessionState::CapabilitiesLoaded;
                }
                let mut out = vec![self.request(ClientRequest::GetProducers)];
                out.extend(self.flush());
                Ok(out)
            }
            ClientRequest::CreateTransport => {
                let info: TransportInfo = serde_json::from_value(result)?;
                let direction = self.awaiting_transport().ok_or_else(|| self.invalid("create-transport"))?;
                self.slot_mut(direction).id = Some(info.id.clone());
                Ok(vec![self.request(ClientRequest::TransportConnect {
                    transport_id: info.id,
                    dtls_parameters: self.device.dtls_parameters.clone(),
                })])
            }
            ClientRequest::TransportConnect { transport_id, .. } => {
                for slot in [&mut self.send_transport, &mut self.recv_transport] {
                    if slot.id.as_deref() == Some(transport_id.as_str()) {
                        slot.connected = true;
                    }
                }
                Ok(self.flush())
            }
            ClientRequest::Produce { .. } => {
                let producer: ProducerInfo = serde_json::from_value(result)?;
                self.producers.insert(producer.id, producer.kind);
                self.refresh_activity();
                Ok(Vec::new())
            }
            ClientRequest::GetProducers => {
                let directory: BTreeMap<String, Vec<String>> = serde_json::from_value(result)?;
                let own = self.peer_id.clone();
                for (peer_id, producer_ids) in directory {
                    if own.as_deref() == Some(peer_id.as_str()) {
                        continue;
                    }
                    for producer_id in producer_ids {
                        self.subscribe(producer_id);
                    }
                }
                Ok(self.flush())
            }
            ClientRequest::Consume { producer_id, .. } => {
                if result.get("cannotConsume").is_some() {
                    debug!("Device cannot consume producer {}", producer_id);
                    return Ok(Vec::new());
                }
                let consumer: ConsumerInfo = serde_json::from_value(result)?;
                let consumer_id = consumer.id.clone();
                self.consumers.insert(consumer.id.clone(), consumer);
                self.refresh_activity();
                Ok(vec![self.request(ClientRequest::ResumeConsumer { consumer_id })])
            }
            ClientRequest::ResumeConsumer { .. } => Ok(Vec::new()),
            ClientRequest::ProducerClosed { producer_id } => {
                self.producers.remove(&producer_id);
                self.refresh_activity();
                Ok(Vec::new())
            }
        }
    }

    fn on_error(&mut self, id: Option<u64>, error: ErrorBody) -> ClientResult<Vec<RequestEnvelope>> {
        let Some(pending) = id.and_then(|id| self.pending.remove(&id)) else {
            warn!("Server error {}: {}", error.code, error.message);
            self.errors.push(error.clone());
            return Err(ClientError::Server(error));
        };

        if error.retryable && pending.retries < MAX_RETRIES {
            debug!("Retrying {} after {}", pending.request.name(), error.code);
            return Ok(vec![self.request_with_retries(pending.request, pending.retries + 1)]);
        }

        match &pending.request {
            ClientRequest::CreateTransport => {
                if let Some(direction) = self.awaiting_transport() {
                    *self.slot_mut(direction) = TransportSlot::default();
                }
            }
            ClientRequest::TransportConnect { transport_id, .. } => {
                // Forget the transport so the next flush creates a fresh one.
                for slot in [&mut self.send_transport, &mut self.recv_transport] {
                    if slot.id.as_deref() == Some(transport_id.as_str()) {
                        *slot = TransportSlot::default();
                    }
                }
            }
            ClientRequest::Consume { producer_id, .. } => {
                self.requested_subscriptions.remove(producer_id);
            }
            _ => {}
        }

        warn!("{} failed: {} ({})", pending.request.name(), error.message, error.code);
        self.errors.push(error.clone());
        Err(ClientError::Server(error))
    }

    fn subscribe(&mut self, producer_id: String) {
        if self.producers.contains_key(&producer_id)
            || !self.requested_subscriptions.insert(producer_id.clone())
        {
            return;
        }
        self.queued_subscriptions.push_back(producer_id);
    }

    /// Issues whatever queued work the current transports allow
    fn flush(&mut self) -> Vec<RequestEnvelope> {
        let mut out = Vec::new();
        if matches!(self.state, SessionState::Idle | SessionState::Closed) {
            return out;
        }

        if !self.queued_tracks.is_empty() {
            out.extend(self.ensure_transport(Direction::Send));
            if self.send_transport.connected {
                if let Some(transport_id) = self.send_transport.id.clone() {
                    while let Some((kind, rtp_parameters)) = self.queued_tracks.pop_front() {
                        out.push(self.request(ClientRequest::Produce {
                            transport_id: transport_id.clone(),
                            kind,
                            rtp_parameters,
                            app_data: serde_json::Value::Null,
                        }));
                    }
                }
            }
        }

        if !self.queued_subscriptions.is_empty() {
            out.extend(self.ensure_transport(Direction::Recv));
            if self.recv_transport.connected {
                if let Some(transport_id) = self.recv_transport.id.clone() {
                    while let Some(producer_id) = self.queued_subscriptions.pop_front() {
                        out.push(self.request(ClientRequest::Consume {
                            consumer_transport_id: transport_id.clone(),
                            producer_id,
                            rtp_capabilities: self.device.rtp_capabilities.clone(),
                        }));
                    }
                }
            }
        }

        out
    }

    fn ensure_transport(&mut self, direction: Direction) -> Option<RequestEnvelope> {
        // One transport creation in flight at a time keeps replies unambiguous.
        if self.slot_mut(direction).requested || self.awaiting_transport().is_some() {
            return None;
        }
        self.slot_mut(direction).requested = true;
        Some(self.request(ClientRequest::CreateTransport))
    }

    /// Direction whose transport was requested but not yet created
    fn awaiting_transport(&self) -> Option<Direction> {
        [
            (Direction::Send, &self.send_transport),
            (Direction::Recv, &self.recv_transport),
        ]
        .into_iter()
        .find(|(_, slot)| slot.requested && slot.id.is_none())
        .map(|(direction, _)| direction)
    }

    fn slot_mut(&mut self, direction: Direction) -> &mut TransportSlot {
        match direction {
            Direction::Send => &mut self.send_transport,
            Direction::Recv => &mut self.recv_transport,
        }
    }

    fn refresh_activity(&mut self) {
        if matches!(self.state, SessionState::Idle | SessionState::Closed) {
            return;
        }
        self.state = SessionState::Active {
            publishing: !self.producers.is_empty(),
            subscribing: !self.consumers.is_empty(),
        };
    }

    fn request(&mut self, request: ClientRequest) -> RequestEnvelope {
        self.request_with_retries(request, 0)
    }

    fn request_with_retries(&mut self, request: ClientRequest, retries: u32) -> RequestEnvelope {
        self.next_id += 1;
        let id = self.next_id;
        self.pending.insert(
            id,
            Pending {
                request: request.clone(),
                retries,
            },
        );
        RequestEnvelope {
            id: Some(id),
            request,
        }
    }

    fn invalid(&self, action: &'static str) -> ClientError {
        ClientError::InvalidState {
            state: self.state,
            action,
        }
    }
}
