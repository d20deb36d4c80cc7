#![forbid(unsafe_code)]

// Common types and error handling for the media module

use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by room, peer and engine operations.
///
/// Not-found variants are precondition failures local to the requester;
/// `RouterNotReady` and `EngineFailure` may succeed if the client retries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("Router for room {0} is not ready")]
    RouterNotReady(String),

    #[error("Capabilities cannot consume producer {0}")]
    IncompatibleCapabilities(String),

    #[error("Media engine failure: {0}")]
    EngineFailure(String),

    #[error("Peer already registered: {0}")]
    DuplicatePeer(String),

    #[error("Room not found: {0}")]
    RoomNotFound(String),
}

impl MediaError {
    /// Stable wire code for the error, used in signaling error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PeerNotFound(_) => "peer-not-found",
            Self::TransportNotFound(_) => "transport-not-found",
            Self::ProducerNotFound(_) => "producer-not-found",
            Self::ConsumerNotFound(_) => "consumer-not-found",
            Self::RouterNotReady(_) => "router-not-ready",
            Self::IncompatibleCapabilities(_) => "incompatible-capabilities",
            Self::EngineFailure(_) => "engine-failure",
            Self::DuplicatePeer(_) => "duplicate-peer",
            Self::RoomNotFound(_) => "room-not-found",
        }
    }

    /// Whether re-issuing the same request later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RouterNotReady(_) | Self::EngineFailure(_))
    }
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

/// Transport parameters the remote side needs to build its end of the transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

impl From<&WebRtcTransport> for TransportInfo {
    fn from(transport: &WebRtcTransport) -> Self {
        Self {
            id: transport.id().to_string(),
            ice_parameters: transport.ice_parameters().clone(),
            ice_candidates: transport.ice_candidates().clone(),
            dtls_parameters: transport.dtls_parameters(),
        }
    }
}

/// Parameters for publishing one media track
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceParams {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    /// Opaque client metadata, passed through to the engine
    #[serde(default)]
    pub app_data: serde_json::Value,
}

/// Published producer summary returned to the requester
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub id: String,
    pub kind: MediaKind,
}

/// Minimal parameter set the remote side needs to instantiate a receive-side track
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}
