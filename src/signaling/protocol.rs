#![forbid(unsafe_code)]

// Signaling protocol - request envelopes, replies and push messages

use crate::media::types::{ConsumerInfo, MediaError, ProducerInfo, TransportInfo};
use crate::room::ProducerDirectory;
use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};

/// Client-to-server frame: a correlation id plus one request.
/// Requests without an id are fire-and-forget; only failures are reported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default)]
    pub id: Option<u64>,
    pub request: ClientRequest,
}

/// Requests a peer can issue against its room
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientRequest {
    /// Router RTP capabilities, needed to load the client device
    RtpCapabilities,
    CreateTransport,
    #[serde(rename_all = "camelCase")]
    TransportConnect {
        transport_id: String,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(default)]
        app_data: serde_json::Value,
    },
    GetProducers,
    #[serde(rename_all = "camelCase")]
    Consume {
        consumer_transport_id: String,
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
    },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer { consumer_id: String },
    /// The client stopped publishing a track
    #[serde(rename_all = "camelCase")]
    ProducerClosed { producer_id: String },
}

impl ClientRequest {
    /// Wire name, for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::RtpCapabilities => "rtp-capabilities",
            Self::CreateTransport => "create-transport",
            Self::TransportConnect { .. } => "transport-connect",
            Self::Produce { .. } => "produce",
            Self::GetProducers => "get-producers",
            Self::Consume { .. } => "consume",
            Self::ResumeConsumer { .. } => "resume-consumer",
            Self::ProducerClosed { .. } => "producer-closed",
        }
    }
}

/// Server-to-client messages
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// First frame on every connection
    #[serde(rename_all = "camelCase")]
    Welcome { peer_id: String, room: String },
    Response { id: u64, result: ResponsePayload },
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

/// Successful request results
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    RtpCapabilities(RtpCapabilitiesFinalized),
    Transport(TransportInfo),
    Producer(ProducerInfo),
    Producers(ProducerDirectory),
    Consumer(ConsumerInfo),
    /// Device capabilities do not intersect the producer's codecs
    #[serde(rename_all = "camelCase")]
    CannotConsume {
        cannot_consume: bool,
        producer_id: String,
    },
    Ack { ok: bool },
}

impl ResponsePayload {
    pub fn ack() -> Self {
        Self::Ack { ok: true }
    }

    pub fn cannot_consume(producer_id: impl Into<String>) -> Self {
        Self::CannotConsume {
            cannot_consume: true,
            producer_id: producer_id.into(),
        }
    }
}

/// Machine-readable error reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl ErrorBody {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: "invalid-request".to_string(),
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<&MediaError> for ErrorBody {
    fn from(error: &MediaError) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
            retryable: error.is_retryable(),
        }
    }
}
