#![forbid(unsafe_code)]

// Configuration for mediasoup workers, routers, and transports

use mediasoup::prelude::*;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag};
use std::net::{IpAddr, Ipv4Addr};
use std::num::{NonZeroU32, NonZeroU8};

/// Main media server configuration
#[derive(Debug, Clone, Default)]
pub struct MediaConfig {
    pub worker_config: WorkerConfig,
    pub router_config: RouterConfig,
    pub webrtc_transport_config: WebRtcTransportConfig,
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub num_workers: usize,
    pub log_level: WorkerLogLevel,
    pub log_tags: Vec<WorkerLogTag>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            log_level: WorkerLogLevel::Warn,
            log_tags: vec![
                WorkerLogTag::Info,
                WorkerLogTag::Ice,
                WorkerLogTag::Dtls,
                WorkerLogTag::Rtp,
                WorkerLogTag::Rtcp,
            ],
        }
    }
}

impl WorkerConfig {
    /// Converts to mediasoup WorkerSettings
    pub fn to_worker_settings(&self) -> WorkerSettings {
        let mut settings = WorkerSettings::default();
        settings.log_level = self.log_level;
        settings.log_tags = self.log_tags.clone();
        settings
    }
}

/// Router configuration with codec capabilities
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: Self::default_codecs(),
        }
    }
}

impl RouterConfig {
    /// VP8 video and stereo Opus audio
    pub fn default_codecs() -> Vec<RtpCodecCapability> {
        vec![
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Vp8,
                preferred_payload_type: None,
                clock_rate: NonZeroU32::new(90000).unwrap_or(NonZeroU32::MIN),
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: vec![
                    RtcpFeedback::Nack,
                    RtcpFeedback::NackPli,
                    RtcpFeedback::CcmFir,
                    RtcpFeedback::GoogRemb,
                    RtcpFeedback::TransportCc,
                ],
            },
            RtpCodecCapability::Audio {
                mime_type: MimeTypeAudio::Opus,
                preferred_payload_type: None,
                clock_rate: NonZeroU32::new(48000).unwrap_or(NonZeroU32::MIN),
                channels: NonZeroU8::new(2).unwrap_or(NonZeroU8::MIN),
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: vec![RtcpFeedback::TransportCc],
            },
        ]
    }

    /// Converts to RouterOptions for mediasoup
    pub fn to_router_options(&self) -> RouterOptions {
        RouterOptions::new(self.media_codecs.clone())
    }
}

/// WebRTC transport configuration
#[derive(Debug, Clone)]
pub struct WebRtcTransportConfig {
    pub listen_ip: IpAddr,
    pub announced_address: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub initial_available_outgoing_bitrate: u32,
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_address: Some(Ipv4Addr::LOCALHOST.to_string()),
            rtc_min_port: 10000,
            rtc_max_port: 59999,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: 600_000,
        }
    }
}

impl WebRtcTransportConfig {
    /// Sets the public IP address announced in ICE candidates
    pub fn with_public_ip(mut self, public_ip: IpAddr) -> Self {
        self.announced_address = Some(public_ip.to_string());
        self
    }

    fn listen_info(&self, protocol: Protocol) -> ListenInfo {
        ListenInfo {
            protocol,
            ip: self.listen_ip,
            announced_address: self.announced_address.clone(),
            port: None,
            port_range: Some(self.rtc_min_port..=self.rtc_max_port),
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        }
    }

    /// Listen protocols in preference order. Falls back to UDP if both are disabled.
    pub fn protocols(&self) -> Vec<Protocol> {
        let mut protocols = Vec::with_capacity(2);
        if self.enable_udp && self.prefer_udp {
            protocols.push(Protocol::Udp);
        }
        if self.enable_tcp {
            protocols.push(Protocol::Tcp);
        }
        if self.enable_udp && !self.prefer_udp {
            protocols.push(Protocol::Udp);
        }
        if protocols.is_empty() {
            protocols.push(Protocol::Udp);
        }
        protocols
    }

    /// Converts to WebRtcTransportOptions; the first listen info is the preferred one
    pub fn to_transport_options(&self) -> WebRtcTransportOptions {
        let mut protocols = self.protocols().into_iter();
        let first = protocols.next().unwrap_or(Protocol::Udp);
        let listen_infos = protocols.fold(
            WebRtcTransportListenInfos::new(self.listen_info(first)),
            |infos, protocol| infos.insert(self.listen_info(protocol)),
        );

        let mut options = WebRtcTransportOptions::new(listen_infos);
        options.initial_available_outgoing_bitrate = self.initial_available_outgoing_bitrate;
        options
    }
}
