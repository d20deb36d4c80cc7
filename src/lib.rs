#![forbid(unsafe_code)]

// StreamRooms library - multi-party WebRTC session coordination over a mediasoup SFU

pub mod client;
pub mod config;
pub mod media;
pub mod metrics;
pub mod room;
pub mod signaling;
