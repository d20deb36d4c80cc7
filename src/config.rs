#![forbid(unsafe_code)]

// Process configuration loaded from environment variables

use crate::media::MediaConfig;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_ROOM: &str = "Test_Room";

/// Top-level server settings. Unset or invalid variables fall back to defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    /// Room joined by connections that do not name one
    pub default_room: String,
    pub announce_ip: IpAddr,
    pub max_connections: usize,
    pub router_ready_timeout: Duration,
    pub num_workers: usize,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            default_room: DEFAULT_ROOM.to_string(),
            announce_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            max_connections: 10_000,
            router_ready_timeout: Duration::from_millis(5_000),
            num_workers: 1,
            rtc_min_port: 10_000,
            rtc_max_port: 59_999,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let mut config = Self {
            port: parse_or(&lookup, "PORT", defaults.port),
            default_room: lookup("ROOM_NAME")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.default_room),
            announce_ip: parse_or(&lookup, "ANNOUNCE_IP", defaults.announce_ip),
            max_connections: parse_or(&lookup, "MAX_CONNECTIONS", defaults.max_connections),
            router_ready_timeout: Duration::from_millis(parse_or(
                &lookup,
                "ROUTER_READY_TIMEOUT_MS",
                5_000u64,
            )),
            num_workers: parse_or(&lookup, "NUM_WORKERS", defaults.num_workers),
            rtc_min_port: parse_or(&lookup, "RTC_MIN_PORT", defaults.rtc_min_port),
            rtc_max_port: parse_or(&lookup, "RTC_MAX_PORT", defaults.rtc_max_port),
        };

        if config.max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default 10000");
            config.max_connections = defaults.max_connections;
        }
        if config.num_workers == 0 {
            warn!("NUM_WORKERS=0 is not usable, using 1");
            config.num_workers = 1;
        }
        if config.rtc_min_port > config.rtc_max_port {
            warn!(
                "RTC port range {}-{} is empty, using {}-{}",
                config.rtc_min_port, config.rtc_max_port, defaults.rtc_min_port, defaults.rtc_max_port
            );
            config.rtc_min_port = defaults.rtc_min_port;
            config.rtc_max_port = defaults.rtc_max_port;
        }

        config
    }

    /// Media engine settings derived from this config
    pub fn media_config(&self) -> MediaConfig {
        let mut media_config = MediaConfig::default();
        media_config.worker_config.num_workers = self.num_workers;
        media_config.webrtc_transport_config = media_config
            .webrtc_transport_config
            .with_public_ip(self.announce_ip);
        media_config.webrtc_transport_config.rtc_min_port = self.rtc_min_port;
        media_config.webrtc_transport_config.rtc_max_port = self.rtc_max_port;
        media_config
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Invalid {}={:?}, using default {}", key, raw, default);
                default
            }
        },
    }
}
