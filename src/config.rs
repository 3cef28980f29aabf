//! Configuration for server and client
//!
//! Both binaries map their CLI flags onto these structs; library users can
//! build them directly. Defaults match the browser deployment (port 5000,
//! Google STUN servers, audio plus 720x480 video).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Unsupported URL scheme '{0}', expected ws or wss")]
    UnsupportedScheme(String),

    #[error("Invalid ICE server URL: {0}")]
    InvalidIceServer(String),

    #[error("Media constraints request neither audio nor video")]
    EmptyConstraints,

    #[error("Negotiation timeout must be greater than zero")]
    ZeroTimeout,
}

// ============================================================================
// SERVER
// ============================================================================

/// How two waiting participants are chosen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingPolicy {
    /// Longest-waiting participant first
    #[default]
    Fifo,
    /// Any waiting participant, uniformly at random
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub pairing: PairingPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            pairing: PairingPolicy::Fifo,
        }
    }
}

// ============================================================================
// CLIENT
// ============================================================================

/// Requested local tracks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: Option<VideoConstraints>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: Some(VideoConstraints {
                width: 720,
                height: 480,
            }),
        }
    }
}

impl MediaConstraints {
    pub fn is_empty(&self) -> bool {
        !self.audio && self.video.is_none()
    }
}

/// Standard STUN servers
pub fn default_ice_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub signaling_url: String,
    pub ice_servers: Vec<String>,
    pub constraints: MediaConstraints,
    /// Abandon `searching` after this long; `None` waits indefinitely
    pub search_timeout: Option<Duration>,
    /// Upper bound for a single media negotiation step
    pub negotiation_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:5000".to_string(),
            ice_servers: default_ice_servers(),
            constraints: MediaConstraints::default(),
            search_timeout: None,
            negotiation_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.signaling_url)?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ConfigError::UnsupportedScheme(url.scheme().to_string()));
        }

        for server in &self.ice_servers {
            let known = ["stun:", "stuns:", "turn:", "turns:"]
                .iter()
                .any(|prefix| server.starts_with(prefix));
            if !known {
                return Err(ConfigError::InvalidIceServer(server.clone()));
            }
        }

        if self.constraints.is_empty() {
            return Err(ConfigError::EmptyConstraints);
        }
        if self.negotiation_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}
