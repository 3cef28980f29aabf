//! Pairchat - anonymous 1:1 chat matchmaking with WebRTC signaling
//!
//! Two halves sharing one wire protocol:
//! - `coordinator`: server side waiting pool, rooms and relay
//! - `negotiation` + `signaling` + `media`: client side offer/answer state
//!   machine on top of a WebSocket channel and a WebRTC peer connection

pub mod config;
pub mod coordinator;
pub mod media;
pub mod negotiation;
pub mod protocol;
pub mod signaling;

pub use config::{ClientConfig, ConfigError, MediaConstraints, PairingPolicy, ServerConfig};
pub use coordinator::{RelayError, SessionCoordinator, SignalingServer};
pub use media::{MediaCapability, MediaError, MediaSession, WebRtcMedia};
pub use negotiation::{
    EngineEvent, EngineInput, NegotiationEngine, NegotiationError, NegotiationState, UserCommand,
};
pub use signaling::{ChannelEvent, SignalChannel, TransportError};

use tracing_subscriber::EnvFilter;

// ============================================================================
// LOGGING
// ============================================================================

/// Installs the global fmt subscriber. `RUST_LOG` wins over the defaults;
/// calling this twice is a no-op.
pub fn init_tracing(default_directives: &[&str]) {
    let mut filter = EnvFilter::from_default_env();
    for directive in default_directives {
        match directive.parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("Ignoring log directive '{}': {}", directive, e),
        }
    }

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
