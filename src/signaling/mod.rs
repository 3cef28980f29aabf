//! Signaling Module - WebSocket client transport
//!
//! Delivers typed events between a client and the signaling server, in
//! order and exactly once, without interpreting negotiation payloads.
//!

mod client;

pub use client::{ChannelEvent, SignalChannel, TransportError};
