//! Media Module - capability boundary for local media and negotiation
//!
//! The negotiation engine never talks to a peer connection directly. It
//! drives a [`MediaCapability`], which hands out one [`MediaSession`] per
//! paired chat:
//! - acquire local audio/video tracks
//! - create and apply offers/answers
//! - apply remote ICE candidates
//! - report local candidates, remote tracks and connection state as events
//!

mod peer_connection;

pub use peer_connection::WebRtcMedia;

use crate::config::MediaConstraints;
use crate::negotiation::NegotiationError;
use crate::protocol::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Local media could not be acquired or the media backend failed to start.
/// Only a user action retries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Camera/microphone unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Camera/microphone access denied")]
    PermissionDenied,

    #[error("No audio or video track requested")]
    NoTracksRequested,

    #[error("Media backend error: {0}")]
    Backend(String),
}

// ============================================================================
// MEDIA TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Acquired local track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Handle to the local tracks, acquired once and reused across sessions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalMedia {
    pub tracks: Vec<LocalTrack>,
}

/// Track received from the partner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

/// Transport state of the underlying peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Callback-free view of `onIceCandidate` / `onTrack` /
/// `onConnectionStateChange`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    IceCandidate(IceCandidate),
    Track(RemoteTrack),
    ConnectionState(ConnectionState),
}

/// A media event stamped with the epoch of the session that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedMediaEvent {
    pub epoch: u64,
    pub event: MediaEvent,
}

/// Where a media session reports its events
#[derive(Debug, Clone)]
pub struct MediaEventSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<TaggedMediaEvent>,
}

impl MediaEventSink {
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<TaggedMediaEvent>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Sends an event; a closed receiver means the engine is gone and the
    /// event is dropped.
    pub fn emit(&self, event: MediaEvent) {
        let _ = self.tx.send(TaggedMediaEvent {
            epoch: self.epoch,
            event,
        });
    }
}

// ============================================================================
// CAPABILITY TRAITS
// ============================================================================

#[async_trait]
pub trait MediaCapability: Send + Sync {
    /// Acquires local tracks matching `constraints`.
    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMedia, MediaError>;

    /// Opens a negotiation session with the acquired local tracks attached.
    async fn open_session(&self, events: MediaEventSink)
        -> Result<Box<dyn MediaSession>, MediaError>;
}

/// One peer connection's negotiation primitives
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Closes the connection and releases remote media.
    async fn close(&self);
}
