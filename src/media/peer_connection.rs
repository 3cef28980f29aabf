//! WebRTC-backed media capability
//!
//! Wraps `RTCPeerConnection` from the `webrtc` crate. Local tracks are
//! negotiated here; feeding captured samples into them is left to the
//! embedding application via [`WebRtcMedia::local_tracks`].

use super::{
    ConnectionState, LocalMedia, LocalTrack, MediaCapability, MediaError, MediaEvent,
    MediaEventSink, MediaSession, RemoteTrack, TrackKind,
};
use crate::config::MediaConstraints;
use crate::negotiation::NegotiationError;
use crate::protocol::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

const STREAM_ID: &str = "pairchat";

// ============================================================================
// CAPABILITY
// ============================================================================

pub struct WebRtcMedia {
    ice_servers: Vec<RTCIceServer>,
    local_tracks: Mutex<Vec<(TrackKind, Arc<TrackLocalStaticRTP>)>>,
}

impl WebRtcMedia {
    pub fn new(ice_server_urls: Vec<String>) -> Self {
        let mut ice_servers = Vec::new();
        if !ice_server_urls.is_empty() {
            ice_servers.push(RTCIceServer {
                urls: ice_server_urls,
                ..Default::default()
            });
        }

        Self {
            ice_servers,
            local_tracks: Mutex::new(Vec::new()),
        }
    }

    /// Adds TURN credentials on top of the STUN servers
    pub fn with_turn_server(mut self, url: String, username: String, credential: String) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls: vec![url],
            username,
            credential,
            ..Default::default()
        });
        self
    }

    /// Local tracks to write captured RTP packets into
    pub fn local_tracks(&self) -> Vec<Arc<TrackLocalStaticRTP>> {
        self.local_tracks
            .lock()
            .iter()
            .map(|(_, track)| Arc::clone(track))
            .collect()
    }

    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| MediaError::Backend(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| MediaError::Backend(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(|e| MediaError::Backend(e.to_string()))?;

        Ok(Arc::new(pc))
    }
}

impl std::fmt::Debug for WebRtcMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcMedia")
            .field("ice_servers", &self.ice_servers.len())
            .field("local_tracks", &self.local_tracks.lock().len())
            .finish()
    }
}

#[async_trait]
impl MediaCapability for WebRtcMedia {
    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMedia, MediaError> {
        if constraints.is_empty() {
            return Err(MediaError::NoTracksRequested);
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push((
                TrackKind::Audio,
                Arc::new(TrackLocalStaticRTP::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_owned(),
                        clock_rate: 48000,
                        channels: 2,
                        ..Default::default()
                    },
                    "audio".to_owned(),
                    STREAM_ID.to_owned(),
                )),
            ));
        }
        if constraints.video.is_some() {
            tracks.push((
                TrackKind::Video,
                Arc::new(TrackLocalStaticRTP::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_VP8.to_owned(),
                        clock_rate: 90000,
                        ..Default::default()
                    },
                    "video".to_owned(),
                    STREAM_ID.to_owned(),
                )),
            ));
        }

        let media = LocalMedia {
            tracks: tracks
                .iter()
                .map(|(kind, track)| LocalTrack {
                    id: track.id().to_owned(),
                    kind: *kind,
                })
                .collect(),
        };
        *self.local_tracks.lock() = tracks;

        tracing::info!("Local media ready: {} track(s)", media.tracks.len());
        Ok(media)
    }

    async fn open_session(
        &self,
        events: MediaEventSink,
    ) -> Result<Box<dyn MediaSession>, MediaError> {
        let tracks = self.local_tracks();
        if tracks.is_empty() {
            return Err(MediaError::DeviceUnavailable(
                "local media not acquired".to_string(),
            ));
        }

        let pc = self.create_peer_connection().await?;
        for track in tracks {
            if let Err(e) = pc
                .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await
            {
                let _ = pc.close().await;
                return Err(MediaError::Backend(e.to_string()));
            }
        }

        install_handlers(&pc, events);
        Ok(Box::new(WebRtcSession { pc }))
    }
}

/// Turns peer connection callbacks into [`MediaEvent`]s
fn install_handlers(pc: &Arc<RTCPeerConnection>, events: MediaEventSink) {
    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);

        let state = match s {
            RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                ConnectionState::New
            }
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
        };
        sink.emit(MediaEvent::ConnectionState(state));

        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => sink.emit(MediaEvent::IceCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                })),
                Err(e) => tracing::warn!("Dropping unserializable local candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    let sink = events;
    pc.on_track(Box::new(move |track, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        let remote = RemoteTrack {
            id: track.id(),
            stream_id: track.stream_id(),
            kind,
        };
        tracing::info!("Received remote track: {:?}", remote);
        sink.emit(MediaEvent::Track(remote));
        Box::pin(async {})
    }));
}

// ============================================================================
// SESSION
// ============================================================================

struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    let parsed = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(|e| NegotiationError::rejected("parse description", e))
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, NegotiationError> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer | RTCSdpType::Pranswer => SdpType::Answer,
        other => {
            return Err(NegotiationError::rejected(
                "convert description",
                format!("unsupported sdp type {}", other),
            ))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp,
    })
}

#[async_trait]
impl MediaSession for WebRtcSession {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| NegotiationError::rejected("create offer", e))?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| NegotiationError::rejected("create answer", e))?;
        from_rtc(answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(|e| NegotiationError::rejected("set local description", e))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(|e| NegotiationError::rejected("set remote description", e))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| NegotiationError::rejected("add ice candidate", e))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
    }
}
