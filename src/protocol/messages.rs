//! Message types for the signaling protocol
//!
//! Client and server speak the same event vocabulary the browser client
//! used over Socket.IO, encoded as adjacently tagged JSON.

use crate::negotiation::NegotiationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Opaque room token, unique per pairing
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of one signaling connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub Uuid);

impl ParticipantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Negotiation role, assigned by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Produces the offer
    Initiator,
    /// Waits for the offer and answers it
    Responder,
}

impl Role {
    pub fn from_initiator_flag(initiator: bool) -> Self {
        if initiator {
            Role::Initiator
        } else {
            Role::Responder
        }
    }

    pub fn is_initiator(self) -> bool {
        self == Role::Initiator
    }
}

// ============================================================================
// SIGNAL PAYLOADS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// SDP description as produced by `createOffer` / `createAnswer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

/// Negotiation message relayed between the two members of a room.
///
/// This is a closed union: any other `type` fails to decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    Offer {
        room: RoomId,
        payload: SessionDescription,
    },
    Answer {
        room: RoomId,
        payload: SessionDescription,
    },
    Candidate {
        room: RoomId,
        payload: IceCandidate,
    },
}

impl SignalMessage {
    pub fn room(&self) -> &RoomId {
        match self {
            SignalMessage::Offer { room, .. }
            | SignalMessage::Answer { room, .. }
            | SignalMessage::Candidate { room, .. } => room,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Candidate { .. } => "candidate",
        }
    }

    /// Checks that the embedded description matches the message type.
    pub fn validate(&self) -> Result<(), NegotiationError> {
        let (expected, description) = match self {
            SignalMessage::Offer { payload, .. } => (SdpType::Offer, payload),
            SignalMessage::Answer { payload, .. } => (SdpType::Answer, payload),
            SignalMessage::Candidate { payload, .. } => {
                if payload.candidate.is_empty() {
                    return Err(NegotiationError::MalformedSignal(
                        "empty candidate".to_string(),
                    ));
                }
                return Ok(());
            }
        };

        if description.sdp_type != expected {
            return Err(NegotiationError::MalformedSignal(format!(
                "{} message carries a {:?} description",
                self.kind(),
                description.sdp_type
            )));
        }
        if description.sdp.trim().is_empty() {
            return Err(NegotiationError::MalformedSignal(format!(
                "{} message has an empty sdp",
                self.kind()
            )));
        }
        Ok(())
    }
}

// ============================================================================
// CLIENT → SERVER EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Enter the waiting pool
    FindPartner,
    /// Leave the waiting pool
    StopSearch,
    /// Negotiation message for the partner
    Signal(SignalMessage),
    /// Explicit exit from a room
    LeaveChat { room: RoomId },
    /// Free-text message for the partner
    ChatMessage { room: RoomId, message: String },
}

impl ClientEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, NegotiationError> {
        let event: Self = serde_json::from_str(text)
            .map_err(|e| NegotiationError::MalformedSignal(e.to_string()))?;
        if let ClientEvent::Signal(signal) = &event {
            signal.validate()?;
        }
        Ok(event)
    }
}

// ============================================================================
// SERVER → CLIENT EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Entered the waiting pool
    Waiting,
    /// Left the waiting pool
    SearchStopped,
    /// Paired into `room`; `initiator` decides who produces the offer
    PartnerFound { room: RoomId, initiator: bool },
    /// Negotiation message from the partner
    Signal(SignalMessage),
    /// Partner exited or disconnected
    PartnerLeft {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<RoomId>,
    },
    /// Free-text message from the partner
    ChatMessage { message: String },
    /// Connected clients, advisory only
    UserCount { count: usize },
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, NegotiationError> {
        let event: Self = serde_json::from_str(text)
            .map_err(|e| NegotiationError::MalformedSignal(e.to_string()))?;
        if let ServerEvent::Signal(signal) = &event {
            signal.validate()?;
        }
        Ok(event)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payloadless_events_omit_data() {
        let json = ClientEvent::FindPartner.to_json().unwrap();
        assert_eq!(json, r#"{"event":"find_partner"}"#);

        let parsed = ServerEvent::from_json(r#"{"event":"waiting"}"#).unwrap();
        assert_eq!(parsed, ServerEvent::Waiting);
    }

    #[test]
    fn test_partner_found_shape() {
        let event = ServerEvent::PartnerFound {
            room: RoomId::from("r1"),
            initiator: true,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"event": "partner_found", "data": {"room": "r1", "initiator": true}})
        );
    }

    #[test]
    fn test_signal_offer_shape() {
        let event = ClientEvent::Signal(SignalMessage::Offer {
            room: RoomId::from("r1"),
            payload: SessionDescription::offer("v=0"),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "signal",
                "data": {
                    "type": "offer",
                    "room": "r1",
                    "payload": {"type": "offer", "sdp": "v=0"}
                }
            })
        );
    }

    #[test]
    fn test_candidate_uses_browser_field_names() {
        let text = r#"{"event":"signal","data":{"type":"candidate","room":"r1",
            "payload":{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host",
            "sdpMid":"0","sdpMLineIndex":0}}}"#;
        let event = ServerEvent::from_json(text).unwrap();
        match event {
            ServerEvent::Signal(SignalMessage::Candidate { room, payload }) => {
                assert_eq!(room.as_str(), "r1");
                assert_eq!(payload.sdp_mid.as_deref(), Some("0"));
                assert_eq!(payload.sdp_mline_index, Some(0));
                assert!(payload.username_fragment.is_none());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_signal_type_is_rejected() {
        let text = r#"{"event":"signal","data":{"type":"renegotiate","room":"r1","payload":{}}}"#;
        let err = ServerEvent::from_json(text).unwrap_err();
        assert!(matches!(err, NegotiationError::MalformedSignal(_)));
    }

    #[test]
    fn test_mismatched_description_type_is_rejected() {
        let text = r#"{"event":"signal","data":{"type":"answer","room":"r1",
            "payload":{"type":"offer","sdp":"v=0"}}}"#;
        assert!(ClientEvent::from_json(text).is_err());
    }

    #[test]
    fn test_partner_left_room_is_optional() {
        let parsed = ServerEvent::from_json(r#"{"event":"partner_left","data":{}}"#).unwrap();
        assert_eq!(parsed, ServerEvent::PartnerLeft { room: None });

        let json = ServerEvent::PartnerLeft {
            room: Some(RoomId::from("r9")),
        }
        .to_json()
        .unwrap();
        assert_eq!(json, r#"{"event":"partner_left","data":{"room":"r9"}}"#);
    }

    #[test]
    fn test_role_from_flag() {
        assert_eq!(Role::from_initiator_flag(true), Role::Initiator);
        assert!(!Role::from_initiator_flag(false).is_initiator());
    }
}
