use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one local chat session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationState {
    /// No session, not searching
    Idle,
    /// In the coordinator's waiting pool
    Searching,
    /// Matched as initiator, offer not yet sent
    PairedInitiator,
    /// Matched as responder, waiting for the offer
    PairedResponder,
    /// Offer sent, waiting for the answer
    OfferSent,
    /// Answer sent, waiting for the transport
    AnswerSent,
    /// Media flowing
    Connected,
    /// Torn down; always followed by `Idle`
    Closed,
}

impl NegotiationState {
    /// States that own a room and a media session
    pub fn is_paired(self) -> bool {
        matches!(
            self,
            NegotiationState::PairedInitiator
                | NegotiationState::PairedResponder
                | NegotiationState::OfferSent
                | NegotiationState::AnswerSent
                | NegotiationState::Connected
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Searching => "searching",
            NegotiationState::PairedInitiator => "paired-initiator",
            NegotiationState::PairedResponder => "paired-responder",
            NegotiationState::OfferSent => "offer-sent",
            NegotiationState::AnswerSent => "answer-sent",
            NegotiationState::Connected => "connected",
            NegotiationState::Closed => "closed",
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
