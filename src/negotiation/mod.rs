//! Negotiation Module - one peer's view of a chat session
//!
//! Owns the state machine that decides which signaling messages are valid
//! when, drives the [`MediaCapability`](crate::media::MediaCapability) and
//! turns failures into state transitions plus a status line for the user.
//!

mod engine;
mod error;
mod state;

pub use engine::{EngineEvent, EngineInput, NegotiationEngine, UserCommand};
pub use error::NegotiationError;
pub use state::NegotiationState;
