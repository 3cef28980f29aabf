//! Coordinator Module - matchmaking and relay on the server side
//!
//! - waiting pool and pairing policy
//! - two-member rooms with per-room serialized relay
//! - lifecycle notifications (`partner_found`, `partner_left`, `user_count`)
//! - WebSocket front end mapping wire events onto coordinator operations
//!

mod registry;
mod server;
mod session;

pub use registry::SessionCoordinator;
pub use server::SignalingServer;
pub use session::{RelayError, Session, SessionInfo, MAX_MEMBERS};
