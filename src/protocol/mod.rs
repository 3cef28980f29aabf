//! Protocol Module - wire types shared by server and client
//!
//! Every frame on the signaling socket is one JSON object of the form
//! `{"event": "<name>", "data": {...}}`. Payload-less events omit `data`.

mod messages;

pub use messages::*;
