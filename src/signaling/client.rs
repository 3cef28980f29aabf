//! WebSocket client for the signaling server
//!
//! Carries typed events between the negotiation engine and the server:
//! - one read task decoding `ServerEvent`s
//! - one write task encoding `ClientEvent`s
//! - no reconnection; a closed socket is reported once as `Disconnected`

use crate::protocol::{ClientEvent, ServerEvent};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),
}

// ============================================================================
// CHANNEL EVENTS
// ============================================================================

/// What the channel delivers to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A validated server event
    Message(ServerEvent),
    /// The socket closed or failed; sent exactly once
    Disconnected,
}

#[derive(Debug, Clone, Default)]
struct ChannelState {
    is_connected: bool,
}

// ============================================================================
// SIGNAL CHANNEL
// ============================================================================

pub struct SignalChannel {
    server_url: String,
    state: Arc<RwLock<ChannelState>>,
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl SignalChannel {
    /// Connects and returns the channel together with the inbound event
    /// stream.
    pub async fn connect(
        server_url: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChannelEvent>), TransportError> {
        tracing::info!("Connecting to signaling server: {}", server_url);

        let (ws_stream, _) = connect_async(server_url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<ChannelEvent>();
        let state = Arc::new(RwLock::new(ChannelState { is_connected: true }));

        // Read task
        let state_clone = Arc::clone(&state);
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match ServerEvent::from_json(&text) {
                        Ok(event) => {
                            if event_tx.send(ChannelEvent::Message(event)).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("Rejected inbound frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state_clone.write().is_connected = false;
            let _ = event_tx.send(ChannelEvent::Disconnected);
        });

        // Write task
        let state_clone = Arc::clone(&state);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let text = match event.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("Failed to encode outgoing event: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            state_clone.write().is_connected = false;
            let _ = write.close().await;
        });

        let channel = Self {
            server_url: server_url.to_string(),
            state,
            tx,
        };
        Ok((channel, event_rx))
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Sender half for the negotiation engine's outgoing events
    pub fn sender(&self) -> mpsc::UnboundedSender<ClientEvent> {
        self.tx.clone()
    }

    pub fn send(&self, event: ClientEvent) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.tx
            .send(event)
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

impl std::fmt::Debug for SignalChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalChannel")
            .field("server_url", &self.server_url)
            .field("state", &*self.state.read())
            .finish()
    }
}
