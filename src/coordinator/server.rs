//! WebSocket front end for the coordinator
//!
//! One task per connection. Inbound frames are decoded into `ClientEvent`s
//! and dispatched in order; a forward task drains the participant's outbox
//! into the socket.

use super::registry::SessionCoordinator;
use crate::config::ServerConfig;
use crate::protocol::{ClientEvent, ParticipantId};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Message, Result as WsResult},
};

pub struct SignalingServer {
    listener: TcpListener,
    coordinator: Arc<SessionCoordinator>,
}

impl SignalingServer {
    pub async fn bind(config: &ServerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let coordinator = Arc::new(SessionCoordinator::new(config.pairing));
        tracing::info!(
            "Signaling server listening on {} ({:?} pairing)",
            listener.local_addr()?,
            coordinator.policy()
        );
        Ok(Self {
            listener,
            coordinator,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn coordinator(&self) -> Arc<SessionCoordinator> {
        Arc::clone(&self.coordinator)
    }

    /// Accepts connections until the listener fails.
    pub async fn run(self) -> std::io::Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let coordinator = Arc::clone(&self.coordinator);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, coordinator).await {
                    tracing::warn!("Connection {} ended with error: {}", addr, e);
                }
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, coordinator: Arc<SessionCoordinator>) -> WsResult<()> {
    let addr = stream.peer_addr()?;
    let ws_stream = accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (participant, mut outbox) = coordinator.connect();
    tracing::debug!("Connection {} registered as {}", addr, participant);

    let forward_task = tokio::spawn(async move {
        while let Some(event) = outbox.recv().await {
            let text = match event.to_json() {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to encode server event: {}", e);
                    continue;
                }
            };
            if let Err(e) = ws_tx.send(Message::Text(text)).await {
                tracing::debug!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => match ClientEvent::from_json(&text) {
                Ok(event) => dispatch(&coordinator, participant, event),
                Err(e) => tracing::warn!("Rejected frame from {}: {}", participant, e),
            },
            Ok(Message::Close(_)) => {
                tracing::debug!("WebSocket closed by client {}", addr);
                break;
            }
            Err(e) => {
                tracing::debug!("WebSocket error from {}: {}", addr, e);
                break;
            }
            _ => {}
        }
    }

    coordinator.disconnect(participant);
    forward_task.abort();
    Ok(())
}

/// Maps one client event onto a coordinator operation. Failures here are
/// races with the other member and are only logged.
fn dispatch(coordinator: &SessionCoordinator, participant: ParticipantId, event: ClientEvent) {
    let result = match event {
        ClientEvent::FindPartner => coordinator.request_partner(participant),
        ClientEvent::StopSearch => {
            coordinator.cancel_search(participant);
            Ok(())
        }
        ClientEvent::Signal(message) => coordinator.relay_signal(participant, message),
        ClientEvent::LeaveChat { room } => coordinator.leave(&room, participant),
        ClientEvent::ChatMessage { room, message } => {
            coordinator.relay_chat(&room, participant, message)
        }
    };

    if let Err(e) = result {
        tracing::debug!("Ignored request from {}: {}", participant, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerEvent;
    use std::time::Duration;
    use tokio_tungstenite::connect_async;

    async fn start() -> (SocketAddr, Arc<SessionCoordinator>) {
        let config = ServerConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        };
        let server = SignalingServer::bind(&config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let coordinator = server.coordinator();
        assert_eq!(coordinator.policy(), config.pairing);
        tokio::spawn(server.run());
        (addr, coordinator)
    }

    async fn next_event<S>(ws: &mut S) -> ServerEvent
    where
        S: StreamExt<Item = WsResult<Message>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                let event = ServerEvent::from_json(&text).unwrap();
                if !matches!(event, ServerEvent::UserCount { .. }) {
                    return event;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_pairing_over_websocket() {
        let (addr, coordinator) = start().await;
        let url = format!("ws://{}", addr);

        let (mut a, _) = connect_async(&url).await.unwrap();
        let (mut b, _) = connect_async(&url).await.unwrap();

        a.send(Message::Text(r#"{"event":"find_partner"}"#.to_string()))
            .await
            .unwrap();
        assert_eq!(next_event(&mut a).await, ServerEvent::Waiting);

        b.send(Message::Text(r#"{"event":"find_partner"}"#.to_string()))
            .await
            .unwrap();
        let ServerEvent::PartnerFound { room, initiator } = next_event(&mut b).await else {
            panic!("expected partner_found");
        };
        assert!(initiator);
        assert_eq!(
            next_event(&mut a).await,
            ServerEvent::PartnerFound {
                room: room.clone(),
                initiator: false
            }
        );
        assert_eq!(coordinator.room_count(), 1);

        // garbage is dropped without closing the connection
        b.send(Message::Text("not json".to_string())).await.unwrap();

        b.close(None).await.unwrap();
        assert_eq!(
            next_event(&mut a).await,
            ServerEvent::PartnerLeft { room: Some(room) }
        );
        assert_eq!(coordinator.room_count(), 0);
    }
}
