//! Negotiation Engine
//!
//! All inputs (user commands, signaling events, media callbacks) are
//! explicit values dispatched into one `&mut self` handler, so no two
//! transitions for the same session ever interleave. Media operations are
//! awaited inside that handler.

use super::error::NegotiationError;
use super::state::NegotiationState;
use crate::config::ClientConfig;
use crate::media::{
    ConnectionState, LocalMedia, MediaCapability, MediaEvent, MediaEventSink, MediaSession,
    RemoteTrack, TaggedMediaEvent,
};
use crate::protocol::{
    ClientEvent, IceCandidate, Role, RoomId, ServerEvent, SessionDescription, SignalMessage,
};
use crate::signaling::ChannelEvent;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

// ============================================================================
// INPUTS / OUTPUTS
// ============================================================================

/// Actions taken by the local user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    FindPartner,
    StopSearch,
    Leave,
    SendChat(String),
}

/// Everything the engine reacts to
#[derive(Debug, Clone)]
pub enum EngineInput {
    Command(UserCommand),
    Channel(ChannelEvent),
    Media(TaggedMediaEvent),
    SearchTimeout,
}

/// Events published for the UI layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    StateChanged(NegotiationState),
    Status { message: String, is_error: bool },
    Chat { message: String, from_self: bool },
    RemoteTrack(RemoteTrack),
    UserCount(usize),
}

// ============================================================================
// SESSION CONTEXT
// ============================================================================

/// Everything that lives exactly as long as one paired session
struct SessionContext {
    room: RoomId,
    role: Role,
    epoch: u64,
    media: Box<dyn MediaSession>,
    remote_description_applied: bool,
    pending_candidates: Vec<IceCandidate>,
    in_flight: bool,
}

async fn bounded<T>(
    limit: Duration,
    operation: &'static str,
    fut: impl Future<Output = Result<T, NegotiationError>>,
) -> Result<T, NegotiationError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(NegotiationError::Timeout(operation)),
    }
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// NEGOTIATION ENGINE
// ============================================================================

pub struct NegotiationEngine {
    config: ClientConfig,
    media: Arc<dyn MediaCapability>,
    outbound: mpsc::UnboundedSender<ClientEvent>,
    event_tx: broadcast::Sender<EngineEvent>,
    media_tx: mpsc::UnboundedSender<TaggedMediaEvent>,
    media_rx: Option<mpsc::UnboundedReceiver<TaggedMediaEvent>>,
    state: NegotiationState,
    session: Option<SessionContext>,
    local_media: Option<LocalMedia>,
    epoch: u64,
    search_deadline: Option<Instant>,
}

impl NegotiationEngine {
    pub fn new(
        config: ClientConfig,
        media: Arc<dyn MediaCapability>,
        outbound: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let (media_tx, media_rx) = mpsc::unbounded_channel();

        Self {
            config,
            media,
            outbound,
            event_tx,
            media_tx,
            media_rx: Some(media_rx),
            state: NegotiationState::Idle,
            session: None,
            local_media: None,
            epoch: 0,
            search_deadline: None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn room(&self) -> Option<&RoomId> {
        self.session.as_ref().map(|s| &s.room)
    }

    pub fn role(&self) -> Option<Role> {
        self.session.as_ref().map(|s| s.role)
    }

    /// Remote candidates waiting for a remote description
    pub fn pending_candidates(&self) -> usize {
        self.session
            .as_ref()
            .map(|s| s.pending_candidates.len())
            .unwrap_or(0)
    }

    /// Drives the engine until the command stream ends.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<UserCommand>,
        mut inbound: mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        let Some(mut media_rx) = self.media_rx.take() else {
            tracing::error!("Negotiation engine already running");
            return;
        };
        let mut channel_open = true;

        loop {
            let deadline = self.search_deadline;
            let input = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => EngineInput::Command(command),
                    None => break,
                },
                event = inbound.recv(), if channel_open => match event {
                    Some(ChannelEvent::Disconnected) => {
                        channel_open = false;
                        EngineInput::Channel(ChannelEvent::Disconnected)
                    }
                    Some(event) => EngineInput::Channel(event),
                    // Channel dropped without reporting the loss
                    None => {
                        channel_open = false;
                        EngineInput::Channel(ChannelEvent::Disconnected)
                    }
                },
                Some(tagged) = media_rx.recv() => EngineInput::Media(tagged),
                _ = wait_for_deadline(deadline) => EngineInput::SearchTimeout,
            };

            // Errors are already logged and turned into transitions.
            let _ = self.handle(input).await;
        }

        self.shutdown().await;
    }

    /// Applies one input. The returned error has already been handled
    /// (input dropped, or session closed); it is returned for the caller's
    /// information.
    pub async fn handle(&mut self, input: EngineInput) -> Result<(), NegotiationError> {
        let result = match input {
            EngineInput::Command(command) => self.on_command(command).await,
            EngineInput::Channel(ChannelEvent::Message(event)) => self.on_server_event(event).await,
            EngineInput::Channel(ChannelEvent::Disconnected) => {
                self.on_transport_lost().await;
                Ok(())
            }
            EngineInput::Media(tagged) => self.on_media_event(tagged).await,
            EngineInput::SearchTimeout => {
                self.on_search_timeout();
                Ok(())
            }
        };

        if let Err(e) = &result {
            if e.is_discardable() {
                tracing::debug!("Discarding input in state {}: {}", self.state, e);
            } else {
                self.abort(e.clone()).await;
            }
        }
        result
    }

    // ========================================================================
    // USER COMMANDS
    // ========================================================================

    async fn on_command(&mut self, command: UserCommand) -> Result<(), NegotiationError> {
        match command {
            UserCommand::FindPartner => {
                self.expect_state("find_partner", &[NegotiationState::Idle])?;

                if self.local_media.is_none() {
                    let acquired = self
                        .media
                        .acquire_local_media(&self.config.constraints)
                        .await;
                    match acquired {
                        Ok(media) => {
                            self.local_media = Some(media);
                            self.status("Camera and microphone ready", false);
                        }
                        Err(e) => {
                            tracing::error!("Error accessing media devices: {}", e);
                            self.status(
                                format!("Failed to access camera/microphone. {}", e),
                                true,
                            );
                            return Ok(());
                        }
                    }
                }

                self.send(ClientEvent::FindPartner);
                self.search_deadline = self.config.search_timeout.map(|t| Instant::now() + t);
                self.set_state(NegotiationState::Searching);
                Ok(())
            }

            UserCommand::StopSearch => {
                self.expect_state("stop_search", &[NegotiationState::Searching])?;
                self.send(ClientEvent::StopSearch);
                self.search_deadline = None;
                self.set_state(NegotiationState::Idle);
                Ok(())
            }

            UserCommand::Leave => {
                let room = self
                    .session
                    .as_ref()
                    .map(|s| s.room.clone())
                    .ok_or(NegotiationError::NoSession)?;
                self.send(ClientEvent::LeaveChat { room });
                self.teardown("You left the chat", false).await;
                Ok(())
            }

            UserCommand::SendChat(text) => {
                let message = text.trim();
                if message.is_empty() {
                    return Ok(());
                }
                let room = self
                    .session
                    .as_ref()
                    .map(|s| s.room.clone())
                    .ok_or(NegotiationError::NoSession)?;

                self.send(ClientEvent::ChatMessage {
                    room,
                    message: message.to_string(),
                });
                // Shown locally without waiting for a round trip
                self.publish(EngineEvent::Chat {
                    message: message.to_string(),
                    from_self: true,
                });
                Ok(())
            }
        }
    }

    // ========================================================================
    // SERVER EVENTS
    // ========================================================================

    async fn on_server_event(&mut self, event: ServerEvent) -> Result<(), NegotiationError> {
        match event {
            ServerEvent::Waiting => {
                self.expect_state("waiting", &[NegotiationState::Searching])?;
                self.status("Waiting for a partner...", false);
                Ok(())
            }

            ServerEvent::SearchStopped => {
                if self.state == NegotiationState::Searching {
                    self.search_deadline = None;
                    self.set_state(NegotiationState::Idle);
                }
                self.status("Search stopped", false);
                Ok(())
            }

            ServerEvent::PartnerFound { room, initiator } => {
                if self.state != NegotiationState::Searching {
                    // Matched after we stopped searching; release the peer.
                    tracing::warn!(
                        "partner_found for room {} while {}, leaving it",
                        room,
                        self.state
                    );
                    self.send(ClientEvent::LeaveChat { room });
                    return Ok(());
                }
                self.start_session(room, Role::from_initiator_flag(initiator))
                    .await
            }

            ServerEvent::Signal(signal) => self.on_signal(signal).await,

            ServerEvent::PartnerLeft { room } => {
                let session_room = self
                    .session
                    .as_ref()
                    .map(|s| s.room.clone())
                    .ok_or(NegotiationError::InvalidState {
                        event: "partner_left",
                        state: self.state,
                    })?;
                if let Some(room) = room {
                    if room != session_room {
                        return Err(NegotiationError::RoomMismatch(room));
                    }
                }
                tracing::info!("Partner left room {}", session_room);
                self.teardown("Your partner has left", false).await;
                Ok(())
            }

            ServerEvent::ChatMessage { message } => {
                if self.session.is_none() {
                    return Err(NegotiationError::InvalidState {
                        event: "chat_message",
                        state: self.state,
                    });
                }
                self.publish(EngineEvent::Chat {
                    message,
                    from_self: false,
                });
                Ok(())
            }

            ServerEvent::UserCount { count } => {
                self.publish(EngineEvent::UserCount(count));
                Ok(())
            }
        }
    }

    async fn start_session(&mut self, room: RoomId, role: Role) -> Result<(), NegotiationError> {
        self.search_deadline = None;
        self.epoch += 1;
        let sink = MediaEventSink::new(self.epoch, self.media_tx.clone());

        let opened = self.media.open_session(sink).await;
        let media = match opened {
            Ok(media) => media,
            Err(e) => {
                tracing::error!("Error creating media session: {}", e);
                self.send(ClientEvent::LeaveChat { room });
                self.set_state(NegotiationState::Closed);
                self.set_state(NegotiationState::Idle);
                self.status("Failed to create connection", true);
                return Ok(());
            }
        };

        tracing::info!("Paired in room {} as {:?}", room, role);
        self.session = Some(SessionContext {
            room,
            role,
            epoch: self.epoch,
            media,
            remote_description_applied: false,
            pending_candidates: Vec::new(),
            in_flight: false,
        });
        self.status("Partner found! Connecting...", false);

        match role {
            Role::Initiator => {
                self.set_state(NegotiationState::PairedInitiator);
                self.send_offer().await
            }
            Role::Responder => {
                self.set_state(NegotiationState::PairedResponder);
                Ok(())
            }
        }
    }

    // ========================================================================
    // SIGNALING
    // ========================================================================

    async fn on_signal(&mut self, signal: SignalMessage) -> Result<(), NegotiationError> {
        let session = self
            .session
            .as_ref()
            .ok_or(NegotiationError::InvalidState {
                event: signal.kind(),
                state: self.state,
            })?;
        if signal.room() != &session.room {
            return Err(NegotiationError::RoomMismatch(signal.room().clone()));
        }

        match signal {
            SignalMessage::Offer { payload, .. } => {
                self.expect_state("offer", &[NegotiationState::PairedResponder])?;
                self.answer_offer(payload).await
            }
            SignalMessage::Answer { payload, .. } => {
                self.expect_state("answer", &[NegotiationState::OfferSent])?;
                self.apply_answer(payload).await
            }
            SignalMessage::Candidate { payload, .. } => self.apply_remote_candidate(payload).await,
        }
    }

    async fn send_offer(&mut self) -> Result<(), NegotiationError> {
        let limit = self.config.negotiation_timeout;
        let session = self.begin_operation()?;

        let result = async {
            let offer = bounded(limit, "create offer", session.media.create_offer()).await?;
            bounded(
                limit,
                "set local description",
                session.media.set_local_description(offer.clone()),
            )
            .await?;
            Ok::<_, NegotiationError>(offer)
        }
        .await;
        session.in_flight = false;
        let offer = result?;

        let room = session.room.clone();
        self.send(ClientEvent::Signal(SignalMessage::Offer {
            room,
            payload: offer,
        }));
        tracing::info!("Created and sent offer");
        self.set_state(NegotiationState::OfferSent);
        Ok(())
    }

    async fn answer_offer(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
        let limit = self.config.negotiation_timeout;
        let session = self.begin_operation()?;

        let result = async {
            bounded(
                limit,
                "set remote description",
                session.media.set_remote_description(offer),
            )
            .await?;
            session.remote_description_applied = true;
            Self::replay_candidates(&mut *session, limit).await?;

            let answer = bounded(limit, "create answer", session.media.create_answer()).await?;
            bounded(
                limit,
                "set local description",
                session.media.set_local_description(answer.clone()),
            )
            .await?;
            Ok::<_, NegotiationError>(answer)
        }
        .await;
        session.in_flight = false;
        let answer = result?;

        let room = session.room.clone();
        self.send(ClientEvent::Signal(SignalMessage::Answer {
            room,
            payload: answer,
        }));
        tracing::info!("Created and sent answer");
        self.set_state(NegotiationState::AnswerSent);
        Ok(())
    }

    async fn apply_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        let limit = self.config.negotiation_timeout;
        let session = self.begin_operation()?;

        let result = async {
            bounded(
                limit,
                "set remote description",
                session.media.set_remote_description(answer),
            )
            .await?;
            session.remote_description_applied = true;
            Self::replay_candidates(&mut *session, limit).await?;
            Ok::<_, NegotiationError>(())
        }
        .await;
        session.in_flight = false;
        result?;

        self.set_state(NegotiationState::Connected);
        self.status("Connected to partner", false);
        Ok(())
    }

    async fn apply_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        let limit = self.config.negotiation_timeout;
        let session = self.begin_operation()?;

        if !session.remote_description_applied {
            tracing::debug!("Buffering remote candidate until remote description is set");
            session.pending_candidates.push(candidate);
            session.in_flight = false;
            return Ok(());
        }

        let result = bounded(
            limit,
            "add ice candidate",
            session.media.add_ice_candidate(candidate),
        )
        .await;
        session.in_flight = false;
        result
    }

    /// Applies buffered candidates in arrival order
    async fn replay_candidates(
        session: &mut SessionContext,
        limit: Duration,
    ) -> Result<(), NegotiationError> {
        let pending = std::mem::take(&mut session.pending_candidates);
        if !pending.is_empty() {
            tracing::debug!("Replaying {} buffered candidate(s)", pending.len());
        }
        for candidate in pending {
            bounded(
                limit,
                "add ice candidate",
                session.media.add_ice_candidate(candidate),
            )
            .await?;
        }
        Ok(())
    }

    // ========================================================================
    // MEDIA EVENTS
    // ========================================================================

    async fn on_media_event(&mut self, tagged: TaggedMediaEvent) -> Result<(), NegotiationError> {
        let Some(session) = self.session.as_ref() else {
            tracing::debug!("Dropping media event without a session");
            return Ok(());
        };
        if session.epoch != tagged.epoch {
            tracing::debug!(
                "Dropping media event from epoch {} (current {})",
                tagged.epoch,
                session.epoch
            );
            return Ok(());
        }

        match tagged.event {
            MediaEvent::IceCandidate(candidate) => {
                let room = session.room.clone();
                self.send(ClientEvent::Signal(SignalMessage::Candidate {
                    room,
                    payload: candidate,
                }));
            }
            MediaEvent::Track(track) => {
                tracing::info!("Received remote stream");
                self.publish(EngineEvent::RemoteTrack(track));
            }
            MediaEvent::ConnectionState(ConnectionState::Connected) => {
                if self.state == NegotiationState::AnswerSent {
                    self.set_state(NegotiationState::Connected);
                }
                self.status("Connected to partner", false);
            }
            MediaEvent::ConnectionState(ConnectionState::Disconnected) => {
                self.status("Connection issues with partner", false);
            }
            MediaEvent::ConnectionState(ConnectionState::Failed) => {
                let room = session.room.clone();
                tracing::warn!("Peer connection failed in room {}", room);
                self.send(ClientEvent::LeaveChat { room });
                self.teardown("Connection to partner failed", true).await;
            }
            MediaEvent::ConnectionState(state) => {
                tracing::debug!("Peer connection state: {:?}", state);
            }
        }
        Ok(())
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    async fn on_transport_lost(&mut self) {
        tracing::info!("Disconnected from server");
        self.search_deadline = None;
        if self.state.is_paired() || self.session.is_some() {
            self.teardown("Disconnected from server", true).await;
        } else {
            self.set_state(NegotiationState::Idle);
            self.status("Disconnected from server", true);
        }
    }

    fn on_search_timeout(&mut self) {
        self.search_deadline = None;
        if self.state != NegotiationState::Searching {
            return;
        }
        tracing::info!("No partner found in time, stopping search");
        self.send(ClientEvent::StopSearch);
        self.set_state(NegotiationState::Idle);
        self.status("No partner found, search stopped", false);
    }

    /// Leaves the room and tears the session down after a failure
    async fn abort(&mut self, error: NegotiationError) {
        tracing::error!("Negotiation failed: {}", error);
        if let Some(room) = self.session.as_ref().map(|s| s.room.clone()) {
            self.send(ClientEvent::LeaveChat { room });
        }
        self.teardown(format!("Connection failed: {}", error), true)
            .await;
    }

    async fn teardown(&mut self, message: impl Into<String>, is_error: bool) {
        if let Some(session) = self.session.take() {
            session.media.close().await;
            tracing::info!("Closed session in room {}", session.room);
        }
        self.search_deadline = None;
        self.set_state(NegotiationState::Closed);
        self.set_state(NegotiationState::Idle);
        self.status(message, is_error);
    }

    async fn shutdown(&mut self) {
        if let Some(room) = self.session.as_ref().map(|s| s.room.clone()) {
            self.send(ClientEvent::LeaveChat { room });
            self.teardown("Chat closed", false).await;
        } else if self.state == NegotiationState::Searching {
            self.send(ClientEvent::StopSearch);
            self.set_state(NegotiationState::Idle);
        }
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn begin_operation(&mut self) -> Result<&mut SessionContext, NegotiationError> {
        let session = self.session.as_mut().ok_or(NegotiationError::NoSession)?;
        if session.in_flight {
            return Err(NegotiationError::OperationInFlight);
        }
        session.in_flight = true;
        Ok(session)
    }

    fn expect_state(
        &self,
        event: &'static str,
        allowed: &[NegotiationState],
    ) -> Result<(), NegotiationError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(NegotiationError::InvalidState {
                event,
                state: self.state,
            })
        }
    }

    fn set_state(&mut self, new_state: NegotiationState) {
        if self.state == new_state {
            return;
        }
        tracing::debug!("Negotiation state: {} -> {}", self.state, new_state);
        self.state = new_state;
        self.publish(EngineEvent::StateChanged(new_state));
    }

    fn status(&self, message: impl Into<String>, is_error: bool) {
        self.publish(EngineEvent::Status {
            message: message.into(),
            is_error,
        });
    }

    fn send(&self, event: ClientEvent) {
        if self.outbound.send(event).is_err() {
            tracing::warn!("Signal channel closed, dropping outgoing event");
        }
    }

    fn publish(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl std::fmt::Debug for NegotiationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationEngine")
            .field("state", &self.state)
            .field("room", &self.room())
            .field("epoch", &self.epoch)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{LocalTrack, MediaError, TrackKind};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    type CallLog = Arc<Mutex<Vec<String>>>;

    #[derive(Default)]
    struct ScriptedMedia {
        log: CallLog,
        fail_acquire: bool,
        fail_open: bool,
    }

    struct ScriptedSession {
        log: CallLog,
    }

    #[async_trait]
    impl MediaCapability for ScriptedMedia {
        async fn acquire_local_media(
            &self,
            _constraints: &crate::config::MediaConstraints,
        ) -> Result<LocalMedia, MediaError> {
            if self.fail_acquire {
                return Err(MediaError::PermissionDenied);
            }
            self.log.lock().push("acquire".to_string());
            Ok(LocalMedia {
                tracks: vec![LocalTrack {
                    id: "audio".to_string(),
                    kind: TrackKind::Audio,
                }],
            })
        }

        async fn open_session(
            &self,
            _events: MediaEventSink,
        ) -> Result<Box<dyn MediaSession>, MediaError> {
            if self.fail_open {
                return Err(MediaError::Backend("no peer connection".to_string()));
            }
            self.log.lock().push("open".to_string());
            Ok(Box::new(ScriptedSession {
                log: Arc::clone(&self.log),
            }))
        }
    }

    #[async_trait]
    impl MediaSession for ScriptedSession {
        async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
            self.log.lock().push("create_offer".to_string());
            Ok(SessionDescription::offer("v=0 offer"))
        }

        async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
            self.log.lock().push("create_answer".to_string());
            Ok(SessionDescription::answer("v=0 answer"))
        }

        async fn set_local_description(
            &self,
            _description: SessionDescription,
        ) -> Result<(), NegotiationError> {
            self.log.lock().push("set_local".to_string());
            Ok(())
        }

        async fn set_remote_description(
            &self,
            description: SessionDescription,
        ) -> Result<(), NegotiationError> {
            if description.sdp == "reject" {
                return Err(NegotiationError::rejected(
                    "set remote description",
                    "unparseable sdp",
                ));
            }
            self.log.lock().push("set_remote".to_string());
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
            self.log
                .lock()
                .push(format!("add_candidate:{}", candidate.candidate));
            Ok(())
        }

        async fn close(&self) {
            self.log.lock().push("close".to_string());
        }
    }

    struct Harness {
        engine: NegotiationEngine,
        outbound: mpsc::UnboundedReceiver<ClientEvent>,
        events: broadcast::Receiver<EngineEvent>,
        log: CallLog,
    }

    impl Harness {
        fn new(media: ScriptedMedia) -> Self {
            Self::with_config(media, ClientConfig::default())
        }

        fn with_config(media: ScriptedMedia, config: ClientConfig) -> Self {
            let log = Arc::clone(&media.log);
            let (tx, outbound) = mpsc::unbounded_channel();
            let engine = NegotiationEngine::new(config, Arc::new(media), tx);
            let events = engine.subscribe();
            Self {
                engine,
                outbound,
                events,
                log,
            }
        }

        async fn command(&mut self, command: UserCommand) -> Result<(), NegotiationError> {
            self.engine.handle(EngineInput::Command(command)).await
        }

        async fn server(&mut self, event: ServerEvent) -> Result<(), NegotiationError> {
            self.engine
                .handle(EngineInput::Channel(ChannelEvent::Message(event)))
                .await
        }

        async fn pair(&mut self, room: &str, initiator: bool) {
            self.command(UserCommand::FindPartner).await.unwrap();
            self.server(ServerEvent::PartnerFound {
                room: RoomId::from(room),
                initiator,
            })
            .await
            .unwrap();
        }

        fn sent(&mut self) -> Vec<ClientEvent> {
            let mut sent = Vec::new();
            while let Ok(event) = self.outbound.try_recv() {
                sent.push(event);
            }
            sent
        }

        fn published(&mut self) -> Vec<EngineEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }

        fn calls(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    fn candidate(text: &str) -> IceCandidate {
        IceCandidate {
            candidate: text.to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn test_initiator_handshake() {
        let mut h = Harness::new(ScriptedMedia::default());
        h.pair("r1", true).await;

        assert_eq!(h.engine.state(), NegotiationState::OfferSent);
        assert_eq!(h.engine.role(), Some(Role::Initiator));
        assert_eq!(
            h.sent(),
            vec![
                ClientEvent::FindPartner,
                ClientEvent::Signal(SignalMessage::Offer {
                    room: RoomId::from("r1"),
                    payload: SessionDescription::offer("v=0 offer"),
                }),
            ]
        );

        h.server(ServerEvent::Signal(SignalMessage::Answer {
            room: RoomId::from("r1"),
            payload: SessionDescription::answer("v=0 answer"),
        }))
        .await
        .unwrap();

        assert_eq!(h.engine.state(), NegotiationState::Connected);
        assert_eq!(
            h.calls(),
            vec!["acquire", "open", "create_offer", "set_local", "set_remote"]
        );
    }

    #[tokio::test]
    async fn test_responder_buffers_early_candidates() {
        let mut h = Harness::new(ScriptedMedia::default());
        h.pair("r1", false).await;
        assert_eq!(h.engine.state(), NegotiationState::PairedResponder);

        h.server(ServerEvent::Signal(SignalMessage::Candidate {
            room: RoomId::from("r1"),
            payload: candidate("c1"),
        }))
        .await
        .unwrap();
        assert_eq!(h.engine.pending_candidates(), 1);
        assert!(!h.calls().iter().any(|c| c.starts_with("add_candidate")));

        h.server(ServerEvent::Signal(SignalMessage::Offer {
            room: RoomId::from("r1"),
            payload: SessionDescription::offer("v=0 offer"),
        }))
        .await
        .unwrap();

        assert_eq!(h.engine.state(), NegotiationState::AnswerSent);
        assert_eq!(h.engine.pending_candidates(), 0);
        assert_eq!(
            h.calls(),
            vec![
                "acquire",
                "open",
                "set_remote",
                "add_candidate:c1",
                "create_answer",
                "set_local"
            ]
        );
        assert_eq!(
            h.sent().last(),
            Some(&ClientEvent::Signal(SignalMessage::Answer {
                room: RoomId::from("r1"),
                payload: SessionDescription::answer("v=0 answer"),
            }))
        );

        // Candidates after the remote description go straight through
        h.server(ServerEvent::Signal(SignalMessage::Candidate {
            room: RoomId::from("r1"),
            payload: candidate("c2"),
        }))
        .await
        .unwrap();
        assert_eq!(h.calls().last().map(String::as_str), Some("add_candidate:c2"));

        h.engine
            .handle(EngineInput::Media(TaggedMediaEvent {
                epoch: 1,
                event: MediaEvent::ConnectionState(ConnectionState::Connected),
            }))
            .await
            .unwrap();
        assert_eq!(h.engine.state(), NegotiationState::Connected);
    }

    #[tokio::test]
    async fn test_out_of_state_answer_is_discarded() {
        let mut h = Harness::new(ScriptedMedia::default());
        h.pair("r1", false).await;
        h.sent();

        let result = h
            .server(ServerEvent::Signal(SignalMessage::Answer {
                room: RoomId::from("r1"),
                payload: SessionDescription::answer("v=0 answer"),
            }))
            .await;

        assert!(matches!(result, Err(NegotiationError::InvalidState { .. })));
        assert_eq!(h.engine.state(), NegotiationState::PairedResponder);
        assert_eq!(h.calls(), vec!["acquire", "open"]);
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_offer_is_discarded() {
        let mut h = Harness::new(ScriptedMedia::default());
        h.pair("r1", false).await;
        let offer = ServerEvent::Signal(SignalMessage::Offer {
            room: RoomId::from("r1"),
            payload: SessionDescription::offer("v=0 offer"),
        });
        h.server(offer.clone()).await.unwrap();
        let calls = h.calls().len();

        assert!(h.server(offer).await.is_err());
        assert_eq!(h.engine.state(), NegotiationState::AnswerSent);
        assert_eq!(h.calls().len(), calls);
    }

    #[tokio::test]
    async fn test_signal_for_other_room_is_discarded() {
        let mut h = Harness::new(ScriptedMedia::default());
        h.pair("r1", false).await;

        let result = h
            .server(ServerEvent::Signal(SignalMessage::Offer {
                room: RoomId::from("r0"),
                payload: SessionDescription::offer("v=0 offer"),
            }))
            .await;

        assert_eq!(result, Err(NegotiationError::RoomMismatch(RoomId::from("r0"))));
        assert_eq!(h.engine.state(), NegotiationState::PairedResponder);
    }

    #[tokio::test]
    async fn test_partner_left_returns_to_idle() {
        let mut h = Harness::new(ScriptedMedia::default());
        h.pair("r1", true).await;

        let stale = h
            .server(ServerEvent::PartnerLeft {
                room: Some(RoomId::from("r0")),
            })
            .await;
        assert!(stale.is_err());
        assert_eq!(h.engine.state(), NegotiationState::OfferSent);

        h.published();
        h.server(ServerEvent::PartnerLeft {
            room: Some(RoomId::from("r1")),
        })
        .await
        .unwrap();

        assert_eq!(h.engine.state(), NegotiationState::Idle);
        assert_eq!(h.engine.room(), None);
        assert_eq!(h.calls().last().map(String::as_str), Some("close"));
        assert_eq!(
            h.published(),
            vec![
                EngineEvent::StateChanged(NegotiationState::Closed),
                EngineEvent::StateChanged(NegotiationState::Idle),
                EngineEvent::Status {
                    message: "Your partner has left".to_string(),
                    is_error: false,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_stale_epoch_events_dropped() {
        let mut h = Harness::new(ScriptedMedia::default());
        h.pair("r1", true).await;
        h.command(UserCommand::Leave).await.unwrap();
        h.pair("r2", true).await;
        h.sent();

        let local = |epoch| {
            EngineInput::Media(TaggedMediaEvent {
                epoch,
                event: MediaEvent::IceCandidate(candidate("local")),
            })
        };

        h.engine.handle(local(1)).await.unwrap();
        assert!(h.sent().is_empty());

        h.engine.handle(local(2)).await.unwrap();
        assert_eq!(
            h.sent(),
            vec![ClientEvent::Signal(SignalMessage::Candidate {
                room: RoomId::from("r2"),
                payload: candidate("local"),
            })]
        );
    }

    #[tokio::test]
    async fn test_media_acquisition_failure_stays_idle() {
        let mut h = Harness::new(ScriptedMedia {
            fail_acquire: true,
            ..Default::default()
        });

        h.command(UserCommand::FindPartner).await.unwrap();

        assert_eq!(h.engine.state(), NegotiationState::Idle);
        assert!(h.sent().is_empty());
        assert!(h.published().iter().any(|e| matches!(
            e,
            EngineEvent::Status { message, is_error: true }
                if message.starts_with("Failed to access camera/microphone.")
        )));
    }

    #[tokio::test]
    async fn test_session_open_failure_releases_room() {
        let mut h = Harness::new(ScriptedMedia {
            fail_open: true,
            ..Default::default()
        });
        h.pair("r1", true).await;

        assert_eq!(h.engine.state(), NegotiationState::Idle);
        assert_eq!(
            h.sent(),
            vec![
                ClientEvent::FindPartner,
                ClientEvent::LeaveChat {
                    room: RoomId::from("r1")
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_rejected_offer_closes_session() {
        let mut h = Harness::new(ScriptedMedia::default());
        h.pair("r1", false).await;
        h.sent();

        let result = h
            .server(ServerEvent::Signal(SignalMessage::Offer {
                room: RoomId::from("r1"),
                payload: SessionDescription::offer("reject"),
            }))
            .await;

        assert!(matches!(result, Err(NegotiationError::Rejected { .. })));
        assert_eq!(h.engine.state(), NegotiationState::Idle);
        assert_eq!(
            h.sent(),
            vec![ClientEvent::LeaveChat {
                room: RoomId::from("r1")
            }]
        );
        assert_eq!(h.calls().last().map(String::as_str), Some("close"));
    }

    #[tokio::test]
    async fn test_connection_failure_leaves_room() {
        let mut h = Harness::new(ScriptedMedia::default());
        h.pair("r1", true).await;
        h.sent();

        h.engine
            .handle(EngineInput::Media(TaggedMediaEvent {
                epoch: 1,
                event: MediaEvent::ConnectionState(ConnectionState::Failed),
            }))
            .await
            .unwrap();

        assert_eq!(h.engine.state(), NegotiationState::Idle);
        assert_eq!(
            h.sent(),
            vec![ClientEvent::LeaveChat {
                room: RoomId::from("r1")
            }]
        );
    }

    #[tokio::test]
    async fn test_chat_is_trimmed_and_echoed() {
        let mut h = Harness::new(ScriptedMedia::default());
        h.pair("r1", true).await;
        h.sent();
        h.published();

        h.command(UserCommand::SendChat("  hi there ".to_string()))
            .await
            .unwrap();
        h.command(UserCommand::SendChat("   ".to_string()))
            .await
            .unwrap();
        h.server(ServerEvent::ChatMessage {
            message: "hello".to_string(),
        })
        .await
        .unwrap();

        assert_eq!(
            h.sent(),
            vec![ClientEvent::ChatMessage {
                room: RoomId::from("r1"),
                message: "hi there".to_string(),
            }]
        );
        assert_eq!(
            h.published(),
            vec![
                EngineEvent::Chat {
                    message: "hi there".to_string(),
                    from_self: true,
                },
                EngineEvent::Chat {
                    message: "hello".to_string(),
                    from_self: false,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_late_partner_found_is_released() {
        let mut h = Harness::new(ScriptedMedia::default());
        h.command(UserCommand::FindPartner).await.unwrap();
        h.command(UserCommand::StopSearch).await.unwrap();
        h.sent();

        h.server(ServerEvent::PartnerFound {
            room: RoomId::from("r1"),
            initiator: false,
        })
        .await
        .unwrap();

        assert_eq!(h.engine.state(), NegotiationState::Idle);
        assert_eq!(
            h.sent(),
            vec![ClientEvent::LeaveChat {
                room: RoomId::from("r1")
            }]
        );
        assert_eq!(h.calls(), vec!["acquire"]);
    }

    #[tokio::test]
    async fn test_transport_loss_tears_down() {
        let mut h = Harness::new(ScriptedMedia::default());
        h.pair("r1", true).await;

        h.engine
            .handle(EngineInput::Channel(ChannelEvent::Disconnected))
            .await
            .unwrap();

        assert_eq!(h.engine.state(), NegotiationState::Idle);
        assert_eq!(h.calls().last().map(String::as_str), Some("close"));
        assert!(h.published().contains(&EngineEvent::Status {
            message: "Disconnected from server".to_string(),
            is_error: true,
        }));
    }

    #[tokio::test]
    async fn test_stray_answer_after_partner_left_is_discarded() {
        let mut h = Harness::new(ScriptedMedia::default());
        h.pair("r1", true).await;
        assert_eq!(h.engine.state(), NegotiationState::OfferSent);

        h.server(ServerEvent::PartnerLeft {
            room: Some(RoomId::from("r1")),
        })
        .await
        .unwrap();
        assert_eq!(h.engine.state(), NegotiationState::Idle);
        let calls = h.calls();
        h.sent();

        let result = h
            .server(ServerEvent::Signal(SignalMessage::Answer {
                room: RoomId::from("r1"),
                payload: SessionDescription::answer("v=0 answer"),
            }))
            .await;

        assert!(matches!(
            result,
            Err(NegotiationError::InvalidState {
                event: "answer",
                state: NegotiationState::Idle,
            })
        ));
        assert_eq!(h.engine.state(), NegotiationState::Idle);
        assert_eq!(h.calls(), calls);
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn test_transport_loss_while_searching_returns_to_idle() {
        let mut h = Harness::new(ScriptedMedia::default());
        h.command(UserCommand::FindPartner).await.unwrap();

        h.engine
            .handle(EngineInput::Channel(ChannelEvent::Disconnected))
            .await
            .unwrap();

        assert_eq!(h.engine.state(), NegotiationState::Idle);
        assert_eq!(h.calls(), vec!["acquire"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_loss_reported_once() {
        let Harness {
            engine,
            mut events,
            ..
        } = Harness::new(ScriptedMedia::default());

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(engine.run(commands_rx, inbound_rx));

        // What SignalChannel's read task does when the socket closes
        inbound_tx.send(ChannelEvent::Disconnected).unwrap();
        drop(inbound_tx);
        tokio::time::sleep(Duration::from_millis(50)).await;

        drop(commands_tx);
        task.await.unwrap();

        let mut lost = 0;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::Status { message, .. } = event {
                if message == "Disconnected from server" {
                    lost += 1;
                }
            }
        }
        assert_eq!(lost, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_times_out() {
        let config = ClientConfig {
            search_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let Harness {
            engine,
            mut outbound,
            ..
        } = Harness::with_config(ScriptedMedia::default(), config);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (_inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(engine.run(commands_rx, inbound_rx));

        commands_tx.send(UserCommand::FindPartner).unwrap();
        assert_eq!(outbound.recv().await, Some(ClientEvent::FindPartner));
        assert_eq!(outbound.recv().await, Some(ClientEvent::StopSearch));

        drop(commands_tx);
        task.await.unwrap();
    }
}
