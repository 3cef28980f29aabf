//! Session coordinator
//!
//! Owns every piece of server state:
//! - connected participants and their outboxes
//! - the waiting pool
//! - active rooms, each behind its own lock
//!
//! Lock order is waiting pool, then a room, then the room map, then the
//! participant table. A room lock is never taken while the room map is held.

use super::session::{RelayError, Session, SessionInfo};
use crate::config::PairingPolicy;
use crate::protocol::{ParticipantId, RoomId, ServerEvent, SignalMessage};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;

struct Participant {
    outbox: mpsc::UnboundedSender<ServerEvent>,
    room: Option<RoomId>,
}

pub struct SessionCoordinator {
    policy: PairingPolicy,
    participants: RwLock<HashMap<ParticipantId, Participant>>,
    waiting: Mutex<VecDeque<ParticipantId>>,
    rooms: RwLock<HashMap<RoomId, Arc<Mutex<Session>>>>,
}

impl SessionCoordinator {
    pub fn new(policy: PairingPolicy) -> Self {
        Self {
            policy,
            participants: RwLock::new(HashMap::new()),
            waiting: Mutex::new(VecDeque::new()),
            rooms: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> PairingPolicy {
        self.policy
    }

    // ========================================================================
    // CONNECTION LIFECYCLE
    // ========================================================================

    /// Registers a new connection. Everything addressed to it arrives on the
    /// returned receiver.
    pub fn connect(&self) -> (ParticipantId, mpsc::UnboundedReceiver<ServerEvent>) {
        let id = ParticipantId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.participants.write().insert(
            id,
            Participant {
                outbox: tx,
                room: None,
            },
        );

        tracing::info!("Participant connected: {}", id);
        self.broadcast_user_count();
        (id, rx)
    }

    /// Removes a connection: drops it from the pool, leaves its room and
    /// updates the online count.
    pub fn disconnect(&self, participant: ParticipantId) {
        {
            let mut waiting = self.waiting.lock();
            waiting.retain(|p| *p != participant);
        }

        if let Some(room) = self.room_of(participant) {
            if let Err(e) = self.leave(&room, participant) {
                tracing::debug!("Leave on disconnect of {}: {}", participant, e);
            }
        }

        if self.participants.write().remove(&participant).is_some() {
            tracing::info!("Participant disconnected: {}", participant);
            self.broadcast_user_count();
        }
    }

    // ========================================================================
    // MATCHMAKING
    // ========================================================================

    /// Pairs the participant with someone from the pool, or parks it there.
    ///
    /// A participant already in a room leaves it first. The requester becomes
    /// the initiator.
    pub fn request_partner(&self, participant: ParticipantId) -> Result<(), RelayError> {
        if !self.is_connected(participant) {
            return Err(RelayError::UnknownParticipant(participant));
        }
        if let Some(room) = self.room_of(participant) {
            if let Err(e) = self.leave(&room, participant) {
                tracing::debug!("Implicit leave of {} failed: {}", room, e);
            }
        }

        let mut waiting = self.waiting.lock();
        waiting.retain(|p| *p != participant);

        let partner = loop {
            let candidate = match self.policy {
                PairingPolicy::Fifo => waiting.pop_front(),
                PairingPolicy::Random if waiting.is_empty() => None,
                PairingPolicy::Random => {
                    let index = rand::thread_rng().gen_range(0..waiting.len());
                    waiting.remove(index)
                }
            };
            match candidate {
                Some(candidate) if !self.is_connected(candidate) => continue,
                other => break other,
            }
        };

        let Some(partner) = partner else {
            waiting.push_back(participant);
            drop(waiting);
            tracing::debug!("Participant {} waiting for a partner", participant);
            self.send_to(participant, ServerEvent::Waiting);
            return Ok(());
        };

        let room = RoomId::generate();
        let mut session = Session::new(room.clone(), participant);
        session.admit(partner)?;
        self.rooms
            .write()
            .insert(room.clone(), Arc::new(Mutex::new(session)));
        self.assign_room(participant, Some(room.clone()));
        self.assign_room(partner, Some(room.clone()));
        drop(waiting);

        tracing::info!(
            "Paired {} (initiator) with {} in room {}",
            participant,
            partner,
            room
        );
        self.send_to(
            participant,
            ServerEvent::PartnerFound {
                room: room.clone(),
                initiator: true,
            },
        );
        self.send_to(
            partner,
            ServerEvent::PartnerFound {
                room,
                initiator: false,
            },
        );
        Ok(())
    }

    /// Withdraws from the pool. Returns false when the participant was not
    /// waiting.
    pub fn cancel_search(&self, participant: ParticipantId) -> bool {
        let removed = {
            let mut waiting = self.waiting.lock();
            let before = waiting.len();
            waiting.retain(|p| *p != participant);
            waiting.len() != before
        };

        if removed {
            tracing::debug!("Participant {} stopped searching", participant);
            self.send_to(participant, ServerEvent::SearchStopped);
        }
        removed
    }

    /// Admits a participant into an existing room.
    pub fn join_room(&self, room: &RoomId, participant: ParticipantId) -> Result<(), RelayError> {
        if !self.is_connected(participant) {
            return Err(RelayError::UnknownParticipant(participant));
        }
        let session = self.lookup(room)?;
        session.lock().admit(participant)?;
        self.assign_room(participant, Some(room.clone()));
        Ok(())
    }

    // ========================================================================
    // RELAY
    // ========================================================================

    /// Forwards a signal to the other member of its room. The room lock is
    /// held across the send so signals within a room keep their order.
    pub fn relay_signal(
        &self,
        sender: ParticipantId,
        message: SignalMessage,
    ) -> Result<(), RelayError> {
        let session = self.lookup(message.room())?;
        let session = session.lock();
        if let Some(peer) = session.peer_of(sender)? {
            tracing::trace!(
                "Relaying {} in room {} from {} to {}",
                message.kind(),
                session.room_id(),
                sender,
                peer
            );
            self.send_to(peer, ServerEvent::Signal(message));
        }
        Ok(())
    }

    /// Forwards a chat line to the other member only. Empty lines are
    /// refused.
    pub fn relay_chat(
        &self,
        room: &RoomId,
        sender: ParticipantId,
        message: String,
    ) -> Result<(), RelayError> {
        if message.trim().is_empty() {
            return Err(RelayError::EmptyMessage);
        }
        let session = self.lookup(room)?;
        let session = session.lock();
        if let Some(peer) = session.peer_of(sender)? {
            self.send_to(peer, ServerEvent::ChatMessage { message });
        }
        Ok(())
    }

    /// Destroys the room and tells the remaining member. A second call for
    /// the same room fails with `UnknownRoom` and sends nothing.
    pub fn leave(&self, room: &RoomId, participant: ParticipantId) -> Result<(), RelayError> {
        let session = self.lookup(room)?;
        let peer = {
            let mut session = session.lock();
            let peer = session.close_by(participant)?;
            self.rooms.write().remove(room);
            peer
        };

        self.clear_room(participant, room);
        tracing::info!("Participant {} left room {}", participant, room);

        if let Some(peer) = peer {
            self.clear_room(peer, room);
            self.send_to(
                peer,
                ServerEvent::PartnerLeft {
                    room: Some(room.clone()),
                },
            );
        }
        Ok(())
    }

    // ========================================================================
    // INTROSPECTION
    // ========================================================================

    pub fn user_count(&self) -> usize {
        self.participants.read().len()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.lock().len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    pub fn session(&self, room: &RoomId) -> Option<SessionInfo> {
        let session = self.rooms.read().get(room).cloned()?;
        let info = session.lock().info();
        Some(info)
    }

    pub fn room_of(&self, participant: ParticipantId) -> Option<RoomId> {
        self.participants
            .read()
            .get(&participant)
            .and_then(|p| p.room.clone())
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn is_connected(&self, participant: ParticipantId) -> bool {
        self.participants.read().contains_key(&participant)
    }

    fn lookup(&self, room: &RoomId) -> Result<Arc<Mutex<Session>>, RelayError> {
        self.rooms
            .read()
            .get(room)
            .cloned()
            .ok_or_else(|| RelayError::UnknownRoom(room.clone()))
    }

    fn assign_room(&self, participant: ParticipantId, room: Option<RoomId>) {
        if let Some(entry) = self.participants.write().get_mut(&participant) {
            entry.room = room;
        }
    }

    /// Clears the membership only if it still points at `room`.
    fn clear_room(&self, participant: ParticipantId, room: &RoomId) {
        if let Some(entry) = self.participants.write().get_mut(&participant) {
            if entry.room.as_ref() == Some(room) {
                entry.room = None;
            }
        }
    }

    fn send_to(&self, participant: ParticipantId, event: ServerEvent) {
        let participants = self.participants.read();
        let Some(entry) = participants.get(&participant) else {
            tracing::debug!("Dropping event for departed participant {}", participant);
            return;
        };
        if entry.outbox.send(event).is_err() {
            tracing::debug!("Outbox closed for participant {}", participant);
        }
    }

    fn broadcast_user_count(&self) {
        let participants = self.participants.read();
        let count = participants.len();
        for entry in participants.values() {
            let _ = entry.outbox.send(ServerEvent::UserCount { count });
        }
    }
}

impl Default for SessionCoordinator {
    fn default() -> Self {
        Self::new(PairingPolicy::default())
    }
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("policy", &self.policy)
            .field("participants", &self.user_count())
            .field("waiting", &self.waiting_count())
            .field("rooms", &self.room_count())
            .finish()
    }
}
