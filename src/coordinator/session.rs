use crate::protocol::{ParticipantId, RoomId};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Members per room
pub const MAX_MEMBERS: usize = 2;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Expected under races such as simultaneous leave; callers drop these
/// silently.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Unknown room {0}")]
    UnknownRoom(RoomId),

    #[error("Participant {participant} is not a member of room {room}")]
    NotMember {
        room: RoomId,
        participant: ParticipantId,
    },

    #[error("Room {0} already has {MAX_MEMBERS} members")]
    RoomFull(RoomId),

    #[error("Unknown participant {0}")]
    UnknownParticipant(ParticipantId),

    #[error("Empty chat message")]
    EmptyMessage,
}

// ============================================================================
// SESSION
// ============================================================================

/// One chat between two participants. The first member is the initiator.
#[derive(Debug)]
pub struct Session {
    room_id: RoomId,
    members: Vec<ParticipantId>,
    created_at: DateTime<Utc>,
    closed: bool,
}

/// Read-only snapshot of a [`Session`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub room_id: RoomId,
    pub participant_a: ParticipantId,
    pub participant_b: Option<ParticipantId>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(room_id: RoomId, initiator: ParticipantId) -> Self {
        Self {
            room_id,
            members: vec![initiator],
            created_at: Utc::now(),
            closed: false,
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_member(&self, participant: ParticipantId) -> bool {
        self.members.contains(&participant)
    }

    /// Adds a member. Re-admitting an existing member is a no-op; a third
    /// participant is refused.
    pub fn admit(&mut self, participant: ParticipantId) -> Result<(), RelayError> {
        if self.closed {
            return Err(RelayError::UnknownRoom(self.room_id.clone()));
        }
        if self.is_member(participant) {
            return Ok(());
        }
        if self.members.len() >= MAX_MEMBERS {
            return Err(RelayError::RoomFull(self.room_id.clone()));
        }
        self.members.push(participant);
        Ok(())
    }

    /// Verifies `sender` may talk in this room and returns the other member.
    pub fn peer_of(&self, sender: ParticipantId) -> Result<Option<ParticipantId>, RelayError> {
        if self.closed {
            return Err(RelayError::UnknownRoom(self.room_id.clone()));
        }
        if !self.is_member(sender) {
            return Err(RelayError::NotMember {
                room: self.room_id.clone(),
                participant: sender,
            });
        }
        Ok(self.members.iter().copied().find(|m| *m != sender))
    }

    /// Marks the session destroyed. Returns the remaining member.
    pub fn close_by(&mut self, leaver: ParticipantId) -> Result<Option<ParticipantId>, RelayError> {
        let peer = self.peer_of(leaver)?;
        self.closed = true;
        Ok(peer)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            room_id: self.room_id.clone(),
            participant_a: self.members[0],
            participant_b: self.members.get(1).copied(),
            created_at: self.created_at,
        }
    }
}
