//! Per-room registry of live connections.
//!
//! A [`Session`] pairs a connection id and its immutable [`Role`] with the
//! sending half of the connection's outbound queue. The socket writer owns
//! the receiving half; sends from the room never wait on the network.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::gate::Role;

/// Frames queued for a connection. Shared so one broadcast allocates once.
pub type Frame = Arc<Vec<u8>>;

/// Unique connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Failure to hand a frame to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection's writer is gone.
    #[error("connection closed")]
    Closed,
    /// The connection is not draining its queue.
    #[error("outbound queue full")]
    Full,
}

/// One live connection.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    role: Role,
    outbound: mpsc::Sender<Frame>,
}

impl Session {
    pub fn new(role: Role, outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            id: SessionId::new(),
            role,
            outbound,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Queue a frame without waiting.
    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Full,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

/// Sessions currently in a room.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session: Session) -> SessionId {
        let id = session.id();
        self.sessions.insert(id, session);
        id
    }

    /// Remove a session. Removing an unknown id is a no-op.
    pub fn remove(&mut self, id: &SessionId) -> Option<Session> {
        self.sessions.remove(id)
    }

    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Count of sessions per role: `(editors, viewers)`.
    pub fn role_counts(&self) -> (usize, usize) {
        self.sessions
            .values()
            .fold((0, 0), |(editors, viewers), s| match s.role() {
                Role::Editor => (editors + 1, viewers),
                Role::Viewer => (editors, viewers + 1),
            })
    }
}
