//! Room coordinator: the decode → gate → apply → relay pipeline.
//!
//! [`Room`] is synchronous and single-owner. The manager wraps each room in
//! its own task so all operations on one room execute one at a time; nothing
//! in here locks or awaits.
//!
//! Dispatch after the gate:
//!
//! | Message         | Effect                                                       |
//! |-----------------|--------------------------------------------------------------|
//! | SyncStep1(sv)   | reply `SyncStep2(diff(sv))`, then `SyncStep1(own sv)`        |
//! | SyncStep2(u)    | apply, relay to others as `Update(u)`                        |
//! | Update(u)       | apply, relay raw bytes to others                             |
//! | Awareness       | cache as sender's presence, relay raw bytes to others        |
//! | QueryAwareness  | reply with every other session's cached presence             |
//!
//! When a session leaves, the awareness clients it announced are reported
//! to the remaining sessions as removed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::broadcast::{BroadcastRelay, BroadcastStats};
use crate::document::MergeableDocument;
use crate::gate::{authorize, Role};
use crate::protocol::{awareness_clients, awareness_removal, Message, SyncStep};
use crate::session::{Frame, Session, SessionId, SessionRegistry, TransportError};

/// What [`Room::handle_message`] did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Answered to the sender only.
    Replied,
    /// Merged into the document and relayed to `relayed` sessions.
    Applied { relayed: usize },
    /// Presence cached and relayed to `relayed` sessions.
    Presence { relayed: usize },
    /// Mutation from a session without write permission; silently dropped.
    Denied,
    /// Frame failed to decode; dropped.
    Malformed,
    /// Document refused the payload; dropped.
    Rejected,
    /// Sender is no longer in the room.
    UnknownSession,
}

/// Room statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub name: String,
    pub sessions: usize,
    pub editors: usize,
    pub viewers: usize,
    pub updates_applied: u64,
    pub messages_denied: u64,
    pub protocol_errors: u64,
    pub presence_entries: usize,
    pub broadcast: BroadcastStats,
}

#[derive(Debug, Default)]
struct Counters {
    updates_applied: u64,
    messages_denied: u64,
    protocol_errors: u64,
}

/// Latest awareness frame of a session and every client id it announced.
struct Presence {
    latest: Frame,
    clients: BTreeMap<u64, u64>,
}

/// One room: a document plus the sessions editing it.
pub struct Room<D> {
    name: String,
    document: D,
    sessions: SessionRegistry,
    relay: BroadcastRelay,
    presence: HashMap<SessionId, Presence>,
    dirty: bool,
    counters: Counters,
}

impl<D: MergeableDocument> Room<D> {
    pub fn new(name: impl Into<String>, document: D) -> Self {
        Self {
            name: name.into(),
            document,
            sessions: SessionRegistry::new(),
            relay: BroadcastRelay::new(),
            presence: HashMap::new(),
            dirty: false,
            counters: Counters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn document(&self) -> &D {
        &self.document
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Register a session and send it the room's state vector. Nothing else
    /// reaches the session before that first message.
    pub fn connect(
        &mut self,
        role: Role,
        outbound: mpsc::Sender<Frame>,
    ) -> Result<SessionId, TransportError> {
        let session = Session::new(role, outbound);
        let hello = Message::sync_step1(self.document.state_vector()).encode();
        session.send(Arc::new(hello))?;

        let id = self.sessions.insert(session);
        log::info!(
            "Session {id} joined room {} as {role} ({} connected)",
            self.name,
            self.sessions.len()
        );
        Ok(id)
    }

    /// Remove a session and its presence. Returns `false` if it was already gone.
    pub fn disconnect(&mut self, id: SessionId) -> bool {
        let removed = self.sessions.remove(&id).is_some();
        if removed {
            log::info!(
                "Session {id} left room {} ({} connected)",
                self.name,
                self.sessions.len()
            );
        }
        self.drop_presence(id);
        removed
    }

    /// Process one inbound frame from `id`.
    pub fn handle_message(&mut self, id: SessionId, raw: Frame) -> Dispatch {
        let Some(role) = self.sessions.get(&id).map(Session::role) else {
            return Dispatch::UnknownSession;
        };

        let message = match Message::decode(&raw) {
            Ok(message) => message,
            Err(e) => {
                self.counters.protocol_errors += 1;
                log::warn!("Room {}: dropped malformed frame from {id}: {e}", self.name);
                return Dispatch::Malformed;
            }
        };

        if let Err(denied) = authorize(role, &message) {
            self.counters.messages_denied += 1;
            log::debug!("Room {}: dropped frame from {id}: {denied}", self.name);
            return Dispatch::Denied;
        }

        match message {
            Message::Sync(SyncStep::Step1, state_vector) => {
                let diff = match self.document.diff(&state_vector) {
                    Ok(diff) => diff,
                    Err(e) => {
                        self.counters.protocol_errors += 1;
                        log::warn!("Room {}: bad SyncStep1 from {id}: {e}", self.name);
                        return Dispatch::Malformed;
                    }
                };
                let step2 = Arc::new(Message::sync_step2(diff).encode());
                let step1 = Arc::new(Message::sync_step1(self.document.state_vector()).encode());
                if self.reply(id, step2) {
                    self.reply(id, step1);
                }
                Dispatch::Replied
            }
            Message::Sync(step, update) => {
                if let Err(e) = self.document.apply_update(&update) {
                    self.counters.protocol_errors += 1;
                    log::warn!("Room {}: rejected {step:?} from {id}: {e}", self.name);
                    return Dispatch::Rejected;
                }
                self.dirty = true;
                self.counters.updates_applied += 1;

                let frame = match step {
                    SyncStep::Update => raw,
                    _ => Arc::new(Message::update(update).encode()),
                };
                let relayed = self.relay_from(id, frame);
                log::trace!("Room {}: applied {step:?} from {id}, relayed to {relayed}", self.name);
                Dispatch::Applied { relayed }
            }
            Message::Awareness(payload) => {
                let entry = self.presence.entry(id).or_insert_with(|| Presence {
                    latest: raw.clone(),
                    clients: BTreeMap::new(),
                });
                entry.latest = raw.clone();
                // Opaque payloads are still relayed, just never announced as removed
                if let Ok(clients) = awareness_clients(&payload) {
                    for (client, clock) in clients {
                        let known = entry.clients.entry(client).or_insert(clock);
                        *known = (*known).max(clock);
                    }
                }
                let relayed = self.relay_from(id, raw);
                log::trace!("Room {}: presence from {id} relayed to {relayed}", self.name);
                Dispatch::Presence { relayed }
            }
            Message::QueryAwareness => {
                let known: Vec<Frame> = self
                    .presence
                    .iter()
                    .filter(|(owner, _)| **owner != id)
                    .map(|(_, presence)| presence.latest.clone())
                    .collect();
                for frame in known {
                    if !self.reply(id, frame) {
                        break;
                    }
                }
                Dispatch::Replied
            }
        }
    }

    /// Whether the document changed since the last call; clears the flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.document.snapshot()
    }

    pub fn stats(&self) -> RoomStats {
        let (editors, viewers) = self.sessions.role_counts();
        RoomStats {
            name: self.name.clone(),
            sessions: self.sessions.len(),
            editors,
            viewers,
            updates_applied: self.counters.updates_applied,
            messages_denied: self.counters.messages_denied,
            protocol_errors: self.counters.protocol_errors,
            presence_entries: self.presence.len(),
            broadcast: self.relay.stats(),
        }
    }

    /// Send to one session; a failed send removes it.
    fn reply(&mut self, id: SessionId, frame: Frame) -> bool {
        let Some(session) = self.sessions.get(&id) else {
            return false;
        };
        match session.send(frame) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Room {}: dropped session {id} on reply: {e}", self.name);
                self.disconnect(id);
                false
            }
        }
    }

    fn relay_from(&mut self, origin: SessionId, frame: Frame) -> usize {
        let outcome = self.relay.broadcast(&mut self.sessions, origin, frame);
        for (id, _) in &outcome.evicted {
            self.drop_presence(*id);
        }
        outcome.delivered
    }

    /// Forget a departed session's presence and tell the others its
    /// awareness clients are gone.
    fn drop_presence(&mut self, id: SessionId) {
        let Some(presence) = self.presence.remove(&id) else {
            return;
        };
        if presence.clients.is_empty() {
            return;
        }
        let removal = Message::awareness(awareness_removal(&presence.clients)).encode();
        let relayed = self.relay_from(id, Arc::new(removal));
        log::debug!(
            "Room {}: removed {} awareness client(s) of {id}, told {relayed}",
            self.name,
            presence.clients.len()
        );
    }
}
