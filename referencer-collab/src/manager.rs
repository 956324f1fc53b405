//! Room lifecycle: lazy creation, per-room actor tasks, idle eviction and
//! shutdown flush.
//!
//! ```text
//!  connect(room, role)         ┌──────────────────────── room task ─────────────────────────┐
//! ──────────────────► Registry │ RoomEvent queue ─► Room (document + sessions) ─► try_send  │
//!                     (Mutex)  │        ▲                 │ debounce timer                  │
//!  Connection.send ────────────┼────────┘                 └────────► SnapshotWriter ─► store│
//!                              └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every event for a room is processed to completion before the next one.
//! Different rooms run concurrently. An empty room lingers for
//! `idle_eviction`, then removes itself from the registry, flushes and exits.
//! A snapshot still being written by an evicted incarnation is parked in the
//! registry so a fresh incarnation of the same room merges it on load. The
//! fresh incarnation also takes over that writer's lease, retiring it before
//! its own first save, so an old retry can never overwrite newer state.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::document::{MergeableDocument, YrsDocument};
use crate::gate::Role;
use crate::room::{Dispatch, Room, RoomStats};
use crate::session::{Frame, SessionId, TransportError};
use crate::storage::{
    load_with_retry, PersistCounters, PersistStats, RetryPolicy, SnapshotStore, SnapshotWriter,
    StoreError, WriterLease,
};

/// Connect attempts against rooms that close underneath us.
const CONNECT_ATTEMPTS: usize = 3;

/// Per-room tuning.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Frames buffered per connection before it counts as stalled
    pub outbound_capacity: usize,
    /// Quiet period after the last update before a snapshot is written
    pub persist_debounce: Duration,
    /// How long an empty room stays loaded
    pub idle_eviction: Duration,
    pub retry: RetryPolicy,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            persist_debounce: Duration::from_secs(1),
            idle_eviction: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Room-level failures visible to the host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    /// The room stopped before the request was processed.
    #[error("room closed")]
    Closed,
    /// Stored state could not be loaded.
    #[error("room {room} unavailable: {source}")]
    Unavailable { room: String, source: StoreError },
    #[error("session transport failed: {0}")]
    Transport(#[from] TransportError),
    #[error("server shutting down")]
    ShuttingDown,
}

enum RoomEvent {
    Connect {
        role: Role,
        outbound: mpsc::Sender<Frame>,
        reply: oneshot::Sender<Result<SessionId, RoomError>>,
    },
    Message {
        session: SessionId,
        frame: Frame,
    },
    Disconnect {
        session: SessionId,
    },
    Stats {
        reply: oneshot::Sender<RoomStats>,
    },
    Shutdown,
}

#[derive(Clone)]
struct RoomHandle {
    tx: mpsc::UnboundedSender<RoomEvent>,
    generation: u64,
}

struct RoomEntry {
    handle: RoomHandle,
    task: JoinHandle<()>,
}

/// Final snapshot of an evicted room and the writer still saving it.
#[derive(Clone)]
struct Parked {
    snapshot: Arc<Vec<u8>>,
    writer: WriterLease,
}

#[derive(Default)]
struct Registry {
    rooms: HashMap<String, RoomEntry>,
    /// Evicted rooms whose writers have not finished
    flushing: HashMap<String, Parked>,
    closed: bool,
}

struct Shared {
    config: RoomConfig,
    store: Arc<dyn SnapshotStore>,
    registry: Mutex<Registry>,
    next_generation: AtomicU64,
    persist: Arc<PersistCounters>,
}

/// Sending half of a connection. Dropping it disconnects the session.
pub struct ConnectionSender {
    room: String,
    session: SessionId,
    tx: mpsc::UnboundedSender<RoomEvent>,
}

impl ConnectionSender {
    pub fn session_id(&self) -> SessionId {
        self.session
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Queue an inbound frame for the room.
    pub fn send(&self, frame: Vec<u8>) -> Result<(), RoomError> {
        self.tx
            .send(RoomEvent::Message {
                session: self.session,
                frame: Arc::new(frame),
            })
            .map_err(|_| RoomError::Closed)
    }
}

impl Drop for ConnectionSender {
    fn drop(&mut self) {
        let _ = self.tx.send(RoomEvent::Disconnect {
            session: self.session,
        });
    }
}

/// A session's link to its room.
pub struct Connection {
    sender: ConnectionSender,
    outbound: mpsc::Receiver<Frame>,
}

impl Connection {
    pub fn session_id(&self) -> SessionId {
        self.sender.session
    }

    pub fn room(&self) -> &str {
        &self.sender.room
    }

    pub fn send(&self, frame: Vec<u8>) -> Result<(), RoomError> {
        self.sender.send(frame)
    }

    /// Next frame for this session; `None` once the room dropped it.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.outbound.recv().await
    }

    /// Split for independent reader and writer tasks.
    pub fn into_parts(self) -> (ConnectionSender, mpsc::Receiver<Frame>) {
        (self.sender, self.outbound)
    }
}

/// Owns every live room.
pub struct RoomManager<D = YrsDocument> {
    shared: Arc<Shared>,
    _document: PhantomData<fn() -> D>,
}

impl<D> Clone for RoomManager<D> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            _document: PhantomData,
        }
    }
}

impl<D: MergeableDocument + Default> RoomManager<D> {
    pub fn new(store: Arc<dyn SnapshotStore>, mut config: RoomConfig) -> Self {
        config.outbound_capacity = config.outbound_capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                config,
                store,
                registry: Mutex::new(Registry::default()),
                next_generation: AtomicU64::new(0),
                persist: Arc::new(PersistCounters::default()),
            }),
            _document: PhantomData,
        }
    }

    pub fn config(&self) -> &RoomConfig {
        &self.shared.config
    }

    /// Join `room` (created on demand) with `role`. The first frame on the
    /// returned connection is the room's SyncStep1.
    pub async fn connect(&self, room: &str, role: Role) -> Result<Connection, RoomError> {
        for _ in 0..CONNECT_ATTEMPTS {
            let handle = self.handle(room).await?;
            let (outbound_tx, outbound_rx) = mpsc::channel(self.shared.config.outbound_capacity);
            let (reply_tx, reply_rx) = oneshot::channel();

            let event = RoomEvent::Connect {
                role,
                outbound: outbound_tx,
                reply: reply_tx,
            };
            if handle.tx.send(event).is_err() {
                continue;
            }

            match reply_rx.await {
                Ok(Ok(session)) => {
                    return Ok(Connection {
                        sender: ConnectionSender {
                            room: room.to_string(),
                            session,
                            tx: handle.tx,
                        },
                        outbound: outbound_rx,
                    })
                }
                Ok(Err(RoomError::Closed)) | Err(_) => {
                    log::debug!("Room {room} closed during connect, retrying");
                }
                Ok(Err(e)) => return Err(e),
            }
        }
        Err(RoomError::Closed)
    }

    /// Live handle for `room`, spawning its task if needed.
    async fn handle(&self, room: &str) -> Result<RoomHandle, RoomError> {
        let mut registry = self.shared.registry.lock().await;
        if registry.closed {
            return Err(RoomError::ShuttingDown);
        }
        if let Some(entry) = registry.rooms.get(room) {
            if !entry.handle.tx.is_closed() {
                return Ok(entry.handle.clone());
            }
        }

        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = RoomHandle { tx, generation };
        let task = tokio::spawn(run_room::<D>(
            self.shared.clone(),
            room.to_string(),
            generation,
            rx,
        ));
        registry.rooms.insert(
            room.to_string(),
            RoomEntry {
                handle: handle.clone(),
                task,
            },
        );
        log::debug!("Activated room {room} (generation {generation})");
        Ok(handle)
    }

    pub async fn room_count(&self) -> usize {
        self.shared.registry.lock().await.rooms.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        let registry = self.shared.registry.lock().await;
        let mut rooms: Vec<String> = registry.rooms.keys().cloned().collect();
        rooms.sort();
        rooms
    }

    pub async fn room_stats(&self, room: &str) -> Option<RoomStats> {
        let handle = {
            let registry = self.shared.registry.lock().await;
            registry.rooms.get(room)?.handle.clone()
        };
        request_stats(&handle).await
    }

    /// Statistics for every live room, sorted by name.
    pub async fn stats(&self) -> Vec<RoomStats> {
        let handles: Vec<RoomHandle> = {
            let registry = self.shared.registry.lock().await;
            registry.rooms.values().map(|e| e.handle.clone()).collect()
        };
        let mut stats = Vec::with_capacity(handles.len());
        for handle in &handles {
            if let Some(room) = request_stats(handle).await {
                stats.push(room);
            }
        }
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn persist_stats(&self) -> PersistStats {
        self.shared.persist.stats()
    }

    /// Refuse new connections, flush every room and wait for all room tasks.
    pub async fn shutdown(&self) {
        let entries: Vec<(String, RoomEntry)> = {
            let mut registry = self.shared.registry.lock().await;
            registry.closed = true;
            registry.rooms.drain().collect()
        };
        log::info!("Shutting down {} room(s)", entries.len());

        for (_, entry) in &entries {
            let _ = entry.handle.tx.send(RoomEvent::Shutdown);
        }
        for (room, entry) in entries {
            if let Err(e) = entry.task.await {
                log::error!("Room {room} task failed during shutdown: {e}");
            }
        }
    }
}

async fn request_stats(handle: &RoomHandle) -> Option<RoomStats> {
    let (reply, rx) = oneshot::channel();
    handle.tx.send(RoomEvent::Stats { reply }).ok()?;
    rx.await.ok()
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Stored state merged with any snapshot a previous incarnation is still
/// writing. Returns the parked entry that was merged, if any.
async fn load_document<D: MergeableDocument + Default>(
    shared: &Shared,
    room: &str,
) -> Result<(D, Option<Parked>), StoreError> {
    let in_flight = shared.registry.lock().await.flushing.get(room).cloned();
    let stored = load_with_retry(&shared.store, room, &shared.config.retry).await?;

    let mut document = D::default();
    let snapshots = stored
        .iter()
        .map(Vec::as_slice)
        .chain(in_flight.as_ref().map(|p| p.snapshot.as_slice()));
    for snapshot in snapshots {
        document
            .apply_update(snapshot)
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    }
    Ok((document, in_flight))
}

/// Refuse everything still queued on a stopping room.
fn drain_refusing<D: MergeableDocument>(
    rx: &mut mpsc::UnboundedReceiver<RoomEvent>,
    room: Option<&Room<D>>,
    error: &RoomError,
) {
    rx.close();
    while let Ok(event) = rx.try_recv() {
        match event {
            RoomEvent::Connect { reply, .. } => {
                let _ = reply.send(Err(error.clone()));
            }
            RoomEvent::Stats { reply } => {
                if let Some(room) = room {
                    let _ = reply.send(room.stats());
                }
            }
            RoomEvent::Message { .. } | RoomEvent::Disconnect { .. } | RoomEvent::Shutdown => {}
        }
    }
}

async fn run_room<D: MergeableDocument + Default>(
    shared: Arc<Shared>,
    name: String,
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<RoomEvent>,
) {
    let (document, inherited) = match load_document::<D>(&shared, &name).await {
        Ok(loaded) => loaded,
        Err(source) => {
            log::error!("Failed to load room {name}, refusing connections: {source}");
            {
                let mut registry = shared.registry.lock().await;
                if registry
                    .rooms
                    .get(&name)
                    .is_some_and(|e| e.handle.generation == generation)
                {
                    registry.rooms.remove(&name);
                }
            }
            let error = RoomError::Unavailable {
                room: name.clone(),
                source,
            };
            drain_refusing::<D>(&mut rx, None, &error);
            return;
        }
    };

    let inherited_snapshot = inherited.is_some();
    if let Some(parked) = &inherited {
        let mut registry = shared.registry.lock().await;
        if registry
            .flushing
            .get(&name)
            .is_some_and(|p| Arc::ptr_eq(&p.snapshot, &parked.snapshot))
        {
            registry.flushing.remove(&name);
        }
    }

    let config = &shared.config;
    let mut room = Room::new(name.clone(), document);
    let writer = SnapshotWriter::spawn(
        name.clone(),
        shared.store.clone(),
        config.retry,
        shared.persist.clone(),
        inherited.map(|p| p.writer),
    );
    let mut persisted_any = false;
    if inherited_snapshot {
        // The retired writer drops what it held, so this writer owns it now
        writer.submit(Arc::new(room.snapshot()));
        persisted_any = true;
    }
    let mut save_at: Option<Instant> = None;
    let mut idle_since: Option<Instant> = Some(Instant::now());
    let mut parked: Option<Arc<Vec<u8>>> = None;

    loop {
        let idle_deadline = idle_since.map(|t| t + config.idle_eviction);

        tokio::select! {
            biased;

            event = rx.recv() => match event {
                Some(RoomEvent::Connect { role, outbound, reply }) => {
                    let _ = reply.send(room.connect(role, outbound).map_err(RoomError::from));
                }
                Some(RoomEvent::Message { session, frame }) => {
                    if let Dispatch::Applied { .. } = room.handle_message(session, frame) {
                        save_at = Some(Instant::now() + config.persist_debounce);
                    }
                }
                Some(RoomEvent::Disconnect { session }) => {
                    room.disconnect(session);
                }
                Some(RoomEvent::Stats { reply }) => {
                    let _ = reply.send(room.stats());
                }
                Some(RoomEvent::Shutdown) | None => break,
            },

            _ = wait_until(save_at) => {
                save_at = None;
                if room.take_dirty() {
                    writer.submit(Arc::new(room.snapshot()));
                    persisted_any = true;
                }
            }

            _ = wait_until(idle_deadline) => {
                let mut registry = shared.registry.lock().await;
                let current = registry
                    .rooms
                    .get(&name)
                    .is_some_and(|e| e.handle.generation == generation);
                if !rx.is_empty() || !current {
                    idle_since = Some(Instant::now());
                    continue;
                }
                registry.rooms.remove(&name);
                if persisted_any || room.is_dirty() {
                    let snapshot = Arc::new(room.snapshot());
                    registry.flushing.insert(
                        name.clone(),
                        Parked {
                            snapshot: snapshot.clone(),
                            writer: writer.lease(),
                        },
                    );
                    parked = Some(snapshot);
                }
                rx.close();
                log::info!("Evicting idle room {name}");
                break;
            }
        }

        if room.is_empty() {
            if idle_since.is_none() {
                idle_since = Some(Instant::now());
                // Last session left: flush now rather than at the debounce
                save_at = None;
                if room.take_dirty() {
                    writer.submit(Arc::new(room.snapshot()));
                    persisted_any = true;
                }
            }
        } else {
            idle_since = None;
        }
    }

    drain_refusing(&mut rx, Some(&room), &RoomError::Closed);
    if room.take_dirty() {
        writer.submit(Arc::new(room.snapshot()));
    }
    writer.close().await;

    if let Some(snapshot) = parked {
        let mut registry = shared.registry.lock().await;
        if registry
            .flushing
            .get(&name)
            .is_some_and(|p| Arc::ptr_eq(&p.snapshot, &snapshot))
        {
            registry.flushing.remove(&name);
        }
    }
    log::debug!("Room {name} stopped");
}
