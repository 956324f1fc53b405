//! # referencer-collab - Real-time collaboration rooms for Yjs clients
//!
//! Coordinates named rooms, each holding one shared CRDT document, over
//! WebSocket. Clients speak the y-protocols binary format; every connection
//! is either an editor (may change the document) or a viewer (read-only plus
//! presence).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  binary frames   ┌─────────────┐  RoomEvent   ┌──────────────┐
//! │ Yjs client  │ ◄──────────────► │ SyncServer  │ ───────────► │ room task    │
//! │ (per user)  │    WebSocket     │ (per conn)  │   (mpsc)     │ Room + Doc   │
//! └─────────────┘                  └─────────────┘              └──────┬───────┘
//!        ▲                                                             │
//!        │            per-session bounded queue (BroadcastRelay)       │
//!        └─────────────────────────────────────────────────────────────┤
//!                                                                      ▼
//!                                                             ┌────────────────┐
//!                                                             │ SnapshotWriter │
//!                                                             │ → RocksDB      │
//!                                                             └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: lib0 varint wire codec (Sync / Awareness / QueryAwareness)
//! - [`gate`]: roles and write authorization
//! - [`document`]: mergeable document port and the `yrs` adapter
//! - [`session`]: connection ids, outbound queues, per-room registry
//! - [`broadcast`]: fan-out to every session except the origin
//! - [`room`]: decode → gate → apply → relay dispatch
//! - [`manager`]: room tasks, idle eviction, shutdown flush
//! - [`storage`]: snapshot stores and the debounced background writer
//! - [`server`]: WebSocket endpoint `/<room>?role=<editor|viewer>`

pub mod broadcast;
pub mod document;
pub mod gate;
pub mod manager;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastOutcome, BroadcastRelay, BroadcastStats};
pub use document::{DocumentError, MergeableDocument, YrsDocument};
pub use gate::{authorize, Access, AuthorizationDenied, Role};
pub use manager::{Connection, ConnectionSender, RoomConfig, RoomError, RoomManager};
pub use protocol::{Message, MessageKind, ProtocolError, SyncStep};
pub use room::{Dispatch, Room, RoomStats};
pub use server::{Health, ServerConfig, ServerError, ServerStats, SyncServer};
pub use session::{Frame, Session, SessionId, SessionRegistry, TransportError};
pub use storage::{
    DocumentMetadata, MemoryStore, PersistStats, RetryPolicy, RocksStore, SnapshotStore,
    StoreConfig, StoreError,
};
