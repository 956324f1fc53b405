//! WebSocket sync server with room-based document routing.
//!
//! Architecture:
//! ```text
//! ws://host:4444/<room>?role=editor ──┐
//!                                      ├── RoomManager ── room task ── Yrs Doc
//! ws://host:4444/<room>?role=viewer ──┘        │             │
//!                                              │             └── SnapshotWriter
//!                                              │                       │
//!                                              └──────────────── SnapshotStore
//!                                                          (RocksDB or memory)
//! ```
//!
//! Each connection runs one task that pumps binary frames from the socket
//! into its room and drains the session's outbound queue back onto the
//! socket. The room name is the first path segment (`default` when empty);
//! the role comes from the `role` query parameter and falls back to viewer.
//!
//! Plain HTTP requests on the same port get a small response instead of a
//! handshake: `GET /health` returns [`Health`] as JSON, anything else a
//! one-line banner.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HandshakeRequest, Response,
};
use tokio_tungstenite::tungstenite::Message;

use crate::gate::Role;
use crate::manager::{RoomConfig, RoomError, RoomManager};
use crate::storage::{MemoryStore, RocksStore, SnapshotStore, StoreConfig, StoreError};

/// Room used when the request path has no segment.
pub const DEFAULT_ROOM: &str = "default";

/// Largest request head inspected before deciding between HTTP and WebSocket.
const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    /// Rooms currently loaded
    pub rooms: usize,
    /// Seconds since the server was created
    pub uptime: u64,
    /// `rocksdb` or `memory`
    pub persistence: String,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Per-room tuning
    pub room: RoomConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:4444".to_string(),
            storage_path: None,
            room: RoomConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub http_requests: u64,
    pub active_rooms: usize,
    pub snapshots_saved: u64,
    pub save_failures: u64,
}

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Room(#[from] RoomError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The sync server.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    manager: RoomManager,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
    started: Instant,
}

impl SyncServer {
    /// Create a server, opening RocksDB at `storage_path` if one is set.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store: Arc<dyn SnapshotStore> = match &config.storage_path {
            Some(path) => {
                let store = RocksStore::open(StoreConfig::new(path))?;
                if let Ok(rooms) = store.list_rooms() {
                    log::info!("Snapshot store holds {} room(s)", rooms.len());
                }
                Arc::new(store)
            }
            None => {
                log::warn!("No storage path configured; documents live in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let manager = RoomManager::new(store, config.room.clone());
        Self {
            config,
            manager,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            started: Instant::now(),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single accepted connection.
    async fn handle_connection(&self, stream: TcpStream) -> Result<(), ServerError> {
        match peek_request(&stream).await? {
            Request::WebSocket => self.handle_websocket(stream).await,
            Request::Http { path } => self.handle_http(stream, &path).await,
        }
    }

    async fn handle_http(&self, mut stream: TcpStream, path: &str) -> Result<(), ServerError> {
        self.stats.write().await.http_requests += 1;
        // Consume what was peeked so closing does not reset the connection
        let mut head = vec![0u8; MAX_REQUEST_HEAD];
        let _ = stream.read(&mut head).await?;

        let (content_type, body) = if path == "/health" {
            ("application/json", serde_json::to_vec(&self.health().await)?)
        } else {
            ("text/plain", b"referencer collab server".to_vec())
        };
        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(&body);

        stream.write_all(&response).await?;
        stream.shutdown().await?;
        log::debug!("Answered HTTP request for {path}");
        Ok(())
    }

    /// Handle a single WebSocket connection.
    async fn handle_websocket(&self, stream: TcpStream) -> Result<(), ServerError> {
        let mut target = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &HandshakeRequest, response: Response| -> Result<Response, ErrorResponse> {
                target = Some(parse_target(request.uri().path(), request.uri().query()));
                Ok(response)
            },
        )
        .await?;
        let (room, role) = target.unwrap_or_else(|| (DEFAULT_ROOM.to_string(), Role::Viewer));
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let connection = match self.manager.connect(&room, role).await {
            Ok(connection) => connection,
            Err(e) => {
                self.stats.write().await.rejected_connections += 1;
                let _ = ws_sender.send(Message::Close(None)).await;
                return Err(e.into());
            }
        };
        let session = connection.session_id();
        let (sender, mut outbound) = connection.into_parts();

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        log::info!("Session {session} connected to room {room} as {role}");

        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        {
                            let mut s = self.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        if sender.send(data.to_vec()).is_err() {
                            log::debug!("Room {room} closed under session {session}");
                            break Ok(());
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                            break Err(e.into());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Err(e)) => break Err(e.into()),
                    Some(Ok(_)) => {}
                },

                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = ws_sender.send(Message::Binary(frame.to_vec().into())).await {
                            break Err(e.into());
                        }
                    }
                    None => {
                        log::debug!("Room {room} dropped session {session}");
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break Ok(());
                    }
                },
            }
        };

        // Dropping the sender disconnects the session from its room
        drop(sender);
        self.stats.write().await.active_connections -= 1;
        log::info!("Session {session} left room {room}");
        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.manager.room_count().await;
        let persist = self.manager.persist_stats();
        stats.snapshots_saved = persist.snapshots_saved;
        stats.save_failures = persist.save_failures;
        stats
    }

    /// Liveness summary served at `/health`.
    pub async fn health(&self) -> Health {
        let persistence = match self.config.storage_path {
            Some(_) => "rocksdb",
            None => "memory",
        };
        Health {
            status: "ok".to_string(),
            rooms: self.manager.room_count().await,
            uptime: self.started.elapsed().as_secs(),
            persistence: persistence.to_string(),
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn manager(&self) -> &RoomManager {
        &self.manager
    }

    /// Flush every room and stop accepting sessions.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}

/// What a freshly accepted connection is asking for.
#[derive(Debug, PartialEq, Eq)]
enum Request {
    WebSocket,
    Http { path: String },
}

/// Look at the request head without consuming it, so the WebSocket
/// handshake still sees the whole request.
async fn peek_request(stream: &TcpStream) -> Result<Request, ServerError> {
    let mut buf = vec![0u8; MAX_REQUEST_HEAD];
    let mut seen = 0;
    for _ in 0..50 {
        let n = stream.peek(&mut buf).await?;
        if n == 0 || buf[..n].windows(4).any(|w| w == b"\r\n\r\n") || n == buf.len() {
            return Ok(classify_request(&buf[..n]));
        }
        if n == seen {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        seen = n;
    }
    Ok(classify_request(&buf[..seen]))
}

/// Anything that is not an HTTP upgrade to `websocket` is plain HTTP.
fn classify_request(head: &[u8]) -> Request {
    let head = String::from_utf8_lossy(head);
    let mut lines = head.split("\r\n");
    let path = lines
        .next()
        .and_then(|line| line.split(' ').nth(1))
        .unwrap_or("/")
        .to_string();
    let upgrade = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .any(|(name, value)| {
            name.trim().eq_ignore_ascii_case("upgrade")
                && value.trim().eq_ignore_ascii_case("websocket")
        });
    if upgrade {
        Request::WebSocket
    } else {
        Request::Http { path }
    }
}

/// Room name and role from a request path and query string.
pub fn parse_target(path: &str, query: Option<&str>) -> (String, Role) {
    let room = path
        .split('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(DEFAULT_ROOM)
        .to_string();

    let role = query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "role")
        .map(|(_, value)| value);

    (room, Role::from_param(role))
}
