//! Room behaviour through the public manager API, with real `yrs` documents
//! and in-process stores.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use referencer_collab::manager::{Connection, RoomConfig, RoomManager};
use referencer_collab::protocol::{Message, SyncStep};
use referencer_collab::storage::{MemoryStore, RetryPolicy, SnapshotStore, StoreError};
use referencer_collab::Role;
use tokio::time::timeout;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

fn config() -> RoomConfig {
    RoomConfig {
        outbound_capacity: 32,
        persist_debounce: Duration::from_millis(10),
        idle_eviction: Duration::from_millis(40),
        retry: RetryPolicy::for_testing(),
    }
}

fn client_update(client_id: u64, content: &str) -> Vec<u8> {
    let doc = Doc::with_client_id(client_id);
    {
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("test");
        text.insert(&mut txn, 0, content);
    }
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}

fn text_after(update: &[u8]) -> String {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        txn.apply_update(Update::decode_v1(update).unwrap()).unwrap();
    }
    let txn = doc.transact();
    txn.get_text("test")
        .map(|text| text.get_string(&txn))
        .unwrap_or_default()
}

async fn recv(conn: &mut Connection) -> Message {
    let frame = timeout(Duration::from_secs(2), conn.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("session dropped");
    Message::decode(&frame).unwrap()
}

async fn join(manager: &RoomManager, room: &str, role: Role) -> Connection {
    let mut conn = manager.connect(room, role).await.unwrap();
    assert!(matches!(recv(&mut conn).await, Message::Sync(SyncStep::Step1, _)));
    conn
}

/// Ask the room for everything and return the document text.
async fn fetch_text(conn: &mut Connection) -> String {
    conn.send(Message::sync_step1(vec![0]).encode()).unwrap();
    match recv(conn).await {
        Message::Sync(SyncStep::Step2, diff) => {
            recv(conn).await;
            text_after(&diff)
        }
        other => panic!("expected SyncStep2, got {other:?}"),
    }
}

async fn assert_silent(conn: &mut Connection) {
    assert!(timeout(Duration::from_millis(100), conn.recv()).await.is_err());
}

#[tokio::test]
async fn test_viewer_write_is_dropped() {
    let manager: RoomManager = RoomManager::new(Arc::new(MemoryStore::new()), config());
    let mut viewer = join(&manager, "r", Role::Viewer).await;
    let mut editor = join(&manager, "r", Role::Editor).await;

    viewer.send(Message::update(client_update(1, "nope")).encode()).unwrap();

    assert_silent(&mut editor).await;
    assert_eq!(fetch_text(&mut viewer).await, "");
    let stats = manager.room_stats("r").await.unwrap();
    assert_eq!(stats.messages_denied, 1);
    assert_eq!(stats.sessions, 2);
}

#[tokio::test]
async fn test_editor_update_fans_out() {
    let manager: RoomManager = RoomManager::new(Arc::new(MemoryStore::new()), config());
    let mut a = join(&manager, "r", Role::Editor).await;
    let mut b = join(&manager, "r", Role::Viewer).await;
    let mut c = join(&manager, "r", Role::Editor).await;

    let update = Message::update(client_update(1, "x")).encode();
    a.send(update.clone()).unwrap();

    assert_eq!(*timeout(Duration::from_secs(2), b.recv()).await.unwrap().unwrap(), update);
    assert_eq!(*timeout(Duration::from_secs(2), c.recv()).await.unwrap().unwrap(), update);
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn test_initial_sync_of_existing_document() {
    let manager: RoomManager = RoomManager::new(Arc::new(MemoryStore::new()), config());
    let editor = join(&manager, "r", Role::Editor).await;
    editor.send(Message::update(client_update(1, "existing")).encode()).unwrap();

    let mut viewer = manager.connect("r", Role::Viewer).await.unwrap();
    match recv(&mut viewer).await {
        Message::Sync(SyncStep::Step1, sv) => assert_ne!(sv, vec![0]),
        other => panic!("expected SyncStep1, got {other:?}"),
    }
    assert_eq!(fetch_text(&mut viewer).await, "existing");
}

#[tokio::test]
async fn test_disconnect_isolation() {
    let manager: RoomManager = RoomManager::new(Arc::new(MemoryStore::new()), config());
    let a = join(&manager, "r", Role::Editor).await;
    let mut b = join(&manager, "r", Role::Editor).await;
    a.send(Message::update(client_update(1, "kept")).encode()).unwrap();
    recv(&mut b).await;

    drop(a);

    assert_eq!(fetch_text(&mut b).await, "kept");
    assert_eq!(manager.room_stats("r").await.unwrap().sessions, 1);
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let manager: RoomManager = RoomManager::new(Arc::new(MemoryStore::new()), config());
    let a = join(&manager, "r", Role::Editor).await;
    let b = join(&manager, "r", Role::Editor).await;
    let mut observer = join(&manager, "r", Role::Viewer).await;

    a.send(Message::update(client_update(10, "left;")).encode()).unwrap();
    b.send(Message::update(client_update(20, "right;")).encode()).unwrap();
    recv(&mut observer).await;
    recv(&mut observer).await;

    let text = fetch_text(&mut observer).await;
    assert_eq!(text.len(), "left;right;".len());
    assert!(text.contains("left;") && text.contains("right;"));
}

#[tokio::test]
async fn test_content_survives_eviction() {
    let store = Arc::new(MemoryStore::new());
    let manager: RoomManager = RoomManager::new(store.clone(), config());

    let editor = join(&manager, "durable", Role::Editor).await;
    editor.send(Message::update(client_update(1, "remember")).encode()).unwrap();
    drop(editor);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(manager.room_count().await, 0);
    assert!(store.load("durable").unwrap().is_some());

    let mut viewer = join(&manager, "durable", Role::Viewer).await;
    assert_eq!(fetch_text(&mut viewer).await, "remember");
}

/// Saves block for a while and can be told to fail.
struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
    failures: AtomicUsize,
}

impl SlowStore {
    fn new(delay: Duration, failures: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            delay,
            failures: AtomicUsize::new(failures),
        }
    }
}

impl SnapshotStore for SlowStore {
    fn load(&self, room: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.load(room)
    }

    fn save(&self, room: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        std::thread::sleep(self.delay);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable("disk offline".into()));
        }
        self.inner.save(room, snapshot)
    }
}

#[tokio::test]
async fn test_reactivation_sees_snapshot_still_being_written() {
    let store = Arc::new(SlowStore::new(Duration::from_millis(400), 0));
    let config = RoomConfig {
        idle_eviction: Duration::from_millis(20),
        ..config()
    };
    let manager: RoomManager = RoomManager::new(store.clone(), config);

    let editor = join(&manager, "slow", Role::Editor).await;
    editor.send(Message::update(client_update(1, "in flight")).encode()).unwrap();
    drop(editor);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.room_count().await, 0);
    assert!(store.inner.load("slow").unwrap().is_none());

    let mut viewer = join(&manager, "slow", Role::Viewer).await;
    assert_eq!(fetch_text(&mut viewer).await, "in flight");
}

#[tokio::test]
async fn test_failing_store_is_retried() {
    let store = Arc::new(SlowStore::new(Duration::ZERO, 3));
    let manager: RoomManager = RoomManager::new(store.clone(), config());

    let mut editor = join(&manager, "flaky", Role::Editor).await;
    editor.send(Message::update(client_update(1, "eventually")).encode()).unwrap();

    // Relay is unaffected while the store is failing
    let mut viewer = join(&manager, "flaky", Role::Viewer).await;
    assert_eq!(fetch_text(&mut viewer).await, "eventually");
    assert_silent(&mut editor).await;

    drop(editor);
    drop(viewer);
    manager.shutdown().await;

    let snapshot = store.inner.load("flaky").unwrap().unwrap();
    assert_eq!(text_after(&snapshot), "eventually");
    let stats = manager.persist_stats();
    assert_eq!(stats.save_failures, 3);
    assert!(stats.snapshots_saved >= 1);
}

/// Rejects every save until opened.
struct GatedStore {
    inner: MemoryStore,
    open: AtomicBool,
}

impl SnapshotStore for GatedStore {
    fn load(&self, room: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.load(room)
    }

    fn save(&self, room: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("disk offline".into()));
        }
        self.inner.save(room, snapshot)
    }
}

#[tokio::test]
async fn test_evicted_writer_never_overwrites_newer_state() {
    let store = Arc::new(GatedStore {
        inner: MemoryStore::new(),
        open: AtomicBool::new(false),
    });
    let config = RoomConfig {
        retry: RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(100),
            max_attempts: 1000,
        },
        ..config()
    };
    let manager: RoomManager = RoomManager::new(store.clone(), config);

    // First incarnation is evicted while its save keeps failing
    let editor = join(&manager, "gated", Role::Editor).await;
    editor.send(Message::update(client_update(1, "one;")).encode()).unwrap();
    drop(editor);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(manager.room_count().await, 0);

    // Second incarnation picks up the parked state and edits further
    let editor = join(&manager, "gated", Role::Editor).await;
    store.open.store(true, Ordering::SeqCst);
    editor.send(Message::update(client_update(2, "two;")).encode()).unwrap();
    drop(editor);

    // Long enough for the first incarnation's writer to have retried
    tokio::time::sleep(Duration::from_millis(400)).await;

    let stored = text_after(&store.inner.load("gated").unwrap().unwrap());
    assert!(stored.contains("one;") && stored.contains("two;"), "stored {stored:?}");

    let mut viewer = join(&manager, "gated", Role::Viewer).await;
    let text = fetch_text(&mut viewer).await;
    assert!(text.contains("one;") && text.contains("two;"), "reloaded {text:?}");
}

#[tokio::test]
async fn test_presence_query() {
    let manager: RoomManager = RoomManager::new(Arc::new(MemoryStore::new()), config());
    let a = join(&manager, "p", Role::Viewer).await;
    let mut b = join(&manager, "p", Role::Viewer).await;

    a.send(Message::awareness(vec![42]).encode()).unwrap();
    assert_eq!(recv(&mut b).await, Message::awareness(vec![42]));

    b.send(Message::QueryAwareness.encode()).unwrap();
    assert_eq!(recv(&mut b).await, Message::awareness(vec![42]));

    drop(a);
    b.send(Message::QueryAwareness.encode()).unwrap();
    assert_silent(&mut b).await;
}

#[tokio::test]
async fn test_editor_sync_reconstructs_peer_edit() {
    let manager: RoomManager = RoomManager::new(Arc::new(MemoryStore::new()), config());
    let a = join(&manager, "r", Role::Editor).await;
    let mut b = join(&manager, "r", Role::Editor).await;

    a.send(Message::update(client_update(1, "hello")).encode()).unwrap();
    recv(&mut b).await;

    assert_eq!(fetch_text(&mut b).await, "hello");
}

#[tokio::test]
async fn test_viewer_sync_step2_is_dropped() {
    let manager: RoomManager = RoomManager::new(Arc::new(MemoryStore::new()), config());
    let viewer = join(&manager, "r2", Role::Viewer).await;
    viewer.send(Message::sync_step2(client_update(1, "x")).encode()).unwrap();

    let mut editor = join(&manager, "r2", Role::Editor).await;
    assert_eq!(fetch_text(&mut editor).await, "");
    assert_eq!(manager.room_stats("r2").await.unwrap().messages_denied, 1);
}

#[tokio::test]
async fn test_viewer_presence_reaches_editor() {
    let manager: RoomManager = RoomManager::new(Arc::new(MemoryStore::new()), config());
    let mut editor = join(&manager, "r", Role::Editor).await;
    let viewer = join(&manager, "r", Role::Viewer).await;

    let presence = Message::awareness(b"{\"cursor\":3}".to_vec());
    viewer.send(presence.encode()).unwrap();

    assert_eq!(recv(&mut editor).await, presence);
}
