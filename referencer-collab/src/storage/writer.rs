//! Background snapshot writer with retry and backoff.
//!
//! One writer task per room. Snapshots queue on an unbounded channel and are
//! coalesced to the newest before each write, so a slow store never makes
//! the room actor wait and never writes stale state after fresher state.
//!
//! A room that is evicted and reactivated gets a new writer. The new writer
//! retires its predecessor through a [`WriterLease`] and waits for it to stop
//! before its first save, so writes for one room never interleave.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{SnapshotStore, StoreError};

/// Exponential backoff for store calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Attempts per snapshot (or per load) before giving up
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
            max_attempts: 8,
        }
    }
}

impl RetryPolicy {
    /// Millisecond backoff for tests.
    pub fn for_testing() -> Self {
        Self {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            max_attempts: 8,
        }
    }

    /// Delay after the `attempt`-th failure (0-based), doubling up to `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Persistence counters, shared by every writer of a manager.
#[derive(Debug, Default)]
pub struct PersistCounters {
    snapshots_saved: AtomicU64,
    save_failures: AtomicU64,
    snapshots_abandoned: AtomicU64,
}

impl PersistCounters {
    pub fn stats(&self) -> PersistStats {
        PersistStats {
            snapshots_saved: self.snapshots_saved.load(Ordering::Relaxed),
            save_failures: self.save_failures.load(Ordering::Relaxed),
            snapshots_abandoned: self.snapshots_abandoned.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PersistCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistStats {
    pub snapshots_saved: u64,
    /// Failed store calls, including ones later retried successfully
    pub save_failures: u64,
    /// Snapshots dropped after exhausting the retry policy
    pub snapshots_abandoned: u64,
}

/// Claim on a writer held by whoever may replace it.
#[derive(Clone)]
pub struct WriterLease {
    retire: Arc<watch::Sender<bool>>,
    stopped: watch::Receiver<()>,
}

impl WriterLease {
    /// Discard whatever the writer still holds and wait until it has stopped.
    /// A store call already running is allowed to finish first.
    pub async fn retire(mut self) {
        self.retire.send_replace(true);
        while self.stopped.changed().await.is_ok() {}
    }
}

/// Handle to a room's writer task.
pub struct SnapshotWriter {
    tx: mpsc::UnboundedSender<Arc<Vec<u8>>>,
    task: JoinHandle<()>,
    lease: WriterLease,
}

impl SnapshotWriter {
    /// Start a writer. With a `predecessor`, nothing is written until the
    /// predecessor has been retired and stopped.
    pub fn spawn(
        room: String,
        store: Arc<dyn SnapshotStore>,
        policy: RetryPolicy,
        counters: Arc<PersistCounters>,
        predecessor: Option<WriterLease>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let retire = Arc::new(watch::channel(false).0);
        let (stopped_tx, stopped) = watch::channel(());
        let writer = Writer {
            room,
            store,
            policy,
            counters,
            retired: retire.subscribe(),
            _retire: retire.clone(),
            _stopped: stopped_tx,
        };
        let task = tokio::spawn(writer.run(rx, predecessor));
        Self {
            tx,
            task,
            lease: WriterLease { retire, stopped },
        }
    }

    pub fn lease(&self) -> WriterLease {
        self.lease.clone()
    }

    /// Queue a snapshot. Never waits.
    pub fn submit(&self, snapshot: Arc<Vec<u8>>) {
        if self.tx.send(snapshot).is_err() {
            log::error!("Snapshot writer stopped; snapshot dropped");
        }
    }

    /// Stop accepting snapshots and wait until the queued ones are written
    /// (or abandoned).
    pub async fn close(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            log::error!("Snapshot writer task failed: {e}");
        }
    }
}

struct Writer {
    room: String,
    store: Arc<dyn SnapshotStore>,
    policy: RetryPolicy,
    counters: Arc<PersistCounters>,
    retired: watch::Receiver<bool>,
    // Keeps `retired` from reporting a closed channel
    _retire: Arc<watch::Sender<bool>>,
    // Dropped when the task ends, which wakes `WriterLease::retire`
    _stopped: watch::Sender<()>,
}

impl Writer {
    fn is_retired(&self) -> bool {
        *self.retired.borrow()
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Arc<Vec<u8>>>,
        predecessor: Option<WriterLease>,
    ) {
        let room = self.room.clone();
        if let Some(predecessor) = predecessor {
            predecessor.retire().await;
            log::debug!("Previous writer for room {room} stopped");
        }

        let mut open = true;
        let mut pending: Option<Arc<Vec<u8>>> = None;

        loop {
            let mut snapshot = match pending.take() {
                Some(snapshot) => snapshot,
                None if open => match rx.recv().await {
                    Some(snapshot) => snapshot,
                    None => break,
                },
                None => break,
            };
            while let Ok(newer) = rx.try_recv() {
                snapshot = newer;
            }

            let mut attempt = 0;
            loop {
                if self.is_retired() {
                    log::debug!("Writer for room {room} retired with a snapshot pending");
                    return;
                }
                let result = save_blocking(&self.store, &room, snapshot.clone()).await;
                let e = match result {
                    Ok(()) => {
                        self.counters.snapshots_saved.fetch_add(1, Ordering::Relaxed);
                        log::debug!("Saved snapshot for room {room} ({} bytes)", snapshot.len());
                        break;
                    }
                    Err(e) => e,
                };

                self.counters.save_failures.fetch_add(1, Ordering::Relaxed);
                attempt += 1;
                if attempt >= self.policy.max_attempts {
                    self.counters.snapshots_abandoned.fetch_add(1, Ordering::Relaxed);
                    log::error!("Giving up on snapshot for room {room} after {attempt} attempts: {e}");
                    break;
                }

                let delay = self.policy.backoff(attempt - 1);
                log::warn!("Snapshot save for room {room} failed (attempt {attempt}), retrying in {delay:?}: {e}");

                let sleep = tokio::time::sleep(delay);
                tokio::pin!(sleep);
                let newer = loop {
                    tokio::select! {
                        _ = &mut sleep => break None,
                        _ = self.retired.changed() => break None,
                        next = rx.recv(), if open => match next {
                            Some(newer) => break Some(newer),
                            None => open = false,
                        },
                    }
                };
                if let Some(newer) = newer {
                    log::debug!("Newer snapshot for room {room} supersedes the failing one");
                    pending = Some(newer);
                    break;
                }
            }

            if self.is_retired() {
                break;
            }
        }

        log::debug!("Snapshot writer for room {room} stopped");
    }
}

async fn save_blocking(
    store: &Arc<dyn SnapshotStore>,
    room: &str,
    snapshot: Arc<Vec<u8>>,
) -> Result<(), StoreError> {
    let store = store.clone();
    let room = room.to_string();
    tokio::task::spawn_blocking(move || store.save(&room, &snapshot))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

/// Load a room's snapshot, retrying failures per `policy`. Returns the last
/// error once attempts are exhausted.
pub async fn load_with_retry(
    store: &Arc<dyn SnapshotStore>,
    room: &str,
    policy: &RetryPolicy,
) -> Result<Option<Vec<u8>>, StoreError> {
    let mut attempt = 0;
    loop {
        let store_ref = store.clone();
        let name = room.to_string();
        let result = tokio::task::spawn_blocking(move || store_ref.load(&name))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))
            .and_then(|r| r);

        match result {
            Ok(snapshot) => return Ok(snapshot),
            Err(e) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(e);
                }
                let delay = policy.backoff(attempt - 1);
                log::warn!("Loading room {room} failed (attempt {attempt}), retrying in {delay:?}: {e}");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Fails the first `failures` calls, and always fails on `poison` content.
    #[derive(Default)]
    struct FlakyStore {
        failures: AtomicUsize,
        poison: Option<Vec<u8>>,
        saves: Mutex<Vec<Vec<u8>>>,
        inner: MemoryStore,
    }

    impl FlakyStore {
        fn failing(n: usize) -> Self {
            Self {
                failures: AtomicUsize::new(n),
                ..Self::default()
            }
        }

        fn should_fail(&self) -> bool {
            self.failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }

        fn saves(&self) -> Vec<Vec<u8>> {
            self.saves.lock().unwrap().clone()
        }
    }

    impl SnapshotStore for FlakyStore {
        fn load(&self, room: &str) -> Result<Option<Vec<u8>>, StoreError> {
            if self.should_fail() {
                return Err(StoreError::Unavailable("flaky".into()));
            }
            self.inner.load(room)
        }

        fn save(&self, room: &str, snapshot: &[u8]) -> Result<(), StoreError> {
            if self.should_fail() || self.poison.as_deref() == Some(snapshot) {
                return Err(StoreError::Unavailable("flaky".into()));
            }
            self.saves.lock().unwrap().push(snapshot.to_vec());
            self.inner.save(room, snapshot)
        }
    }

    fn spawn_writer(store: &Arc<FlakyStore>, policy: RetryPolicy) -> (SnapshotWriter, Arc<PersistCounters>) {
        let counters = Arc::new(PersistCounters::default());
        let store: Arc<dyn SnapshotStore> = store.clone();
        let writer = SnapshotWriter::spawn("room".into(), store, policy, counters.clone(), None);
        (writer, counters)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(250));
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(3), Duration::from_secs(2));
        assert_eq!(policy.backoff(6), Duration::from_secs(10));
        assert_eq!(policy.backoff(40), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_writer_saves_snapshot() {
        let store = Arc::new(FlakyStore::default());
        let (writer, counters) = spawn_writer(&store, RetryPolicy::for_testing());

        writer.submit(Arc::new(vec![1, 2, 3]));
        writer.close().await;

        assert_eq!(store.inner.load("room").unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(counters.stats().snapshots_saved, 1);
    }

    #[tokio::test]
    async fn test_writer_coalesces_to_newest() {
        let store = Arc::new(FlakyStore::default());
        let (writer, counters) = spawn_writer(&store, RetryPolicy::for_testing());

        // Current-thread runtime: the writer cannot run until close() yields
        writer.submit(Arc::new(vec![1]));
        writer.submit(Arc::new(vec![2]));
        writer.submit(Arc::new(vec![3]));
        writer.close().await;

        assert_eq!(store.saves(), vec![vec![3]]);
        assert_eq!(counters.stats().snapshots_saved, 1);
    }

    #[tokio::test]
    async fn test_writer_retries_until_success() {
        let store = Arc::new(FlakyStore::failing(2));
        let (writer, counters) = spawn_writer(&store, RetryPolicy::for_testing());

        writer.submit(Arc::new(vec![7]));
        writer.close().await;

        assert_eq!(store.saves(), vec![vec![7]]);
        let stats = counters.stats();
        assert_eq!(stats.save_failures, 2);
        assert_eq!(stats.snapshots_saved, 1);
        assert_eq!(stats.snapshots_abandoned, 0);
    }

    #[tokio::test]
    async fn test_writer_gives_up_after_max_attempts() {
        let store = Arc::new(FlakyStore::failing(usize::MAX));
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::for_testing()
        };
        let (writer, counters) = spawn_writer(&store, policy);

        writer.submit(Arc::new(vec![1]));
        writer.close().await;

        assert!(store.saves().is_empty());
        assert_eq!(
            counters.stats(),
            PersistStats {
                snapshots_saved: 0,
                save_failures: 3,
                snapshots_abandoned: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_newer_snapshot_supersedes_failing_one() {
        let store = Arc::new(FlakyStore {
            poison: Some(vec![1]),
            ..FlakyStore::default()
        });
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(20),
            max_attempts: u32::MAX,
        };
        let (writer, _counters) = spawn_writer(&store, policy);

        writer.submit(Arc::new(vec![1]));
        tokio::time::sleep(Duration::from_millis(5)).await;
        writer.submit(Arc::new(vec![2]));
        writer.close().await;

        assert_eq!(store.saves(), vec![vec![2]]);
    }

    #[tokio::test]
    async fn test_successor_waits_for_retired_writer() {
        let store = Arc::new(FlakyStore::failing(usize::MAX));
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(20),
            max_attempts: u32::MAX,
        };
        let (old, counters) = spawn_writer(&store, policy);
        old.submit(Arc::new(vec![1]));
        while counters.stats().save_failures == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // Store recovers; the old writer must not land its stale snapshot
        store.failures.store(0, Ordering::SeqCst);
        let dyn_store: Arc<dyn SnapshotStore> = store.clone();
        let new = SnapshotWriter::spawn(
            "room".into(),
            dyn_store,
            policy,
            counters.clone(),
            Some(old.lease()),
        );
        new.submit(Arc::new(vec![2]));
        new.close().await;
        old.close().await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(store.saves(), vec![vec![2]]);
        assert_eq!(store.inner.load("room").unwrap(), Some(vec![2]));
        assert_eq!(counters.stats().snapshots_abandoned, 0);
    }

    #[tokio::test]
    async fn test_retire_after_writer_stopped_returns() {
        let store = Arc::new(FlakyStore::default());
        let (writer, _counters) = spawn_writer(&store, RetryPolicy::for_testing());
        let lease = writer.lease();
        writer.close().await;

        tokio::time::timeout(Duration::from_secs(1), lease.retire())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_load_with_retry() {
        let flaky = Arc::new(FlakyStore::failing(2));
        flaky.inner.save("room", &[5]).unwrap();
        let store: Arc<dyn SnapshotStore> = flaky;

        let loaded = load_with_retry(&store, "room", &RetryPolicy::for_testing()).await;
        assert_eq!(loaded, Ok(Some(vec![5])));
    }

    #[tokio::test]
    async fn test_load_with_retry_exhausted() {
        let store: Arc<dyn SnapshotStore> = Arc::new(FlakyStore::failing(usize::MAX));
        let policy = RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::for_testing()
        };

        let loaded = load_with_retry(&store, "room", &policy).await;
        assert!(matches!(loaded, Err(StoreError::Unavailable(_))));
    }
}
