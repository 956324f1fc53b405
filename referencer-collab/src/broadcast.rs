//! Fan-out of accepted frames to N-1 sessions.
//!
//! Every recipient has its own bounded queue, so one slow or dead connection
//! never holds up the others. A failed hand-off evicts that session from the
//! registry and the loop moves on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::session::{Frame, SessionId, SessionRegistry, TransportError};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Frames handed to the relay
    pub messages_relayed: u64,
    /// Successful per-recipient hand-offs
    pub deliveries: u64,
    /// Hand-offs that failed and evicted the recipient
    pub failed_deliveries: u64,
}

/// Lock-free counters; read via [`BroadcastRelay::stats`].
#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    messages_relayed: AtomicU64,
    deliveries: AtomicU64,
    failed_deliveries: AtomicU64,
}

/// Result of one broadcast.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    /// Sessions removed from the registry because the hand-off failed
    pub evicted: Vec<(SessionId, TransportError)>,
}

/// Broadcast relay for a single room.
#[derive(Debug, Clone, Default)]
pub struct BroadcastRelay {
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `frame` unmodified to every session except `origin`.
    pub fn broadcast(
        &self,
        registry: &mut SessionRegistry,
        origin: SessionId,
        frame: Frame,
    ) -> BroadcastOutcome {
        let mut outcome = BroadcastOutcome::default();

        for session in registry.iter().filter(|s| s.id() != origin) {
            match session.send(frame.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(e) => outcome.evicted.push((session.id(), e)),
            }
        }

        for (id, e) in &outcome.evicted {
            registry.remove(id);
            log::warn!("Dropped session {id} during broadcast: {e}");
        }

        self.stats.messages_relayed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .deliveries
            .fetch_add(outcome.delivered as u64, Ordering::Relaxed);
        self.stats
            .failed_deliveries
            .fetch_add(outcome.evicted.len() as u64, Ordering::Relaxed);

        outcome
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_relayed: self.stats.messages_relayed.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            failed_deliveries: self.stats.failed_deliveries.load(Ordering::Relaxed),
        }
    }
}
