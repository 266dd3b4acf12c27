//! Request coalescing for identical processing requests.
//!
//! When several callers ask for the same fingerprint at once, only the first
//! (the leader) runs the operator. Everyone else subscribes to a broadcast
//! channel and receives the leader's result.
//!
//! ```text
//! process_async(A) ─┐
//!                   │                          leader
//! process_async(A) ─┼──► Coalescer ──────────► operator
//!                   │        │                    │
//! process_async(A) ─┘        ▼                    ▼
//!                     [all receive the same Result]
//! ```

use super::error::ProcessingError;
use super::image::{Fingerprint, Image};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

pub(crate) type SharedResult = Result<Image, ProcessingError>;

/// Tracks in-flight computations by fingerprint.
pub(crate) struct Coalescer {
    in_flight: Arc<DashMap<Fingerprint, broadcast::Sender<SharedResult>>>,
    coalesced: AtomicU64,
}

/// Outcome of registering a request.
pub(crate) enum Registration {
    /// First request for this key: compute, then call [`LeaderGuard::complete`].
    Leader(LeaderGuard),
    /// Another request is computing this key; wait on the receiver.
    Follower(broadcast::Receiver<SharedResult>),
}

impl Coalescer {
    pub(crate) fn new() -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
            coalesced: AtomicU64::new(0),
        }
    }

    pub(crate) fn register(&self, key: Fingerprint) -> Registration {
        match self.in_flight.entry(key) {
            Entry::Occupied(entry) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = ?key, "Coalescing with in-flight computation");
                Registration::Follower(entry.get().subscribe())
            }
            Entry::Vacant(entry) => {
                // Capacity 1: exactly one value is ever sent per key
                let (tx, _rx) = broadcast::channel(1);
                entry.insert(tx);
                Registration::Leader(LeaderGuard {
                    key,
                    in_flight: Arc::clone(&self.in_flight),
                    completed: false,
                })
            }
        }
    }

    pub(crate) fn coalesced_count(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

/// Held by the leader of a coalesced computation.
///
/// Dropping the guard without completing (e.g. the leader's future was
/// cancelled) removes the entry and closes the channel, so followers get
/// [`ProcessingError::Abandoned`] instead of waiting forever.
pub(crate) struct LeaderGuard {
    key: Fingerprint,
    in_flight: Arc<DashMap<Fingerprint, broadcast::Sender<SharedResult>>>,
    completed: bool,
}

impl LeaderGuard {
    /// Broadcasts the result to every follower and retires the key.
    pub(crate) fn complete(mut self, result: SharedResult) {
        self.completed = true;
        if let Some((_, tx)) = self.in_flight.remove(&self.key) {
            let waiters = tx.receiver_count();
            let _ = tx.send(result);
            if waiters > 0 {
                debug!(fingerprint = ?self.key, waiters, "Broadcast result to coalesced waiters");
            }
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.in_flight.remove(&self.key);
        }
    }
}

/// Waits for a leader's result.
pub(crate) async fn follow(mut rx: broadcast::Receiver<SharedResult>) -> SharedResult {
    rx.recv().await.unwrap_or(Err(ProcessingError::Abandoned))
}
