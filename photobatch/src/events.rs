//! Progress events and observer delivery.
//!
//! Jobs publish [`ProgressEvent`]s to a [`ProgressBus`]. Publishing only
//! pushes onto per-observer unbounded channels. Each observer is driven by its
//! own delivery thread, in publish order, so a slow or blocking observer
//! delays only itself and never occupies a runtime worker. An observer that
//! panics is logged and skipped for that event.
//!
//! # Example
//!
//! ```ignore
//! let bus = ProgressBus::new();
//! let id = bus.subscribe(|event: &ProgressEvent| {
//!     println!("{}: {}% {}", event.job_id, event.percentage, event.message);
//! });
//! // ...
//! bus.unsubscribe(id);
//! ```

use crate::jobs::JobId;
use crate::panic::panic_message;
use futures::future::join_all;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, trace, warn};

/// A progress notification for one job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressEvent {
    pub job_id: JobId,
    /// Completion percentage, `0..=100`.
    pub percentage: u8,
    pub message: String,
}

/// Receives progress events on its own delivery thread.
pub trait ProgressObserver: Send + Sync + 'static {
    fn on_progress(&self, event: &ProgressEvent);
}

impl<F> ProgressObserver for F
where
    F: Fn(&ProgressEvent) + Send + Sync + 'static,
{
    fn on_progress(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Identifier returned by [`ProgressBus::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

enum Delivery {
    Event(ProgressEvent),
    Flush(oneshot::Sender<()>),
}

/// The sending half of one observer's delivery thread.
struct Subscriber {
    id: ObserverId,
    tx: mpsc::UnboundedSender<Delivery>,
}

/// Decoupled fan-out of progress events.
///
/// Delivery threads end when their observer is unsubscribed or the bus is
/// dropped, after draining events already queued.
pub struct ProgressBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn subscribe<O: ProgressObserver>(&self, observer: O) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        let spawned = thread::Builder::new()
            .name(format!("progress-observer-{}", id.0))
            .spawn(move || deliver(id, rx, observer));
        match spawned {
            Ok(_) => self.subscribers.lock().push(Subscriber { id, tx }),
            Err(e) => {
                error!(observer = ?id, error = %e, "Failed to start progress delivery thread")
            }
        }
        id
    }

    /// Removes an observer. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Queues an event for every observer. Never blocks on observers.
    ///
    /// The subscriber lock is held across the sends so concurrent publishers
    /// are seen in the same order by every observer.
    pub fn publish(&self, event: ProgressEvent) {
        let subscribers = self.subscribers.lock();
        for subscriber in subscribers.iter() {
            if subscriber.tx.send(Delivery::Event(event.clone())).is_err() {
                trace!(
                    observer = ?subscriber.id,
                    "Progress delivery thread has stopped; event dropped"
                );
            }
        }
    }

    /// Waits until every event published before this call was delivered to
    /// every observer.
    pub async fn flush(&self) {
        let pending: Vec<_> = {
            let subscribers = self.subscribers.lock();
            subscribers
                .iter()
                .filter_map(|subscriber| {
                    let (done_tx, done_rx) = oneshot::channel();
                    subscriber.tx.send(Delivery::Flush(done_tx)).ok().map(|_| done_rx)
                })
                .collect()
        };
        join_all(pending).await;
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProgressBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressBus")
            .field("observers", &self.observer_count())
            .finish()
    }
}

fn deliver<O: ProgressObserver>(
    id: ObserverId,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    observer: O,
) {
    while let Some(delivery) = rx.blocking_recv() {
        match delivery {
            Delivery::Event(event) => {
                if let Err(payload) =
                    catch_unwind(AssertUnwindSafe(|| observer.on_progress(&event)))
                {
                    warn!(
                        observer = ?id,
                        job_id = %event.job_id,
                        panic = %panic_message(payload.as_ref()),
                        "Progress observer panicked"
                    );
                }
            }
            Delivery::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    trace!(observer = ?id, "Progress delivery thread exiting");
}
