//! The resource ledger.
//!
//! [`ResourceManager`] is the single source of truth for how much memory and
//! CPU the engine has reserved. Every mutation is one critical section over
//! the ledger, so two callers can never both pass the limit check and
//! over-subscribe the budget.
//!
//! # Thresholds
//!
//! Callers may register callbacks that fire when usage crosses a fraction of
//! a limit. Callbacks are edge triggered (they fire once on the upward
//! crossing and re-arm when usage drops back below) and always run after the
//! ledger lock has been released. A panicking callback is logged and
//! otherwise ignored.
//!
//! # Example
//!
//! ```
//! use photobatch::resource::{ResourceEstimate, ResourceLimits, ResourceManager};
//!
//! let manager = ResourceManager::new(ResourceLimits::new(1024, 4));
//! let allocation = manager.allocate(ResourceEstimate::new(512, 1)).unwrap();
//! assert_eq!(manager.current_usage().memory_bytes, 512);
//!
//! manager.release(&allocation);
//! manager.release(&allocation); // no-op
//! assert_eq!(manager.current_usage().memory_bytes, 0);
//! ```

use super::types::{
    AllocationId, ResourceAllocation, ResourceError, ResourceEstimate, ResourceKind,
    ResourceLimits, ResourceUsage,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

// =============================================================================
// Threshold Types
// =============================================================================

/// Identifier returned when registering a threshold callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ThresholdId(u64);

/// Payload delivered to threshold callbacks.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ThresholdEvent {
    /// The budget that crossed its threshold.
    pub kind: ResourceKind,
    /// The registered fraction (e.g. `0.9`).
    pub fraction: f64,
    /// Reserved amount at the time of the crossing (bytes or cores).
    pub used: u64,
    /// The limit the fraction applies to.
    pub limit: u64,
}

type ThresholdCallback = Arc<dyn Fn(&ThresholdEvent) + Send + Sync>;

struct ThresholdState {
    watches: Vec<ThresholdWatch>,
    /// Ledger version of the last snapshot evaluated.
    applied_version: u64,
}

struct ThresholdWatch {
    id: ThresholdId,
    fraction: f64,
    callback: ThresholdCallback,
    memory_above: bool,
    cpu_above: bool,
}

// =============================================================================
// Ledger
// =============================================================================

struct Ledger {
    limits: ResourceLimits,
    memory_bytes: u64,
    cpu_cores: u32,
    live: HashMap<AllocationId, (u64, u32)>,
    next_id: u64,
    /// Bumped on every change to usage or limits.
    version: u64,
}

impl Ledger {
    fn usage(&self) -> ResourceUsage {
        ResourceUsage {
            memory_bytes: self.memory_bytes,
            cpu_cores: self.cpu_cores,
            live_allocations: self.live.len(),
        }
    }

    fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            version: self.version,
            usage: self.usage(),
            limits: self.limits,
        }
    }
}

/// Ledger state captured under the ledger lock and evaluated against
/// thresholds after it is released.
#[derive(Clone, Copy, Debug)]
struct LedgerSnapshot {
    version: u64,
    usage: ResourceUsage,
    limits: ResourceLimits,
}

/// Tracks and gates memory/CPU reservations against configured limits.
///
/// `allocate` never blocks: a caller that wants to wait for headroom must
/// retry on its own schedule.
pub struct ResourceManager {
    ledger: Mutex<Ledger>,
    thresholds: Mutex<ThresholdState>,
    next_threshold_id: AtomicU64,
}

impl ResourceManager {
    /// Creates a manager with the given limits and an empty ledger.
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            ledger: Mutex::new(Ledger {
                limits,
                memory_bytes: 0,
                cpu_cores: 0,
                live: HashMap::new(),
                next_id: 0,
                version: 0,
            }),
            thresholds: Mutex::new(ThresholdState {
                watches: Vec::new(),
                applied_version: 0,
            }),
            next_threshold_id: AtomicU64::new(0),
        }
    }

    /// Reserves the estimate, or fails with [`ResourceError::Exhausted`].
    ///
    /// The limit check and the reservation happen under one lock.
    pub fn allocate(&self, estimate: ResourceEstimate) -> Result<ResourceAllocation, ResourceError> {
        let (allocation, snapshot) = {
            let mut ledger = self.ledger.lock();
            let limits = ledger.limits;

            let memory_after = ledger.memory_bytes.checked_add(estimate.memory_bytes);
            let cpu_after = ledger.cpu_cores.checked_add(estimate.cpu_cores);
            let fits = matches!(
                (memory_after, cpu_after),
                (Some(m), Some(c)) if m <= limits.max_memory_bytes && c <= limits.max_cpu_cores
            );

            if !fits {
                let err = ResourceError::Exhausted {
                    requested: estimate,
                    available_memory: limits.max_memory_bytes.saturating_sub(ledger.memory_bytes),
                    available_cpu: limits.max_cpu_cores.saturating_sub(ledger.cpu_cores),
                };
                trace!(%estimate, "Allocation denied");
                return Err(err);
            }

            ledger.next_id += 1;
            ledger.version += 1;
            let id = AllocationId(ledger.next_id);
            ledger.memory_bytes += estimate.memory_bytes;
            ledger.cpu_cores += estimate.cpu_cores;
            ledger
                .live
                .insert(id, (estimate.memory_bytes, estimate.cpu_cores));

            let allocation = ResourceAllocation {
                id,
                memory_bytes: estimate.memory_bytes,
                cpu_cores: estimate.cpu_cores,
                allocated_at: Instant::now(),
            };
            (allocation, ledger.snapshot())
        };

        debug!(
            allocation = %allocation.id,
            memory = allocation.memory_bytes,
            cpu = allocation.cpu_cores,
            used_memory = snapshot.usage.memory_bytes,
            used_cpu = snapshot.usage.cpu_cores,
            "Resources allocated"
        );

        self.evaluate_thresholds(snapshot);
        Ok(allocation)
    }

    /// Returns an allocation to the budget.
    ///
    /// Releasing an allocation that is no longer live is a no-op.
    pub fn release(&self, allocation: &ResourceAllocation) {
        let released = {
            let mut ledger = self.ledger.lock();
            match ledger.live.remove(&allocation.id) {
                Some((memory, cpu)) => {
                    ledger.memory_bytes -= memory;
                    ledger.cpu_cores -= cpu;
                    ledger.version += 1;
                    Some(ledger.snapshot())
                }
                None => None,
            }
        };

        match released {
            Some(snapshot) => {
                debug!(
                    allocation = %allocation.id,
                    held_ms = allocation.allocated_at.elapsed().as_millis() as u64,
                    used_memory = snapshot.usage.memory_bytes,
                    used_cpu = snapshot.usage.cpu_cores,
                    "Resources released"
                );
                self.evaluate_thresholds(snapshot);
            }
            None => trace!(allocation = %allocation.id, "Release of inactive allocation ignored"),
        }
    }

    /// Returns a snapshot of current reservations.
    pub fn current_usage(&self) -> ResourceUsage {
        self.ledger.lock().usage()
    }

    /// Returns the current limits.
    pub fn limits(&self) -> ResourceLimits {
        self.ledger.lock().limits
    }

    /// Returns the unreserved headroom as an estimate.
    pub fn available(&self) -> ResourceEstimate {
        let ledger = self.ledger.lock();
        ResourceEstimate {
            memory_bytes: ledger.limits.max_memory_bytes.saturating_sub(ledger.memory_bytes),
            cpu_cores: ledger.limits.max_cpu_cores.saturating_sub(ledger.cpu_cores),
        }
    }

    /// Returns true if the estimate could be granted on an empty ledger.
    ///
    /// An estimate that fails this check will never be granted, no matter
    /// how long the caller waits.
    pub fn fits_within_limits(&self, estimate: ResourceEstimate) -> bool {
        let limits = self.limits();
        estimate.memory_bytes <= limits.max_memory_bytes
            && estimate.cpu_cores <= limits.max_cpu_cores
    }

    /// Replaces the limits wholesale.
    ///
    /// Live allocations are kept. If usage now exceeds the new limits, new
    /// allocations are denied until enough is released.
    pub fn replace_limits(&self, limits: ResourceLimits) {
        let snapshot = {
            let mut ledger = self.ledger.lock();
            ledger.limits = limits;
            ledger.version += 1;
            ledger.snapshot()
        };
        debug!(
            max_memory = limits.max_memory_bytes,
            max_cpu = limits.max_cpu_cores,
            "Resource limits replaced"
        );
        self.evaluate_thresholds(snapshot);
    }

    // -------------------------------------------------------------------------
    // Threshold callbacks
    // -------------------------------------------------------------------------

    /// Registers a callback fired when usage crosses `fraction` of a limit.
    pub fn register_threshold<F>(&self, fraction: f64, callback: F) -> Result<ThresholdId, ResourceError>
    where
        F: Fn(&ThresholdEvent) + Send + Sync + 'static,
    {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(ResourceError::InvalidThreshold(fraction));
        }

        let id = ThresholdId(self.next_threshold_id.fetch_add(1, Ordering::Relaxed));
        let LedgerSnapshot { usage, limits, .. } = self.ledger.lock().snapshot();

        // Start armed relative to current usage so registration never fires.
        let watch = ThresholdWatch {
            id,
            fraction,
            callback: Arc::new(callback),
            memory_above: is_above(usage.memory_bytes, limits.max_memory_bytes, fraction),
            cpu_above: is_above(usage.cpu_cores as u64, limits.max_cpu_cores as u64, fraction),
        };
        self.thresholds.lock().watches.push(watch);
        Ok(id)
    }

    /// Removes a threshold callback. Returns false if it was not registered.
    pub fn unregister_threshold(&self, id: ThresholdId) -> bool {
        let mut thresholds = self.thresholds.lock();
        let before = thresholds.watches.len();
        thresholds.watches.retain(|w| w.id != id);
        thresholds.watches.len() != before
    }

    /// Applies a snapshot to every watch. Snapshots reach here in whatever
    /// order their callers won the thresholds lock, so one older than the
    /// last applied is dropped.
    fn evaluate_thresholds(&self, snapshot: LedgerSnapshot) {
        let LedgerSnapshot {
            version,
            usage,
            limits,
        } = snapshot;
        let mut fired: Vec<(ThresholdCallback, ThresholdEvent)> = Vec::new();
        {
            let mut thresholds = self.thresholds.lock();
            if version <= thresholds.applied_version {
                trace!(version, applied = thresholds.applied_version, "Stale usage snapshot dropped");
                return;
            }
            thresholds.applied_version = version;
            for watch in thresholds.watches.iter_mut() {
                let memory_now =
                    is_above(usage.memory_bytes, limits.max_memory_bytes, watch.fraction);
                if memory_now && !watch.memory_above {
                    fired.push((
                        Arc::clone(&watch.callback),
                        ThresholdEvent {
                            kind: ResourceKind::Memory,
                            fraction: watch.fraction,
                            used: usage.memory_bytes,
                            limit: limits.max_memory_bytes,
                        },
                    ));
                }
                watch.memory_above = memory_now;

                let cpu_now = is_above(
                    usage.cpu_cores as u64,
                    limits.max_cpu_cores as u64,
                    watch.fraction,
                );
                if cpu_now && !watch.cpu_above {
                    fired.push((
                        Arc::clone(&watch.callback),
                        ThresholdEvent {
                            kind: ResourceKind::Cpu,
                            fraction: watch.fraction,
                            used: usage.cpu_cores as u64,
                            limit: limits.max_cpu_cores as u64,
                        },
                    ));
                }
                watch.cpu_above = cpu_now;
            }
        }

        for (callback, event) in fired {
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                warn!(
                    kind = %event.kind,
                    fraction = event.fraction,
                    "Resource threshold callback panicked"
                );
            }
        }
    }
}

fn is_above(used: u64, limit: u64, fraction: f64) -> bool {
    limit > 0 && used as f64 >= limit as f64 * fraction
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ledger = self.ledger.lock();
        f.debug_struct("ResourceManager")
            .field(
                "memory",
                &format_args!("{}/{}", ledger.memory_bytes, ledger.limits.max_memory_bytes),
            )
            .field(
                "cpu",
                &format_args!("{}/{}", ledger.cpu_cores, ledger.limits.max_cpu_cores),
            )
            .field("live", &ledger.live.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    fn manager(memory: u64, cpu: u32) -> ResourceManager {
        ResourceManager::new(ResourceLimits::new(memory, cpu))
    }

    #[test]
    fn test_allocate_and_release() {
        let rm = manager(1000, 4);

        let a = rm.allocate(ResourceEstimate::new(400, 1)).unwrap();
        let b = rm.allocate(ResourceEstimate::new(600, 3)).unwrap();
        assert_eq!(rm.current_usage().memory_bytes, 1000);
        assert_eq!(rm.current_usage().cpu_cores, 4);
        assert_eq!(rm.current_usage().live_allocations, 2);

        rm.release(&a);
        assert_eq!(rm.current_usage().memory_bytes, 600);

        rm.release(&b);
        assert_eq!(rm.current_usage(), ResourceUsage::default());
    }

    #[test]
    fn test_allocate_denied_when_over_limit() {
        let rm = manager(1000, 4);
        let _held = rm.allocate(ResourceEstimate::new(900, 1)).unwrap();

        let err = rm.allocate(ResourceEstimate::new(200, 1)).unwrap_err();
        assert_eq!(
            err,
            ResourceError::Exhausted {
                requested: ResourceEstimate::new(200, 1),
                available_memory: 100,
                available_cpu: 3,
            }
        );
        // Denied allocation leaves the ledger untouched
        assert_eq!(rm.current_usage().memory_bytes, 900);
    }

    #[test]
    fn test_cpu_limit_enforced_independently() {
        let rm = manager(1000, 2);
        let _a = rm.allocate(ResourceEstimate::new(1, 2)).unwrap();
        assert!(rm.allocate(ResourceEstimate::new(1, 1)).is_err());
        assert!(rm.allocate(ResourceEstimate::new(1, 0)).is_ok());
    }

    #[test]
    fn test_release_is_idempotent() {
        let rm = manager(1000, 4);
        let a = rm.allocate(ResourceEstimate::new(500, 2)).unwrap();
        let copy = a.clone();

        rm.release(&a);
        rm.release(&a);
        rm.release(&copy);

        assert_eq!(rm.current_usage(), ResourceUsage::default());
    }

    #[test]
    fn test_overflowing_estimate_is_denied() {
        let rm = manager(u64::MAX, 4);
        let _a = rm.allocate(ResourceEstimate::new(u64::MAX - 1, 0)).unwrap();
        assert!(rm.allocate(ResourceEstimate::new(10, 0)).is_err());
    }

    #[test]
    fn test_fits_within_limits() {
        let rm = manager(100, 2);
        assert!(rm.fits_within_limits(ResourceEstimate::new(100, 2)));
        assert!(!rm.fits_within_limits(ResourceEstimate::new(101, 1)));
        assert!(!rm.fits_within_limits(ResourceEstimate::new(1, 3)));
    }

    #[test]
    fn test_available_reports_headroom() {
        let rm = manager(100, 4);
        let _a = rm.allocate(ResourceEstimate::new(30, 1)).unwrap();
        assert_eq!(rm.available(), ResourceEstimate::new(70, 3));
    }

    #[test]
    fn test_replace_limits_keeps_live_allocations() {
        let rm = manager(100, 4);
        let a = rm.allocate(ResourceEstimate::new(80, 2)).unwrap();

        rm.replace_limits(ResourceLimits::new(50, 4));
        assert_eq!(rm.current_usage().memory_bytes, 80);
        assert!(rm.allocate(ResourceEstimate::new(1, 0)).is_err());

        rm.release(&a);
        assert!(rm.allocate(ResourceEstimate::new(50, 0)).is_ok());
    }

    #[test]
    fn test_threshold_fires_on_upward_crossing_only() {
        let rm = manager(100, 10);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        rm.register_threshold(0.9, move |event| {
            assert_eq!(event.kind, ResourceKind::Memory);
            fired_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let a = rm.allocate(ResourceEstimate::new(50, 0)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let b = rm.allocate(ResourceEstimate::new(45, 0)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Still above: no second event
        let c = rm.allocate(ResourceEstimate::new(1, 0)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Drop below, cross again
        rm.release(&b);
        rm.release(&c);
        let _d = rm.allocate(ResourceEstimate::new(45, 0)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        rm.release(&a);
    }

    #[test]
    fn test_threshold_ignores_out_of_order_snapshot() {
        let rm = manager(100, 10);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        rm.register_threshold(0.9, move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let a = rm.allocate(ResourceEstimate::new(95, 0)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let above = rm.ledger.lock().snapshot();

        rm.release(&a);
        // A racing caller applies its older "above" snapshot late.
        rm.evaluate_thresholds(above);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let _b = rm.allocate(ResourceEstimate::new(95, 0)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_threshold_cpu_event() {
        let rm = manager(1_000_000, 4);
        let kinds = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let kinds_clone = Arc::clone(&kinds);
        rm.register_threshold(0.75, move |event| kinds_clone.lock().push(event.kind))
            .unwrap();

        let _a = rm.allocate(ResourceEstimate::new(10, 3)).unwrap();
        assert_eq!(*kinds.lock(), vec![ResourceKind::Cpu]);
    }

    #[test]
    fn test_panicking_threshold_callback_does_not_break_allocation() {
        let rm = manager(100, 4);
        let other = Arc::new(AtomicUsize::new(0));
        let other_clone = Arc::clone(&other);

        rm.register_threshold(0.5, |_| panic!("observer bug")).unwrap();
        rm.register_threshold(0.5, move |_| {
            other_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let a = rm.allocate(ResourceEstimate::new(60, 0)).unwrap();
        assert_eq!(rm.current_usage().memory_bytes, 60);
        assert_eq!(other.load(Ordering::SeqCst), 1);

        rm.release(&a);
        assert_eq!(rm.current_usage().memory_bytes, 0);
    }

    #[test]
    fn test_unregister_threshold() {
        let rm = manager(100, 4);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let id = rm
            .register_threshold(0.5, move |_| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(rm.unregister_threshold(id));
        assert!(!rm.unregister_threshold(id));

        let _a = rm.allocate(ResourceEstimate::new(90, 0)).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invalid_threshold_fraction() {
        let rm = manager(100, 4);
        assert!(matches!(
            rm.register_threshold(0.0, |_| {}),
            Err(ResourceError::InvalidThreshold(_))
        ));
        assert!(rm.register_threshold(1.5, |_| {}).is_err());
        assert!(rm.register_threshold(1.0, |_| {}).is_ok());
    }

    #[test]
    fn test_concurrent_allocations_never_oversubscribe() {
        let rm = Arc::new(manager(1000, 1000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rm = Arc::clone(&rm);
                std::thread::spawn(move || {
                    let mut held = Vec::new();
                    for _ in 0..200 {
                        if let Ok(a) = rm.allocate(ResourceEstimate::new(70, 1)) {
                            assert!(rm.current_usage().memory_bytes <= 1000);
                            held.push(a);
                        }
                        if held.len() > 2 {
                            rm.release(&held.remove(0));
                        }
                    }
                    for a in held {
                        rm.release(&a);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(rm.current_usage(), ResourceUsage::default());
    }

    #[test]
    fn test_debug_format() {
        let rm = manager(100, 4);
        let debug = format!("{:?}", rm);
        assert!(debug.contains("ResourceManager"));
        assert!(debug.contains("0/100"));
    }

    proptest! {
        /// Property: usage never exceeds the limits after any allocate/release sequence.
        #[test]
        fn prop_usage_never_exceeds_limits(
            ops in proptest::collection::vec((any::<bool>(), 0u64..400, 0u32..3, any::<prop::sample::Index>()), 1..100)
        ) {
            let rm = manager(1000, 4);
            let mut live: Vec<ResourceAllocation> = Vec::new();

            for (is_alloc, memory, cpu, index) in ops {
                if is_alloc || live.is_empty() {
                    if let Ok(a) = rm.allocate(ResourceEstimate::new(memory, cpu)) {
                        live.push(a);
                    }
                } else {
                    let a = live.remove(index.index(live.len()));
                    rm.release(&a);
                }

                let usage = rm.current_usage();
                prop_assert!(usage.memory_bytes <= 1000);
                prop_assert!(usage.cpu_cores <= 4);
                prop_assert_eq!(usage.live_allocations, live.len());
            }
        }
    }
}
