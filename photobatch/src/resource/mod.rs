//! Memory and CPU budget tracking.
//!
//! The [`ResourceManager`] is the leaf of the engine: the task coordinator
//! asks it to admit each task's estimated footprint before dispatch, and the
//! concurrent processor sizes its worker pool from its CPU limit.
//!
//! Unlike a semaphore pool, the ledger is measured in bytes and cores and
//! never blocks. Back-pressure (retry with backoff) is the caller's policy.

mod manager;
mod types;

pub use manager::{ResourceManager, ThresholdEvent, ThresholdId};
pub use types::{
    AllocationId, ResourceAllocation, ResourceError, ResourceEstimate, ResourceKind,
    ResourceLimits, ResourceUsage,
};
