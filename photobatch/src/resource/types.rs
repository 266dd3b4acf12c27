//! Value types for the resource ledger.

use std::fmt;
use std::time::Instant;
use thiserror::Error;

// =============================================================================
// Limits and Estimates
// =============================================================================

/// Upper bounds for memory and CPU reservations.
///
/// Limits are immutable once constructed. A [`ResourceManager`] may swap its
/// limits for a new value wholesale, but never edits them in place.
///
/// [`ResourceManager`]: super::ResourceManager
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum bytes that may be reserved at once.
    pub max_memory_bytes: u64,
    /// Maximum CPU cores that may be reserved at once.
    pub max_cpu_cores: u32,
}

impl ResourceLimits {
    /// Creates limits from raw values.
    pub fn new(max_memory_bytes: u64, max_cpu_cores: u32) -> Self {
        Self {
            max_memory_bytes,
            max_cpu_cores,
        }
    }
}

/// The footprint a task declares before it runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ResourceEstimate {
    /// Bytes of memory the task expects to hold.
    pub memory_bytes: u64,
    /// CPU cores the task expects to occupy.
    pub cpu_cores: u32,
}

impl ResourceEstimate {
    /// Creates an estimate from raw values.
    pub fn new(memory_bytes: u64, cpu_cores: u32) -> Self {
        Self {
            memory_bytes,
            cpu_cores,
        }
    }

    /// An estimate that reserves nothing.
    pub fn zero() -> Self {
        Self::default()
    }
}

impl fmt::Display for ResourceEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes / {} cores", self.memory_bytes, self.cpu_cores)
    }
}

// =============================================================================
// Allocations
// =============================================================================

/// Identifier of a live reservation in the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(pub(crate) u64);

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alloc-{}", self.0)
    }
}

/// A reserved slice of the memory/CPU budget.
///
/// Created by [`ResourceManager::allocate`] and returned to the budget by
/// [`ResourceManager::release`]. Releasing is keyed by [`AllocationId`], so a
/// cloned allocation released twice only frees the budget once.
///
/// [`ResourceManager::allocate`]: super::ResourceManager::allocate
/// [`ResourceManager::release`]: super::ResourceManager::release
#[derive(Clone, Debug)]
pub struct ResourceAllocation {
    pub(crate) id: AllocationId,
    pub(crate) memory_bytes: u64,
    pub(crate) cpu_cores: u32,
    pub(crate) allocated_at: Instant,
}

impl ResourceAllocation {
    /// Returns the ledger identifier.
    pub fn id(&self) -> AllocationId {
        self.id
    }

    /// Returns the reserved memory in bytes.
    pub fn memory_bytes(&self) -> u64 {
        self.memory_bytes
    }

    /// Returns the reserved CPU cores.
    pub fn cpu_cores(&self) -> u32 {
        self.cpu_cores
    }

    /// Returns when the reservation was granted.
    pub fn allocated_at(&self) -> Instant {
        self.allocated_at
    }
}

/// Snapshot of the ledger totals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    /// Bytes currently reserved.
    pub memory_bytes: u64,
    /// Cores currently reserved.
    pub cpu_cores: u32,
    /// Number of live allocations.
    pub live_allocations: usize,
}

/// Which budget a threshold event refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// The memory budget.
    Memory,
    /// The CPU budget.
    Cpu,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "Memory"),
            Self::Cpu => write!(f, "CPU"),
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors raised by the resource ledger.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResourceError {
    /// The reservation would exceed a limit.
    #[error("resources exhausted: requested {requested}, available {available_memory} bytes / {available_cpu} cores")]
    Exhausted {
        requested: ResourceEstimate,
        available_memory: u64,
        available_cpu: u32,
    },

    /// A threshold fraction outside `(0.0, 1.0]`.
    #[error("invalid threshold fraction {0}: must be in (0.0, 1.0]")]
    InvalidThreshold(f64),
}
