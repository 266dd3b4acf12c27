//! Settings structs, one per `[section]` of the INI file.
//!
//! Pure data; parsing lives in [`super::parser`] and serialization in
//! [`super::writer`].

use crate::coordinator::TaskType;
use crate::export::ConflictPolicy;
use std::path::PathBuf;
use std::time::Duration;

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub resources: ResourceSettings,
    pub processor: ProcessorSettings,
    pub scheduler: SchedulerSettings,
    pub concurrency: ConcurrencySettings,
    pub export: ExportSettings,
    pub logging: LoggingSettings,
}

/// `[resources]`: global memory and CPU budget.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSettings {
    /// Memory budget in bytes
    pub max_memory: u64,
    pub max_cpu_cores: u32,
    /// Fraction of either limit at which a usage warning is logged
    pub usage_alert_fraction: f64,
}

/// `[processor]`: worker pool and result cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorSettings {
    pub max_workers: usize,
    /// Cached results (entries, not bytes)
    pub cache_size: usize,
    pub shutdown_grace: Duration,
}

/// `[scheduler]`: coordinator dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub max_concurrent_tasks: usize,
    pub requeue_base_delay: Duration,
    pub requeue_max_delay: Duration,
}

/// `[concurrency]`: per task type caps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencySettings {
    /// In file order; later entries for the same type win.
    pub limits: Vec<(TaskType, usize)>,
}

/// `[export]`: retry and output behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSettings {
    /// Attempts per stage, including the first
    pub max_retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub conflict_policy: ConflictPolicy,
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub directory: PathBuf,
    pub file: String,
}
