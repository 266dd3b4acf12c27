//! Default values and the `EngineConfig::default()` implementation.

use super::settings::*;
use crate::coordinator::{
    default_analysis_export_limit, default_transform_limit, TaskType,
    DEFAULT_MAX_CONCURRENT_TASKS, DEFAULT_REQUEUE_BASE_DELAY, DEFAULT_REQUEUE_MAX_DELAY,
};
use crate::export::{ConflictPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY};
use crate::processor::{DEFAULT_CACHE_SIZE, DEFAULT_SHUTDOWN_GRACE};
use std::path::PathBuf;

/// Default memory budget: 4GB.
pub const DEFAULT_MAX_MEMORY: u64 = 4 * 1024 * 1024 * 1024;

/// Default usage alert threshold.
pub const DEFAULT_USAGE_ALERT_FRACTION: f64 = 0.9;

pub const DEFAULT_LOG_DIRECTORY: &str = "logs";
pub const DEFAULT_LOG_FILE: &str = "photobatch.log";

/// Number of available CPU cores, or 4 if it cannot be determined.
pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cpus = num_cpus();
        Self {
            resources: ResourceSettings {
                max_memory: DEFAULT_MAX_MEMORY,
                max_cpu_cores: u32::try_from(cpus).unwrap_or(u32::MAX),
                usage_alert_fraction: DEFAULT_USAGE_ALERT_FRACTION,
            },
            processor: ProcessorSettings {
                max_workers: cpus,
                cache_size: DEFAULT_CACHE_SIZE,
                shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            },
            scheduler: SchedulerSettings {
                max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
                requeue_base_delay: DEFAULT_REQUEUE_BASE_DELAY,
                requeue_max_delay: DEFAULT_REQUEUE_MAX_DELAY,
            },
            concurrency: ConcurrencySettings {
                limits: vec![
                    (TaskType::Transform, default_transform_limit()),
                    (TaskType::AnalysisExport, default_analysis_export_limit()),
                ],
            },
            export: ExportSettings {
                max_retry_attempts: DEFAULT_MAX_ATTEMPTS,
                retry_base_delay: DEFAULT_BASE_DELAY,
                retry_max_delay: DEFAULT_MAX_DELAY,
                conflict_policy: ConflictPolicy::default(),
            },
            logging: LoggingSettings {
                directory: PathBuf::from(DEFAULT_LOG_DIRECTORY),
                file: DEFAULT_LOG_FILE.to_string(),
            },
        }
    }
}
