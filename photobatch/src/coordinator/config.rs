//! Coordinator configuration.

use super::concurrency::TaskTypeLimits;
use std::time::Duration;

// =============================================================================
// Configuration Constants
// =============================================================================

/// Default maximum running tasks across all types.
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 64;

/// Default delay before retrying a resource-denied task.
pub const DEFAULT_REQUEUE_BASE_DELAY: Duration = Duration::from_millis(10);

/// Default ceiling for the re-queue delay.
pub const DEFAULT_REQUEUE_MAX_DELAY: Duration = Duration::from_millis(1000);

// =============================================================================
// Coordinator Configuration
// =============================================================================

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Maximum running tasks across all types.
    pub max_concurrent_tasks: usize,

    /// Delay after the first resource denial; doubles on each further denial.
    pub requeue_base_delay: Duration,

    /// Upper bound on the re-queue delay.
    pub requeue_max_delay: Duration,

    /// Caps per task type.
    pub type_limits: TaskTypeLimits,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            requeue_base_delay: DEFAULT_REQUEUE_BASE_DELAY,
            requeue_max_delay: DEFAULT_REQUEUE_MAX_DELAY,
            type_limits: TaskTypeLimits::new(),
        }
    }
}

impl CoordinatorConfig {
    /// Backoff before the next attempt after `denials` resource denials.
    pub fn requeue_delay(&self, denials: u32) -> Duration {
        let exponent = denials.saturating_sub(1).min(31);
        self.requeue_base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.requeue_max_delay)
            .min(self.requeue_max_delay)
    }
}

impl From<&crate::config::EngineConfig> for CoordinatorConfig {
    fn from(config: &crate::config::EngineConfig) -> Self {
        let mut type_limits = TaskTypeLimits::empty();
        for (task_type, limit) in &config.concurrency.limits {
            type_limits.set(task_type.clone(), *limit);
        }
        Self {
            max_concurrent_tasks: config.scheduler.max_concurrent_tasks,
            requeue_base_delay: config.scheduler.requeue_base_delay,
            requeue_max_delay: config.scheduler.requeue_max_delay,
            type_limits,
        }
    }
}
