//! Per-task-type concurrency caps.
//!
//! Unlike the resource ledger, these caps count tasks, not bytes. They are
//! runtime adjustable: lowering a cap below the current running count simply
//! blocks further dispatch of that type until enough tasks finish.
//!
//! # Example
//!
//! ```ignore
//! use photobatch::coordinator::{TaskTypeLimits, TaskType};
//!
//! let limits = TaskTypeLimits::new()
//!     .with_limit(TaskType::Transform, 2)
//!     .with_limit(TaskType::Custom("thumbnail".into()), 1);
//! ```

use super::task::TaskType;
use std::collections::HashMap;

/// Fallback CPU count when detection fails.
pub const FALLBACK_CPU_COUNT: usize = 4;

/// Exports are I/O heavy, so they get more slots than there are cores.
pub const ANALYSIS_EXPORT_CPU_MULTIPLIER: usize = 2;

fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(FALLBACK_CPU_COUNT)
}

/// Default cap for [`TaskType::Transform`]: one per core.
pub fn default_transform_limit() -> usize {
    cpu_count()
}

/// Default cap for [`TaskType::AnalysisExport`].
pub fn default_analysis_export_limit() -> usize {
    cpu_count() * ANALYSIS_EXPORT_CPU_MULTIPLIER
}

/// Configured caps per task type. Types without an entry are uncapped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskTypeLimits {
    limits: HashMap<TaskType, usize>,
}

impl Default for TaskTypeLimits {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskTypeLimits {
    /// Creates limits with CPU-derived defaults for the built-in types.
    pub fn new() -> Self {
        Self::empty()
            .with_limit(TaskType::Transform, default_transform_limit())
            .with_limit(TaskType::AnalysisExport, default_analysis_export_limit())
    }

    /// Creates limits with no caps at all.
    pub fn empty() -> Self {
        Self {
            limits: HashMap::new(),
        }
    }

    pub fn with_limit(mut self, task_type: TaskType, limit: usize) -> Self {
        self.limits.insert(task_type, limit);
        self
    }

    pub fn set(&mut self, task_type: TaskType, limit: usize) {
        self.limits.insert(task_type, limit);
    }

    pub fn get(&self, task_type: &TaskType) -> Option<usize> {
        self.limits.get(task_type).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TaskType, &usize)> {
        self.limits.iter()
    }
}

/// Running counts checked against [`TaskTypeLimits`].
#[derive(Debug, Default)]
pub(crate) struct RunningCounts {
    by_type: HashMap<TaskType, usize>,
    total: usize,
}

impl RunningCounts {
    pub(crate) fn get(&self, task_type: &TaskType) -> usize {
        self.by_type.get(task_type).copied().unwrap_or(0)
    }

    pub(crate) fn total(&self) -> usize {
        self.total
    }

    pub(crate) fn has_capacity(&self, limits: &TaskTypeLimits, task_type: &TaskType) -> bool {
        limits
            .get(task_type)
            .is_none_or(|limit| self.get(task_type) < limit)
    }

    pub(crate) fn increment(&mut self, task_type: &TaskType) {
        *self.by_type.entry(task_type.clone()).or_insert(0) += 1;
        self.total += 1;
    }

    pub(crate) fn decrement(&mut self, task_type: &TaskType) {
        if let Some(count) = self.by_type.get_mut(task_type) {
            *count = count.saturating_sub(1);
            self.total = self.total.saturating_sub(1);
        }
    }
}
