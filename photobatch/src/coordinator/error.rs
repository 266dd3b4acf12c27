use super::task::TaskId;
use crate::resource::{ResourceEstimate, ResourceLimits};
use thiserror::Error;

/// Errors raised by the task coordinator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoordinatorError {
    /// The task's estimate exceeds the limits outright and can never run.
    #[error("task {task_id} can never be scheduled: estimate {estimate} exceeds limits ({} bytes / {} cores)", .limits.max_memory_bytes, .limits.max_cpu_cores)]
    Unschedulable {
        task_id: TaskId,
        estimate: ResourceEstimate,
        limits: ResourceLimits,
    },

    /// The coordinator has been shut down and accepts no more work.
    #[error("coordinator is shut down")]
    ShutDown,
}
