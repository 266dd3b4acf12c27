//! Task execution context.

use super::task::TaskId;
use tokio_util::sync::CancellationToken;

/// Passed to every [`TaskBody::execute`] call.
///
/// The cancellation token is the task's own token: cancelling a handle, a
/// job, or the whole coordinator all flow through it.
///
/// [`TaskBody::execute`]: super::TaskBody::execute
#[derive(Clone, Debug)]
pub struct TaskContext {
    task_id: TaskId,
    cancellation: CancellationToken,
}

impl TaskContext {
    pub fn new(task_id: TaskId, cancellation: CancellationToken) -> Self {
        Self {
            task_id,
            cancellation,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Returns true once cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Completes when cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Returns a clone of the underlying token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}
