//! Task handles.
//!
//! A [`TaskHandle`] is returned by [`TaskCoordinator::submit`]. It is cheap to
//! clone and every clone observes the same task.
//!
//! # Example
//!
//! ```ignore
//! let handle = coordinator.submit(task)?;
//!
//! if handle.status() == TaskStatus::Pending {
//!     coordinator.cancel(&handle);
//! }
//!
//! let result = handle.wait().await;
//! ```
//!
//! [`TaskCoordinator::submit`]: super::TaskCoordinator::submit

use super::task::{TaskId, TaskResult, TaskStatus, TaskType};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Shared per-task state: status broadcast, final result and cancel token.
pub(crate) struct TaskCell {
    pub(crate) id: TaskId,
    pub(crate) task_type: TaskType,
    pub(crate) cancellation: CancellationToken,
    status_tx: watch::Sender<TaskStatus>,
    result: Mutex<Option<TaskResult>>,
}

impl TaskCell {
    pub(crate) fn new(id: TaskId, task_type: TaskType, cancellation: CancellationToken) -> Arc<Self> {
        let (status_tx, _) = watch::channel(TaskStatus::Pending);
        Arc::new(Self {
            id,
            task_type,
            cancellation,
            status_tx,
            result: Mutex::new(None),
        })
    }

    pub(crate) fn status(&self) -> TaskStatus {
        *self.status_tx.borrow()
    }

    /// Moves a pending task to running. Ignored once terminal.
    pub(crate) fn mark_running(&self) {
        self.status_tx.send_if_modified(|status| {
            if *status == TaskStatus::Pending {
                *status = TaskStatus::Running;
                true
            } else {
                false
            }
        });
    }

    /// Stores the final result. Returns false if a result was already stored.
    pub(crate) fn finish(&self, result: TaskResult) -> bool {
        let status = result.status;
        {
            let mut slot = self.result.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
        }
        self.status_tx.send_replace(status);
        true
    }

    fn subscribe(&self) -> watch::Receiver<TaskStatus> {
        self.status_tx.subscribe()
    }

    fn result(&self) -> Option<TaskResult> {
        self.result.lock().clone()
    }
}

/// Cloneable reference to a submitted task.
#[derive(Clone)]
pub struct TaskHandle {
    cell: Arc<TaskCell>,
}

impl TaskHandle {
    pub(crate) fn new(cell: Arc<TaskCell>) -> Self {
        Self { cell }
    }

    pub(crate) fn cell(&self) -> &Arc<TaskCell> {
        &self.cell
    }

    pub fn id(&self) -> TaskId {
        self.cell.id
    }

    pub fn task_type(&self) -> &TaskType {
        &self.cell.task_type
    }

    /// Returns the most recent status without waiting.
    pub fn status(&self) -> TaskStatus {
        self.cell.status()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Returns the final result if the task has finished.
    pub fn try_result(&self) -> Option<TaskResult> {
        self.cell.result()
    }

    /// Returns the final result, or a not-completed snapshot.
    pub(crate) fn snapshot(&self) -> TaskResult {
        self.try_result()
            .unwrap_or_else(|| TaskResult::incomplete(self.id(), self.status()))
    }

    /// Waits until the task reaches a terminal state.
    pub async fn wait(&self) -> TaskResult {
        let mut status_rx = self.cell.subscribe();
        loop {
            if let Some(result) = self.cell.result() {
                return result;
            }
            if status_rx.changed().await.is_err() {
                // Sender lives in the cell, so this only happens on teardown
                return self.snapshot();
            }
        }
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.cell.id)
            .field("task_type", &self.cell.task_type)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cell() -> Arc<TaskCell> {
        TaskCell::new(TaskId::new(), TaskType::Transform, CancellationToken::new())
    }

    #[test]
    fn test_finish_only_once() {
        let cell = cell();
        assert!(cell.finish(TaskResult::cancelled(cell.id)));
        assert!(!cell.finish(TaskResult::failed(cell.id, "late")));
        assert_eq!(cell.status(), TaskStatus::Cancelled);
    }

    #[test]
    fn test_mark_running_ignored_after_finish() {
        let cell = cell();
        cell.finish(TaskResult::cancelled(cell.id));
        cell.mark_running();
        assert_eq!(cell.status(), TaskStatus::Cancelled);
    }

    #[test]
    fn test_snapshot_before_completion() {
        let handle = TaskHandle::new(cell());
        let snapshot = handle.snapshot();
        assert!(!snapshot.completed);
        assert_eq!(snapshot.status, TaskStatus::Pending);
        assert!(handle.try_result().is_none());
    }

    #[tokio::test]
    async fn test_wait_returns_final_result() {
        let cell = cell();
        let handle = TaskHandle::new(Arc::clone(&cell));
        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.wait().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        cell.mark_running();
        assert_eq!(handle.status(), TaskStatus::Running);
        cell.finish(TaskResult::failed(cell.id, "bad input"));

        let result = waiter.await.unwrap();
        assert!(result.completed);
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("bad input"));
    }
}
