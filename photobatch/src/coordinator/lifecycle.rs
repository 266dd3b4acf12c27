//! Task completion, cancellation and shutdown.
//!
//! Every terminal transition goes through [`TaskCell::finish`], which accepts
//! only the first result. The completion hook and the `TaskCompleted` event
//! are produced only by the call that won, so each task reports exactly once.

use super::core::CoordinatorInner;
use super::handle::TaskCell;
use super::queue::QueuedTask;
use super::task::{CompletionHook, TaskId, TaskOutcome, TaskResult, TaskStatus, TaskType};
use super::telemetry::TelemetryEvent;
use crate::panic::panic_message;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

impl CoordinatorInner {
    /// Handles the end of a running task body.
    pub(crate) fn complete_running(
        &self,
        cell: Arc<TaskCell>,
        task_type: TaskType,
        hook: Option<CompletionHook>,
        outcome: TaskOutcome,
        duration: Duration,
    ) {
        let allocation = {
            let mut state = self.state.lock();
            state.running.decrement(&task_type);
            state
                .active
                .remove(&cell.id)
                .and_then(|active| active.allocation)
        };
        if let Some(allocation) = allocation {
            self.resources.release(&allocation);
        }

        let result = TaskResult::from_outcome(cell.id, outcome);
        match result.status {
            TaskStatus::Failed => debug!(
                task_id = %cell.id,
                task_type = %task_type,
                error = result.error.as_deref().unwrap_or(""),
                duration_ms = duration.as_millis() as u64,
                "Task failed"
            ),
            status => debug!(
                task_id = %cell.id,
                task_type = %task_type,
                status = %status,
                duration_ms = duration.as_millis() as u64,
                "Task finished"
            ),
        }

        self.publish_result(&cell, task_type, hook, result, duration);
        self.work_notify.notify_one();
    }

    /// Finishes a task that never started running.
    pub(crate) fn finish_unstarted<F>(&self, entry: QueuedTask, make_result: F)
    where
        F: FnOnce(TaskId) -> TaskResult,
    {
        let QueuedTask { task, cell, .. } = entry;
        let result = make_result(cell.id);
        if result.status == TaskStatus::Cancelled {
            self.telemetry.emit(TelemetryEvent::TaskCancelled {
                task_id: cell.id,
                was_running: false,
            });
        }
        self.publish_result(&cell, task.task_type, task.completion_hook, result, Duration::ZERO);
    }

    fn publish_result(
        &self,
        cell: &TaskCell,
        task_type: TaskType,
        hook: Option<CompletionHook>,
        result: TaskResult,
        duration: Duration,
    ) {
        let status = result.status;
        if !cell.finish(result.clone()) {
            return;
        }

        self.telemetry.emit(TelemetryEvent::TaskCompleted {
            task_id: cell.id,
            task_type,
            status,
            duration,
        });

        if let Some(hook) = hook {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| hook(&result))) {
                warn!(
                    task_id = %cell.id,
                    panic = %panic_message(payload.as_ref()),
                    "Completion hook panicked"
                );
            }
        }
    }

    /// Cancels a task by cell. See [`TaskCoordinator::cancel`].
    ///
    /// [`TaskCoordinator::cancel`]: super::TaskCoordinator::cancel
    pub(crate) fn cancel(&self, cell: &Arc<TaskCell>) -> bool {
        if cell.status().is_terminal() {
            return false;
        }

        let removed = self.state.lock().queue.remove(cell.id);
        match removed {
            Some(entry) => {
                debug!(task_id = %cell.id, "Pending task cancelled");
                self.finish_unstarted(entry, TaskResult::cancelled);
                self.work_notify.notify_one();
                true
            }
            None => {
                // Running, or between selection and admission
                cell.cancellation.cancel();
                self.telemetry.emit(TelemetryEvent::TaskCancelled {
                    task_id: cell.id,
                    was_running: true,
                });
                true
            }
        }
    }

    /// Cancels a task only if it is still queued. See
    /// [`TaskCoordinator::cancel_pending`].
    ///
    /// [`TaskCoordinator::cancel_pending`]: super::TaskCoordinator::cancel_pending
    pub(crate) fn cancel_pending(&self, cell: &Arc<TaskCell>) -> bool {
        let removed = self.state.lock().queue.remove(cell.id);
        match removed {
            Some(entry) => {
                debug!(task_id = %cell.id, "Pending task cancelled");
                self.finish_unstarted(entry, TaskResult::cancelled);
                self.work_notify.notify_one();
                true
            }
            None => false,
        }
    }

    /// Stops accepting work, cancels queued tasks, signals running tasks.
    /// Only the first call does anything.
    pub(crate) fn begin_shutdown(&self) {
        let (queued, running) = {
            let mut state = self.state.lock();
            if !state.accepting {
                return;
            }
            state.accepting = false;
            let queued = state.queue.drain();
            let running: Vec<_> = state
                .active
                .values()
                .map(|active| Arc::clone(&active.cell))
                .collect();
            (queued, running)
        };

        info!(
            queued = queued.len(),
            running = running.len(),
            "Task coordinator shutting down"
        );

        for entry in queued {
            self.finish_unstarted(entry, TaskResult::cancelled);
        }
        for cell in running {
            cell.cancellation.cancel();
        }
        self.shutdown.cancel();
    }
}
