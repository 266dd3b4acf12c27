//! Task dispatching.
//!
//! A single dispatcher task owns every Pending → Running transition. It wakes
//! on submissions, completions, limit changes, and when the earliest backoff
//! expires. Each pass admits tasks until the queue is idle, blocked behind a
//! backing-off head, or at the global cap.

use super::context::TaskContext;
use super::core::{ActiveTask, CoordinatorInner};
use super::error::CoordinatorError;
use super::queue::{QueuedTask, Selection};
use super::task::{Task, TaskOutcome, TaskResult};
use super::telemetry::TelemetryEvent;
use crate::panic::panic_message;
use crate::resource::ResourceAllocation;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

impl CoordinatorInner {
    /// Runs until shutdown.
    pub(crate) async fn run_dispatcher(self: Arc<Self>) {
        loop {
            let wake_at = self.dispatch_ready();

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                _ = self.work_notify.notified() => {}

                _ = sleep_until_opt(wake_at) => {}
            }
        }
        debug!("Dispatcher stopped");
    }

    /// Admits every task that can run now.
    ///
    /// Returns the instant at which a backing-off head becomes eligible, if
    /// that is what stopped the pass.
    fn dispatch_ready(self: &Arc<Self>) -> Option<Instant> {
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }

            let selection = {
                let mut state = self.state.lock();
                if state.running.total() >= self.config.max_concurrent_tasks {
                    return None;
                }
                let state = &mut *state;
                let (limits, running) = (&state.limits, &state.running);
                state
                    .queue
                    .select(Instant::now(), |ty| running.has_capacity(limits, ty))
            };

            match selection {
                Selection::Candidate(entry) => self.try_admit(entry),
                Selection::BlockedUntil(at) => return Some(at),
                Selection::Idle => return None,
            }
        }
    }

    /// Runs the resource check for a candidate taken off the queue.
    fn try_admit(self: &Arc<Self>, mut entry: QueuedTask) {
        if entry.cell.cancellation.is_cancelled() {
            self.finish_unstarted(entry, TaskResult::cancelled);
            return;
        }

        let estimate = entry.task.estimate;
        if !self.resources.fits_within_limits(estimate) {
            let err = CoordinatorError::Unschedulable {
                task_id: entry.cell.id,
                estimate,
                limits: self.resources.limits(),
            };
            self.telemetry.emit(TelemetryEvent::TaskRejected {
                task_id: entry.cell.id,
                reason: err.to_string(),
            });
            self.finish_unstarted(entry, |id| TaskResult::failed(id, err.to_string()));
            return;
        }

        match self.resources.allocate(estimate) {
            Ok(allocation) => self.spawn_task(entry, allocation),
            Err(err) => {
                entry.denials += 1;
                let delay = self.config.requeue_delay(entry.denials);
                entry.not_before = Some(Instant::now() + delay);

                trace!(
                    task_id = %entry.cell.id,
                    attempt = entry.denials,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Resources denied, task backing off"
                );
                self.telemetry.emit(TelemetryEvent::TaskRequeued {
                    task_id: entry.cell.id,
                    attempt: entry.denials,
                    delay,
                });

                let mut state = self.state.lock();
                if state.accepting {
                    state.queue.reinsert(entry);
                } else {
                    drop(state);
                    self.finish_unstarted(entry, TaskResult::cancelled);
                }
            }
        }
    }

    /// Moves an admitted task into the active set and spawns its body.
    ///
    /// The allocation is recorded in the active set and released on
    /// completion, unless released earlier through
    /// `release_task_resources`.
    fn spawn_task(self: &Arc<Self>, entry: QueuedTask, allocation: ResourceAllocation) {
        let QueuedTask {
            task,
            cell,
            enqueued_at,
            ..
        } = entry;
        let Task {
            name,
            task_type,
            body,
            completion_hook,
            ..
        } = task;

        {
            let mut state = self.state.lock();
            state.running.increment(&task_type);
            state.active.insert(
                cell.id,
                ActiveTask {
                    cell: Arc::clone(&cell),
                    allocation: Some(allocation),
                },
            );
        }

        cell.mark_running();

        debug!(
            task_id = %cell.id,
            task_name = %name,
            task_type = %task_type,
            "Task started"
        );
        self.telemetry.emit(TelemetryEvent::TaskStarted {
            task_id: cell.id,
            task_type: task_type.clone(),
            wait_time: enqueued_at.elapsed(),
        });

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let start = Instant::now();
            let ctx = TaskContext::new(cell.id, cell.cancellation.clone());

            let outcome = match AssertUnwindSafe(body.execute(&ctx)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(payload) => TaskOutcome::Failed(format!(
                    "task panicked: {}",
                    panic_message(payload.as_ref())
                )),
            };

            inner.complete_running(cell, task_type, completion_hook, outcome, start.elapsed());
        });
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}
