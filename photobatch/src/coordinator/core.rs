//! Task coordinator core: the public struct and its shared state.
//!
//! Handler methods live in sibling modules:
//! - `dispatch`: the dispatcher loop and admission checks
//! - `lifecycle`: completion, cancellation and shutdown

use super::concurrency::{RunningCounts, TaskTypeLimits};
use super::config::CoordinatorConfig;
use super::error::CoordinatorError;
use super::handle::{TaskCell, TaskHandle};
use super::queue::TaskQueue;
use super::task::{Task, TaskId, TaskResult, TaskStatus, TaskType};
use super::telemetry::{NullTelemetrySink, TelemetryEvent, TelemetrySink};
use crate::resource::{ResourceAllocation, ResourceManager};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// =============================================================================
// Shared State
// =============================================================================

/// A task that has been admitted and is running.
pub(crate) struct ActiveTask {
    pub(crate) cell: Arc<TaskCell>,
    pub(crate) allocation: Option<ResourceAllocation>,
}

/// Everything guarded by the scheduler lock.
///
/// The resource ledger has its own lock; this one is never held while
/// calling into the [`ResourceManager`].
pub(crate) struct SchedulerState {
    pub(crate) queue: TaskQueue,
    pub(crate) limits: TaskTypeLimits,
    pub(crate) running: RunningCounts,
    pub(crate) active: HashMap<TaskId, ActiveTask>,
    pub(crate) accepting: bool,
}

pub(crate) struct CoordinatorInner {
    pub(crate) resources: Arc<ResourceManager>,
    pub(crate) state: Mutex<SchedulerState>,
    pub(crate) config: CoordinatorConfig,
    pub(crate) telemetry: Arc<dyn TelemetrySink>,
    pub(crate) work_notify: Notify,
    pub(crate) shutdown: CancellationToken,
}

// =============================================================================
// Task Coordinator
// =============================================================================

/// Priority scheduler with resource admission and per-type caps.
///
/// A task moves from `Pending` to `Running` once it is the first eligible
/// entry of the highest non-empty priority class, its type is under its cap,
/// the global cap has room, and the [`ResourceManager`] grants its estimate.
/// Denied tasks stay in place and back off exponentially.
///
/// The dispatcher runs as a Tokio task, so the coordinator must be created
/// inside a runtime.
///
/// # Example
///
/// ```ignore
/// let resources = Arc::new(ResourceManager::new(ResourceLimits::new(1 << 30, 8)));
/// let coordinator = TaskCoordinator::new(CoordinatorConfig::default(), resources);
///
/// let handle = coordinator.submit(
///     Task::new("resize", TaskType::Transform, body).with_priority(Priority::High),
/// )?;
/// let results = coordinator
///     .wait_for_completion(&[handle], Duration::from_secs(5))
///     .await;
/// ```
pub struct TaskCoordinator {
    pub(crate) inner: Arc<CoordinatorInner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl TaskCoordinator {
    /// Creates a coordinator and starts its dispatcher.
    pub fn new(config: CoordinatorConfig, resources: Arc<ResourceManager>) -> Self {
        Self::with_telemetry(config, resources, Arc::new(NullTelemetrySink))
    }

    /// Creates a coordinator with a telemetry sink.
    pub fn with_telemetry(
        config: CoordinatorConfig,
        resources: Arc<ResourceManager>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let inner = Arc::new(CoordinatorInner {
            resources,
            state: Mutex::new(SchedulerState {
                queue: TaskQueue::new(),
                limits: config.type_limits.clone(),
                running: RunningCounts::default(),
                active: HashMap::new(),
                accepting: true,
            }),
            config,
            telemetry,
            work_notify: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        info!(
            max_concurrent_tasks = inner.config.max_concurrent_tasks,
            "Task coordinator started"
        );

        let dispatcher = tokio::spawn(Arc::clone(&inner).run_dispatcher());
        Self {
            inner,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Enqueues a task. Never waits for capacity.
    pub fn submit(&self, task: Task) -> Result<TaskHandle, CoordinatorError> {
        let cell = TaskCell::new(task.id, task.task_type.clone(), self.inner.shutdown.child_token());
        let handle = TaskHandle::new(Arc::clone(&cell));
        let task_id = task.id;
        let task_type = task.task_type.clone();
        let priority = task.priority;

        let queue_depth = {
            let mut state = self.inner.state.lock();
            if !state.accepting {
                return Err(CoordinatorError::ShutDown);
            }
            state.queue.push(task, cell);
            state.queue.len()
        };

        debug!(
            task_id = %task_id,
            task_type = %task_type,
            priority = %priority,
            queue_depth,
            "Task submitted"
        );
        self.inner.telemetry.emit(TelemetryEvent::TaskSubmitted {
            task_id,
            task_type,
            priority,
            queue_depth,
        });

        self.inner.work_notify.notify_one();
        Ok(handle)
    }

    /// Cancels a task.
    ///
    /// A pending task is removed and finished as `Cancelled` immediately. A
    /// running task has its token cancelled and finishes when its body next
    /// checks. Returns false if the task was already terminal.
    pub fn cancel(&self, handle: &TaskHandle) -> bool {
        self.inner.cancel(handle.cell())
    }

    /// Cancels a task only if it has not been dispatched yet.
    ///
    /// Removal from the queue happens under the scheduler lock, so a task
    /// is either cancelled here or left to run to completion. Returns false
    /// for tasks that are running or terminal.
    pub fn cancel_pending(&self, handle: &TaskHandle) -> bool {
        self.inner.cancel_pending(handle.cell())
    }

    /// Returns the current status of a task.
    pub fn status(&self, handle: &TaskHandle) -> TaskStatus {
        handle.status()
    }

    /// Waits until every handle is terminal or `timeout` elapses.
    ///
    /// Results are returned in handle order. On timeout, unfinished tasks
    /// are reported with `completed == false` and keep running.
    pub async fn wait_for_completion(
        &self,
        handles: &[TaskHandle],
        timeout: Duration,
    ) -> Vec<TaskResult> {
        let deadline = tokio::time::Instant::now() + timeout;
        let waits = handles.iter().map(|handle| async move {
            match tokio::time::timeout_at(deadline, handle.wait()).await {
                Ok(result) => result,
                Err(_) => handle.snapshot(),
            }
        });
        futures::future::join_all(waits).await
    }

    /// Changes the cap for a task type. In-flight tasks are never aborted.
    pub fn set_concurrency_limit(&self, task_type: TaskType, max_concurrent: usize) {
        {
            let mut state = self.inner.state.lock();
            state.limits.set(task_type.clone(), max_concurrent);
        }
        debug!(task_type = %task_type, max_concurrent, "Concurrency limit changed");
        self.inner.work_notify.notify_one();
    }

    /// Returns the cap for a task type, or `None` if uncapped.
    pub fn concurrency_limit(&self, task_type: &TaskType) -> Option<usize> {
        self.inner.state.lock().limits.get(task_type)
    }

    /// Number of tasks waiting for dispatch.
    pub fn queue_depth(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Number of running tasks of a type.
    pub fn running_count(&self, task_type: &TaskType) -> usize {
        self.inner.state.lock().running.get(task_type)
    }

    /// Number of running tasks across all types.
    pub fn total_running(&self) -> usize {
        self.inner.state.lock().running.total()
    }

    /// Releases a running task's allocation before it completes.
    ///
    /// Returns true if an allocation was released. Safe to call repeatedly
    /// and for tasks that already finished.
    pub fn release_task_resources(&self, task_id: TaskId) -> bool {
        let allocation = {
            let mut state = self.inner.state.lock();
            state
                .active
                .get_mut(&task_id)
                .and_then(|active| active.allocation.take())
        };
        match allocation {
            Some(allocation) => {
                self.inner.resources.release(&allocation);
                self.inner.work_notify.notify_one();
                true
            }
            None => false,
        }
    }

    /// The resource manager used for admission.
    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.inner.resources
    }

    /// Stops dispatching, cancels queued tasks and signals running ones.
    ///
    /// Running task bodies observe cancellation at their next checkpoint;
    /// this method does not wait for them.
    pub async fn shutdown(&self) {
        self.inner.begin_shutdown();
        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            let _ = dispatcher.await;
        }
    }
}

impl Drop for TaskCoordinator {
    /// Queued tasks finish `Cancelled` and running ones are signalled, so no
    /// handle is left waiting on a coordinator that no longer exists.
    fn drop(&mut self) {
        self.inner.begin_shutdown();
    }
}

impl std::fmt::Debug for TaskCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TaskCoordinator")
            .field("queued", &state.queue.len())
            .field("running", &state.running.total())
            .field("accepting", &state.accepting)
            .finish_non_exhaustive()
    }
}
