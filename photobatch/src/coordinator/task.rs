//! Task definitions.
//!
//! A [`Task`] couples a [`TaskBody`] (the work) with the scheduling metadata
//! the coordinator needs: type, priority and resource estimate.
//!
//! # Implementing a task body
//!
//! ```ignore
//! use photobatch::coordinator::{TaskBody, TaskContext, TaskOutcome};
//! use std::future::Future;
//! use std::pin::Pin;
//!
//! struct Sleepy;
//!
//! impl TaskBody for Sleepy {
//!     fn execute<'a>(
//!         &'a self,
//!         ctx: &'a TaskContext,
//!     ) -> Pin<Box<dyn Future<Output = TaskOutcome> + Send + 'a>> {
//!         Box::pin(async move {
//!             if ctx.is_cancelled() {
//!                 return TaskOutcome::Cancelled;
//!             }
//!             TaskOutcome::success()
//!         })
//!     }
//! }
//! ```

use super::context::TaskContext;
use crate::resource::ResourceEstimate;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;
use uuid::Uuid;

// =============================================================================
// Identity and Classification
// =============================================================================

/// Unique identifier for a submitted task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generates a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of work a task performs. Concurrency caps are configured per type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TaskType {
    /// Applying an operation pipeline to an image.
    Transform,
    /// Computing an analysis and writing its export.
    AnalysisExport,
    /// Application-defined work, keyed by name.
    Custom(String),
}

impl TaskType {
    /// Returns the configuration key for this type.
    pub fn key(&self) -> &str {
        match self {
            Self::Transform => "transform",
            Self::AnalysisExport => "analysis_export",
            Self::Custom(name) => name,
        }
    }

    /// Parses a configuration key. Unknown keys become [`TaskType::Custom`].
    pub fn from_key(key: &str) -> Self {
        match key {
            "transform" => Self::Transform,
            "analysis_export" => Self::AnalysisExport,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Scheduling priority. Higher priorities always dispatch first.
///
/// The derived ordering follows declaration order, so `Urgent < Low` and the
/// queue scans classes in `Priority::ALL` order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// All classes, highest first.
    pub const ALL: [Priority; 4] = [Self::Urgent, Self::High, Self::Normal, Self::Low];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Urgent => write!(f, "urgent"),
            Self::High => write!(f, "high"),
            Self::Normal => write!(f, "normal"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// Lifecycle state of a task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Returns true for `Succeeded`, `Failed` and `Cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

// =============================================================================
// Outcomes and Results
// =============================================================================

/// What a task body reports when it finishes.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskOutcome {
    /// The work succeeded, optionally producing a structured value.
    Succeeded(Option<serde_json::Value>),
    /// The work failed with a message.
    Failed(String),
    /// The body observed cancellation and stopped early.
    Cancelled,
}

impl TaskOutcome {
    /// Success without output.
    pub fn success() -> Self {
        Self::Succeeded(None)
    }

    /// Failure with the given message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// The final (or, on timeout, current) state of a task as seen by a caller.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// False when the task had not reached a terminal state yet.
    pub completed: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl TaskResult {
    pub(crate) fn from_outcome(task_id: TaskId, outcome: TaskOutcome) -> Self {
        let (status, output, error) = match outcome {
            TaskOutcome::Succeeded(output) => (TaskStatus::Succeeded, output, None),
            TaskOutcome::Failed(msg) => (TaskStatus::Failed, None, Some(msg)),
            TaskOutcome::Cancelled => (TaskStatus::Cancelled, None, None),
        };
        Self {
            task_id,
            status,
            completed: true,
            output,
            error,
        }
    }

    pub(crate) fn cancelled(task_id: TaskId) -> Self {
        Self::from_outcome(task_id, TaskOutcome::Cancelled)
    }

    pub(crate) fn failed(task_id: TaskId, error: impl Into<String>) -> Self {
        Self::from_outcome(task_id, TaskOutcome::Failed(error.into()))
    }

    pub(crate) fn incomplete(task_id: TaskId, status: TaskStatus) -> Self {
        Self {
            task_id,
            status,
            completed: false,
            output: None,
            error: None,
        }
    }

    /// Returns true if the task succeeded.
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }
}

// =============================================================================
// Task Body and Task
// =============================================================================

/// The executable part of a task.
///
/// Bodies must check [`TaskContext::is_cancelled`] at their own checkpoints;
/// the coordinator never aborts a running future.
pub trait TaskBody: Send + Sync + 'static {
    fn execute<'a>(
        &'a self,
        ctx: &'a TaskContext,
    ) -> Pin<Box<dyn Future<Output = TaskOutcome> + Send + 'a>>;
}

/// Callback invoked exactly once with a task's final result.
pub type CompletionHook = Box<dyn FnOnce(&TaskResult) + Send + 'static>;

/// A unit of work submitted to the [`TaskCoordinator`].
///
/// [`TaskCoordinator`]: super::TaskCoordinator
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) name: String,
    pub(crate) task_type: TaskType,
    pub(crate) priority: Priority,
    pub(crate) estimate: ResourceEstimate,
    pub(crate) created_at: Instant,
    pub(crate) body: Box<dyn TaskBody>,
    pub(crate) completion_hook: Option<CompletionHook>,
}

impl Task {
    /// Creates a task with `Normal` priority and a zero estimate.
    pub fn new(name: impl Into<String>, task_type: TaskType, body: impl TaskBody) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            task_type,
            priority: Priority::default(),
            estimate: ResourceEstimate::zero(),
            created_at: Instant::now(),
            body: Box::new(body),
            completion_hook: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_estimate(mut self, estimate: ResourceEstimate) -> Self {
        self.estimate = estimate;
        self
    }

    /// Registers a hook run once with the final result, whatever the outcome.
    pub fn with_completion_hook<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&TaskResult) + Send + 'static,
    {
        self.completion_hook = Some(Box::new(hook));
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn estimate(&self) -> ResourceEstimate {
        self.estimate
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("task_type", &self.task_type)
            .field("priority", &self.priority)
            .field("estimate", &self.estimate)
            .finish_non_exhaustive()
    }
}

/// Adapts an async closure into a [`TaskBody`].
///
/// ```ignore
/// let body = FnTask::new(|ctx| Box::pin(async move { TaskOutcome::success() }));
/// ```
pub struct FnTask<F> {
    f: F,
}

impl<F> FnTask<F>
where
    F: for<'a> Fn(&'a TaskContext) -> Pin<Box<dyn Future<Output = TaskOutcome> + Send + 'a>>
        + Send
        + Sync
        + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> TaskBody for FnTask<F>
where
    F: for<'a> Fn(&'a TaskContext) -> Pin<Box<dyn Future<Output = TaskOutcome> + Send + 'a>>
        + Send
        + Sync
        + 'static,
{
    fn execute<'a>(
        &'a self,
        ctx: &'a TaskContext,
    ) -> Pin<Box<dyn Future<Output = TaskOutcome> + Send + 'a>> {
        (self.f)(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Urgent < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert_eq!(Priority::ALL[0], Priority::Urgent);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_task_type_keys_roundtrip() {
        assert_eq!(TaskType::from_key("transform"), TaskType::Transform);
        assert_eq!(TaskType::from_key("analysis_export"), TaskType::AnalysisExport);
        assert_eq!(
            TaskType::from_key("thumbnail"),
            TaskType::Custom("thumbnail".to_string())
        );
        assert_eq!(TaskType::Custom("x".into()).to_string(), "x");
    }

    #[test]
    fn test_status_terminal() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_result_from_outcome() {
        let id = TaskId::new();
        let ok = TaskResult::from_outcome(id, TaskOutcome::Succeeded(Some(serde_json::json!(3))));
        assert!(ok.is_success());
        assert!(ok.completed);
        assert_eq!(ok.output, Some(serde_json::json!(3)));

        let failed = TaskResult::from_outcome(id, TaskOutcome::failed("boom"));
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));

        let pending = TaskResult::incomplete(id, TaskStatus::Pending);
        assert!(!pending.completed);
    }

    #[test]
    fn test_task_ids_unique() {
        assert_ne!(TaskId::new(), TaskId::new());
    }
}
