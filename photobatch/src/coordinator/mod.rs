//! Priority task scheduling with resource admission.
//!
//! The [`TaskCoordinator`] owns every submitted [`Task`] until it finishes.
//! Tasks are ordered strictly by [`Priority`], FIFO within a class, and only
//! start once the [`ResourceManager`] grants their estimate and their
//! [`TaskType`] is under its cap.
//!
//! ```text
//!   submit ──► TaskQueue (Urgent | High | Normal | Low)
//!                  │
//!                  ▼  dispatcher: type cap? global cap? allocate?
//!              Running ──► body.execute(ctx) ──► TaskResult ──► hook, handle
//!                  ▲             │
//!                  └── denied: back off, keep queue position
//! ```
//!
//! [`ResourceManager`]: crate::resource::ResourceManager

mod concurrency;
mod config;
mod context;
mod core;
mod dispatch;
mod error;
mod handle;
mod lifecycle;
mod queue;
mod task;
mod telemetry;

pub use concurrency::{
    default_analysis_export_limit, default_transform_limit, TaskTypeLimits,
};
pub use config::{
    CoordinatorConfig, DEFAULT_MAX_CONCURRENT_TASKS, DEFAULT_REQUEUE_BASE_DELAY,
    DEFAULT_REQUEUE_MAX_DELAY,
};
pub use context::TaskContext;
pub use self::core::TaskCoordinator;
pub use error::CoordinatorError;
pub use handle::TaskHandle;
pub use task::{
    CompletionHook, FnTask, Priority, Task, TaskBody, TaskId, TaskOutcome, TaskResult,
    TaskStatus, TaskType,
};
pub use telemetry::{NullTelemetrySink, TelemetryEvent, TelemetrySink, TracingTelemetrySink};
