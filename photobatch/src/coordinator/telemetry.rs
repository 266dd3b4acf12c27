//! Telemetry for scheduling observability.
//!
//! The coordinator emits structured events to a [`TelemetrySink`] and does
//! not care how they are consumed. Logging, metrics and test assertions are
//! all just sinks.
//!
//! # Example
//!
//! ```ignore
//! use photobatch::coordinator::{TelemetryEvent, TelemetrySink};
//!
//! struct CountingSink(std::sync::atomic::AtomicUsize);
//!
//! impl TelemetrySink for CountingSink {
//!     fn emit(&self, _event: TelemetryEvent) {
//!         self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
//!     }
//! }
//! ```

use super::task::{Priority, TaskId, TaskStatus, TaskType};
use std::time::Duration;

// =============================================================================
// Telemetry Events
// =============================================================================

/// Events emitted while scheduling and running tasks.
#[derive(Clone, Debug, PartialEq)]
pub enum TelemetryEvent {
    /// A task entered the queue.
    TaskSubmitted {
        task_id: TaskId,
        task_type: TaskType,
        priority: Priority,
        queue_depth: usize,
    },

    /// A task was admitted and started running.
    TaskStarted {
        task_id: TaskId,
        task_type: TaskType,
        wait_time: Duration,
    },

    /// A task reached a terminal state.
    TaskCompleted {
        task_id: TaskId,
        task_type: TaskType,
        status: TaskStatus,
        duration: Duration,
    },

    /// Resources were denied; the task backs off before the next attempt.
    TaskRequeued {
        task_id: TaskId,
        attempt: u32,
        delay: Duration,
    },

    /// A task was cancelled through its handle or by shutdown.
    TaskCancelled { task_id: TaskId, was_running: bool },

    /// A task can never fit the resource limits and was failed at once.
    TaskRejected { task_id: TaskId, reason: String },
}

impl TelemetryEvent {
    /// Returns the task this event refers to.
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::TaskSubmitted { task_id, .. }
            | Self::TaskStarted { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskRequeued { task_id, .. }
            | Self::TaskCancelled { task_id, .. }
            | Self::TaskRejected { task_id, .. } => *task_id,
        }
    }

    /// Returns a short name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TaskSubmitted { .. } => "task_submitted",
            Self::TaskStarted { .. } => "task_started",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskRequeued { .. } => "task_requeued",
            Self::TaskCancelled { .. } => "task_cancelled",
            Self::TaskRejected { .. } => "task_rejected",
        }
    }
}

// =============================================================================
// Telemetry Sinks
// =============================================================================

/// Receiver of telemetry events.
///
/// `emit` is called inline on scheduling paths, so it must be fast and must
/// not block.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

/// Discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullTelemetrySink;

impl TelemetrySink for NullTelemetrySink {
    fn emit(&self, _event: TelemetryEvent) {}
}

/// Forwards events to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingTelemetrySink;

impl TelemetrySink for TracingTelemetrySink {
    fn emit(&self, event: TelemetryEvent) {
        match &event {
            TelemetryEvent::TaskRejected { task_id, reason } => {
                tracing::warn!(task_id = %task_id, reason = %reason, "Task rejected");
            }
            TelemetryEvent::TaskCompleted {
                task_id,
                task_type,
                status: TaskStatus::Failed,
                duration,
            } => {
                tracing::warn!(
                    task_id = %task_id,
                    task_type = %task_type,
                    duration_ms = duration.as_millis() as u64,
                    "Task failed"
                );
            }
            TelemetryEvent::TaskRequeued {
                task_id,
                attempt,
                delay,
            } => {
                tracing::debug!(
                    task_id = %task_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Task requeued"
                );
            }
            other => {
                tracing::trace!(
                    task_id = %other.task_id(),
                    event = other.event_type(),
                    ?other,
                    "Coordinator event"
                );
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Records events for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        events: Mutex<Vec<TelemetryEvent>>,
    }

    impl RecordingSink {
        pub(crate) fn events(&self) -> Vec<TelemetryEvent> {
            self.events.lock().clone()
        }

        pub(crate) fn count(&self, event_type: &str) -> usize {
            self.events
                .lock()
                .iter()
                .filter(|e| e.event_type() == event_type)
                .count()
        }
    }

    impl TelemetrySink for RecordingSink {
        fn emit(&self, event: TelemetryEvent) {
            self.events.lock().push(event);
        }
    }
}
