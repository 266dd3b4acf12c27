//! Task body that exports one item for a job.

use crate::coordinator::{TaskBody, TaskContext, TaskOutcome, TaskResult, TaskStatus};
use crate::export::{ExportConfig, ExportError, ExportItem, ExportPipeline, ExportRecord, ExportStage};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Message recorded for items that never ran because their job aborted.
pub(crate) const JOB_ABORTED: &str = "job aborted";

/// Stop signals shared by every item of one export run.
#[derive(Debug, Default)]
pub(crate) struct RunFlags {
    pub(crate) aborted: AtomicBool,
    pub(crate) cancelled: AtomicBool,
}

/// Where the body leaves its record for the completion hook.
pub(crate) type RecordSlot = Arc<Mutex<Option<ExportRecord>>>;

pub(crate) struct ExportTaskBody {
    pub(crate) pipeline: Arc<ExportPipeline>,
    pub(crate) item: ExportItem,
    pub(crate) config: Arc<ExportConfig>,
    pub(crate) flags: Arc<RunFlags>,
    pub(crate) slot: RecordSlot,
}

impl ExportTaskBody {
    async fn run(&self, ctx: &TaskContext) -> TaskOutcome {
        let record = if self.flags.cancelled.load(Ordering::Acquire) {
            self.not_started(ExportError::cancelled(ExportStage::Load))
        } else if self.flags.aborted.load(Ordering::Acquire) {
            self.not_started(ExportError::skip(ExportStage::Load, JOB_ABORTED))
        } else {
            let cancel = ctx.cancellation_token();
            self.pipeline.export(&self.item, &self.config, &cancel).await
        };

        let outcome = if record.success {
            TaskOutcome::Succeeded(serde_json::to_value(&record).ok())
        } else if ctx.is_cancelled() || self.flags.cancelled.load(Ordering::Acquire) {
            TaskOutcome::Cancelled
        } else {
            TaskOutcome::Failed(record.error_message.clone().unwrap_or_default())
        };

        *self.slot.lock() = Some(record);
        outcome
    }

    fn not_started(&self, error: ExportError) -> ExportRecord {
        ExportRecord::failed(
            self.item.image_id.clone(),
            self.item.analysis_type.clone(),
            None,
            &error,
            0,
        )
    }
}

impl TaskBody for ExportTaskBody {
    fn execute<'a>(
        &'a self,
        ctx: &'a TaskContext,
    ) -> Pin<Box<dyn Future<Output = TaskOutcome> + Send + 'a>> {
        Box::pin(self.run(ctx))
    }
}

/// Builds a record for a task whose body never produced one: cancelled while
/// queued, unschedulable, or panicked.
///
/// A queued task withdrawn because the job aborted is recorded as such
/// rather than as a plain cancellation.
pub(crate) fn record_from_result(
    item: &ExportItem,
    result: &TaskResult,
    flags: &RunFlags,
) -> ExportRecord {
    let withdrawn_by_abort =
        flags.aborted.load(Ordering::Acquire) && !flags.cancelled.load(Ordering::Acquire);
    let error = match result.status {
        TaskStatus::Cancelled if withdrawn_by_abort => {
            ExportError::skip(ExportStage::Load, JOB_ABORTED)
        }
        TaskStatus::Cancelled => ExportError::cancelled(ExportStage::Load),
        _ => ExportError::skip(
            ExportStage::Load,
            result.error.clone().unwrap_or_else(|| result.status.to_string()),
        ),
    };
    ExportRecord::failed(
        item.image_id.clone(),
        item.analysis_type.clone(),
        None,
        &error,
        0,
    )
}
