//! Job entity.

use crate::coordinator::{TaskId, TaskStatus};
use crate::export::{AnalysisType, ExportRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Unique job identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Job lifecycle.
///
/// ```text
/// Created → Running → Completed | Failed | Cancelled
/// ```
///
/// A finished job may be exported again, which moves it back to `Running`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Created,
    Running,
    /// Every item finished, at least one succeeded, and nothing aborted.
    Completed,
    /// An item aborted the job, or every item failed.
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One export item as tracked by its job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportTaskEntry {
    pub task_id: TaskId,
    pub image_id: String,
    pub analysis_type: AnalysisType,
    pub status: TaskStatus,
}

/// A named collection of pool images plus its export state.
///
/// Callers receive snapshots; the live job is owned by the
/// [`JobManager`](super::JobManager).
#[derive(Clone, Debug)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    /// Pool image ids in attach order.
    pub image_refs: Vec<String>,
    pub export_tasks: HashMap<TaskId, ExportTaskEntry>,
    /// Completion percentage of the current export, `0..=100`.
    pub progress: u8,
    /// One record per finished export item, in completion order.
    pub export_history: Vec<ExportRecord>,
    pub created_at: DateTime<Utc>,
    /// Whether an item of the current export triggered an abort.
    pub aborted: bool,
}

impl Job {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            status: JobStatus::Created,
            image_refs: Vec::new(),
            export_tasks: HashMap::new(),
            progress: 0,
            export_history: Vec::new(),
            created_at: Utc::now(),
            aborted: false,
        }
    }

    /// Records that failed.
    pub fn failures(&self) -> impl Iterator<Item = &ExportRecord> {
        self.export_history.iter().filter(|r| !r.success)
    }
}
