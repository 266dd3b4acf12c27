use super::job::JobId;
use thiserror::Error;

/// Errors from job management.
///
/// Per-image failures never surface here; they become export records.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {0} already has an export running")]
    ExportInProgress(JobId),

    #[error("image {0} is not in the pool")]
    ImageNotInPool(String),
}
