//! Crate-level error type.

use crate::config::ConfigFileError;
use crate::coordinator::CoordinatorError;
use crate::export::ExportError;
use crate::jobs::JobError;
use crate::logging::LoggingError;
use crate::processor::ProcessingError;
use crate::resource::ResourceError;
use std::io;
use thiserror::Error;

/// Any error the engine can surface to an embedding application.
///
/// Item-level export failures never take this path; they are recorded in
/// the job's export history.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Coordination(#[from] CoordinatorError),

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Config(#[from] ConfigFileError),

    #[error(transparent)]
    Logging(#[from] LoggingError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
