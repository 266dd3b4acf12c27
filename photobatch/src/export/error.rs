//! Export error taxonomy.
//!
//! Every failure in the export pipeline is tagged with an [`ErrorClass`]
//! that decides what happens next:
//!
//! | Class         | Reaction                                               |
//! |---------------|--------------------------------------------------------|
//! | `Recoverable` | retry with capped exponential backoff                  |
//! | `Degrade`     | retry once with the fallback renderer, then skip       |
//! | `Skip`        | record the item as failed, continue with the batch     |
//! | `Abort`       | record, then stop accepting new subtasks for the job   |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// How an export failure is handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Recoverable,
    Degrade,
    Skip,
    Abort,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recoverable => write!(f, "recoverable"),
            Self::Degrade => write!(f, "degrade"),
            Self::Skip => write!(f, "skip"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

/// Pipeline stage where an error occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStage {
    Load,
    Transform,
    Analyze,
    Render,
    Write,
}

impl fmt::Display for ExportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Load => write!(f, "load"),
            Self::Transform => write!(f, "transform"),
            Self::Analyze => write!(f, "analyze"),
            Self::Render => write!(f, "render"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// A classified export failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{stage} failed ({class}): {message}")]
pub struct ExportError {
    pub class: ErrorClass,
    pub stage: ExportStage,
    pub message: String,
}

impl ExportError {
    pub fn new(class: ErrorClass, stage: ExportStage, message: impl Into<String>) -> Self {
        Self {
            class,
            stage,
            message: message.into(),
        }
    }

    pub fn recoverable(stage: ExportStage, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Recoverable, stage, message)
    }

    pub fn degrade(stage: ExportStage, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Degrade, stage, message)
    }

    pub fn skip(stage: ExportStage, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Skip, stage, message)
    }

    pub fn abort(stage: ExportStage, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Abort, stage, message)
    }

    /// The item was cancelled before `stage` ran.
    pub fn cancelled(stage: ExportStage) -> Self {
        Self::skip(stage, "cancelled")
    }

    /// Classifies an I/O error from reading a source image.
    pub fn from_source_io(err: &io::Error) -> Self {
        Self::new(classify_source_io(err), ExportStage::Load, err.to_string())
    }

    /// Classifies an I/O error from writing output.
    pub fn from_destination_io(err: &io::Error) -> Self {
        Self::new(classify_destination_io(err), ExportStage::Write, err.to_string())
    }
}

fn is_transient(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ResourceBusy
    )
}

/// Source errors are per-image problems unless they look transient.
pub fn classify_source_io(err: &io::Error) -> ErrorClass {
    if is_transient(err.kind()) {
        ErrorClass::Recoverable
    } else {
        ErrorClass::Skip
    }
}

/// Destination errors that no retry will fix affect every item of the job.
pub fn classify_destination_io(err: &io::Error) -> ErrorClass {
    match err.kind() {
        io::ErrorKind::StorageFull
        | io::ErrorKind::ReadOnlyFilesystem
        | io::ErrorKind::PermissionDenied
        | io::ErrorKind::NotADirectory => ErrorClass::Abort,
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidFilename => ErrorClass::Skip,
        _ => ErrorClass::Recoverable,
    }
}
