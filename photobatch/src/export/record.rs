//! Export records.

use super::collaborators::AnalysisType;
use super::error::{ErrorClass, ExportError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Outcome of one (image, analysis) export item.
///
/// Exactly one record is appended to a job's history per terminal item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub timestamp: DateTime<Utc>,
    pub image_id: String,
    pub analysis_type: AnalysisType,
    /// Where the output was (or would have been) written.
    pub output_path: Option<PathBuf>,
    pub success: bool,
    pub error_message: Option<String>,
    pub error_class: Option<ErrorClass>,
    /// Attempts across all stages, including the first.
    pub attempts: u32,
}

impl ExportRecord {
    pub fn succeeded(
        image_id: impl Into<String>,
        analysis_type: AnalysisType,
        output_path: PathBuf,
        attempts: u32,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            image_id: image_id.into(),
            analysis_type,
            output_path: Some(output_path),
            success: true,
            error_message: None,
            error_class: None,
            attempts,
        }
    }

    pub fn failed(
        image_id: impl Into<String>,
        analysis_type: AnalysisType,
        output_path: Option<PathBuf>,
        error: &ExportError,
        attempts: u32,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            image_id: image_id.into(),
            analysis_type,
            output_path,
            success: false,
            error_message: Some(error.to_string()),
            error_class: Some(error.class),
            attempts,
        }
    }

    /// True if this failure should stop the rest of the job.
    pub fn is_abort(&self) -> bool {
        self.error_class == Some(ErrorClass::Abort)
    }
}
