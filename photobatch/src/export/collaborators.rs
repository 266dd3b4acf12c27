//! Collaborator traits for the export pipeline.
//!
//! The pipeline never decodes pixels or computes statistics itself. It
//! drives four collaborators:
//!
//! - [`ImageLoader`] - reads a source image (default: [`FsImageLoader`])
//! - [`crate::processor::ImageOperator`] - applies the operation pipeline
//! - [`Analyzer`] - computes one analysis over an image
//! - [`Renderer`] - turns an analysis result into output bytes
//!   (default: [`JsonRenderer`])
//!
//! All collaborators are synchronous; the pipeline runs them on the
//! processor's bounded worker pool.

use super::error::{ExportError, ExportStage};
use crate::processor::Image;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

// =============================================================================
// Analysis Types
// =============================================================================

/// Name of an analysis, e.g. `histogram` or `statistics`.
///
/// Also used as the directory component of the output path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnalysisType(String);

impl AnalysisType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AnalysisType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Structured output of an [`Analyzer`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub analysis_type: AnalysisType,
    /// Content identity of the analyzed image.
    pub image_content_id: String,
    pub data: serde_json::Value,
}

/// Output file format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Csv,
    Txt,
}

impl OutputFormat {
    /// File extension without the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
            Self::Txt => "txt",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

// =============================================================================
// Traits
// =============================================================================

/// Reads source images.
pub trait ImageLoader: Send + Sync + 'static {
    fn load(&self, path: &Path) -> Result<Image, ExportError>;
}

/// Computes one analysis over an image.
pub trait Analyzer: Send + Sync + 'static {
    fn analyze(&self, image: &Image, analysis: &AnalysisType) -> Result<AnalysisResult, ExportError>;
}

/// Serializes an analysis result.
///
/// A renderer that cannot produce `format` should fail with
/// [`super::ErrorClass::Degrade`] so the pipeline tries the fallback.
pub trait Renderer: Send + Sync + 'static {
    fn render(&self, result: &AnalysisResult, format: OutputFormat) -> Result<Vec<u8>, ExportError>;
}

// =============================================================================
// Default Implementations
// =============================================================================

/// Loads images from the local filesystem.
///
/// The content identity is the SHA-256 of the file bytes, so two paths with
/// identical content share cache entries.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsImageLoader;

impl ImageLoader for FsImageLoader {
    fn load(&self, path: &Path) -> Result<Image, ExportError> {
        let data = std::fs::read(path).map_err(|e| ExportError::from_source_io(&e))?;
        if data.is_empty() {
            return Err(ExportError::skip(
                ExportStage::Load,
                format!("{} is empty", path.display()),
            ));
        }
        Ok(Image::from_bytes(data))
    }
}

/// Renders any result as pretty-printed JSON, whatever format is requested.
///
/// Useful as the fallback renderer.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonRenderer;

impl Renderer for JsonRenderer {
    fn render(&self, result: &AnalysisResult, _format: OutputFormat) -> Result<Vec<u8>, ExportError> {
        serde_json::to_vec_pretty(result)
            .map_err(|e| ExportError::skip(ExportStage::Render, e.to_string()))
    }
}
