//! Per-image export with classified failures.
//!
//! The [`ExportPipeline`] takes one (image, analysis type) item through
//! load, transform, analyze, render and write. Errors carry an
//! [`ErrorClass`] that decides between retrying, falling back to an
//! alternate renderer, skipping the item, or aborting the job. Retrying is
//! driven by a [`RetryPolicy`] and an injected [`Timer`].

mod collaborators;
mod error;
mod path;
mod pipeline;
mod record;
mod retry;

pub use collaborators::{
    AnalysisResult, AnalysisType, Analyzer, FsImageLoader, ImageLoader, JsonRenderer,
    OutputFormat, Renderer,
};
pub use error::{classify_destination_io, classify_source_io, ErrorClass, ExportError, ExportStage};
pub use path::{image_stem, output_path, suffixed_path, ConflictPolicy};
pub use pipeline::{ExportConfig, ExportItem, ExportPipeline, DEFAULT_ITEM_MEMORY_BYTES};
pub use record::ExportRecord;
pub use retry::{
    run_with_retry, Retried, RetryPolicy, Timer, TokioTimer, DEFAULT_BASE_DELAY,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY,
};

#[cfg(test)]
pub(crate) use retry::testing;
