//! Per-item export orchestration.
//!
//! Each item moves through five stages:
//!
//! ```text
//! Load → Transform → Analyze → Render → Write
//! (pool)   (pool,      (pool)    (pool)   (async fs)
//!          cached)
//! ```
//!
//! Cancellation is checked before every stage. Failures are classified by
//! [`ErrorClass`] and every item ends in exactly one [`ExportRecord`].

use super::collaborators::{
    AnalysisResult, AnalysisType, Analyzer, FsImageLoader, ImageLoader, JsonRenderer,
    OutputFormat, Renderer,
};
use super::error::{ErrorClass, ExportError, ExportStage};
use super::path::{image_stem, output_path, suffixed_path, ConflictPolicy};
use super::record::ExportRecord;
use super::retry::{run_with_retry, RetryPolicy, Timer, TokioTimer};
use crate::coordinator::Priority;
use crate::processor::{ConcurrentProcessor, Operation, ProcessingError};
use crate::resource::ResourceEstimate;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default per-item footprint declared to the resource manager.
pub const DEFAULT_ITEM_MEMORY_BYTES: u64 = 64 * 1024 * 1024;

// =============================================================================
// Export Configuration
// =============================================================================

/// What a job export produces.
#[derive(Clone, Debug, PartialEq)]
pub struct ExportConfig {
    /// Root directory for all output.
    pub output_root: PathBuf,
    /// One item is exported per (image, analysis type).
    pub analysis_types: Vec<AnalysisType>,
    /// Pipeline applied to each image before analysis.
    pub operations: Vec<Operation>,
    pub format: OutputFormat,
    pub conflict_policy: ConflictPolicy,
    /// Scheduling priority of the item tasks.
    pub priority: Priority,
    /// Resources each item task reserves while running.
    pub item_estimate: ResourceEstimate,
}

impl ExportConfig {
    pub fn new(output_root: impl Into<PathBuf>, analysis_types: Vec<AnalysisType>) -> Self {
        Self {
            output_root: output_root.into(),
            analysis_types,
            operations: Vec::new(),
            format: OutputFormat::default(),
            conflict_policy: ConflictPolicy::default(),
            priority: Priority::default(),
            item_estimate: ResourceEstimate::new(DEFAULT_ITEM_MEMORY_BYTES, 1),
        }
    }

    pub fn with_operations(mut self, operations: Vec<Operation>) -> Self {
        self.operations = operations;
        self
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_item_estimate(mut self, estimate: ResourceEstimate) -> Self {
        self.item_estimate = estimate;
        self
    }
}

/// One (image, analysis) unit of work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportItem {
    pub job_name: String,
    pub image_id: String,
    pub source_path: PathBuf,
    pub analysis_type: AnalysisType,
}

// =============================================================================
// Export Pipeline
// =============================================================================

/// Runs export items against injected collaborators.
///
/// CPU-bound stages (load, transform, analyze, render) run on the
/// [`ConcurrentProcessor`] pool; the transform stage goes through its
/// result cache, so exporting several analyses of one image applies the
/// operation pipeline once.
pub struct ExportPipeline {
    processor: Arc<ConcurrentProcessor>,
    loader: Arc<dyn ImageLoader>,
    analyzer: Arc<dyn Analyzer>,
    renderer: Arc<dyn Renderer>,
    fallback_renderer: Option<Arc<dyn Renderer>>,
    retry: RetryPolicy,
    timer: Arc<dyn Timer>,
}

impl ExportPipeline {
    /// Creates a pipeline with filesystem loading and JSON rendering.
    pub fn new(processor: Arc<ConcurrentProcessor>, analyzer: Arc<dyn Analyzer>) -> Self {
        Self {
            processor,
            loader: Arc::new(FsImageLoader),
            analyzer,
            renderer: Arc::new(JsonRenderer),
            fallback_renderer: None,
            retry: RetryPolicy::default(),
            timer: Arc::new(TokioTimer),
        }
    }

    pub fn with_loader(mut self, loader: Arc<dyn ImageLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Renderer tried once when the primary fails with [`ErrorClass::Degrade`].
    pub fn with_fallback_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.fallback_renderer = Some(renderer);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = timer;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn processor(&self) -> &Arc<ConcurrentProcessor> {
        &self.processor
    }

    /// Exports one item. Never fails: every outcome becomes a record.
    pub async fn export(
        &self,
        item: &ExportItem,
        config: &ExportConfig,
        cancel: &CancellationToken,
    ) -> ExportRecord {
        let mut run = ItemRun {
            retries: 0,
            output: None,
        };
        let result = self.run_stages(item, config, cancel, &mut run).await;
        let attempts = run.retries + 1;

        match result {
            Ok(path) => {
                debug!(
                    image_id = %item.image_id,
                    analysis = %item.analysis_type,
                    path = %path.display(),
                    attempts,
                    "Export item written"
                );
                ExportRecord::succeeded(
                    item.image_id.clone(),
                    item.analysis_type.clone(),
                    path,
                    attempts,
                )
            }
            Err(err) => {
                warn!(
                    image_id = %item.image_id,
                    analysis = %item.analysis_type,
                    class = %err.class,
                    stage = %err.stage,
                    error = %err.message,
                    attempts,
                    "Export item failed"
                );
                ExportRecord::failed(
                    item.image_id.clone(),
                    item.analysis_type.clone(),
                    run.output,
                    &err,
                    attempts,
                )
            }
        }
    }

    async fn run_stages(
        &self,
        item: &ExportItem,
        config: &ExportConfig,
        cancel: &CancellationToken,
        run: &mut ItemRun,
    ) -> Result<PathBuf, ExportError> {
        checkpoint(cancel, ExportStage::Load)?;
        let image = self
            .with_retry(cancel, run, |_| {
                let loader = Arc::clone(&self.loader);
                let path = item.source_path.clone();
                self.on_pool(ExportStage::Load, move || loader.load(&path))
            })
            .await?;

        checkpoint(cancel, ExportStage::Transform)?;
        let image = if config.operations.is_empty() {
            image
        } else {
            self.with_retry(cancel, run, |_| {
                let image = image.clone();
                let operations = config.operations.clone();
                async move {
                    self.processor
                        .process_async(image, operations)
                        .await
                        .map_err(|e| pool_error(ExportStage::Transform, e))
                }
            })
            .await?
        };

        checkpoint(cancel, ExportStage::Analyze)?;
        let analysis = self
            .with_retry(cancel, run, |_| {
                let analyzer = Arc::clone(&self.analyzer);
                let image = image.clone();
                let kind = item.analysis_type.clone();
                self.on_pool(ExportStage::Analyze, move || analyzer.analyze(&image, &kind))
            })
            .await?;

        checkpoint(cancel, ExportStage::Render)?;
        let bytes = self.render(Arc::new(analysis), config.format, cancel, run).await?;

        checkpoint(cancel, ExportStage::Write)?;
        let planned = output_path(
            &config.output_root,
            &item.job_name,
            &item.analysis_type,
            &image_stem(&item.source_path),
            config.format,
        );
        run.output = Some(planned.clone());
        let bytes = bytes.as_slice();
        let written = self
            .with_retry(cancel, run, |_| {
                write_output(&planned, config.conflict_policy, bytes)
            })
            .await?;
        run.output = Some(written.clone());
        Ok(written)
    }

    /// Renders with the primary renderer, falling back once on `Degrade`.
    async fn render(
        &self,
        analysis: Arc<AnalysisResult>,
        format: OutputFormat,
        cancel: &CancellationToken,
        run: &mut ItemRun,
    ) -> Result<Vec<u8>, ExportError> {
        let primary = Arc::clone(&self.renderer);
        let err = match self.render_with(primary, &analysis, format, cancel, run).await {
            Err(err) if err.class == ErrorClass::Degrade => err,
            other => return other,
        };

        let Some(fallback) = self.fallback_renderer.clone() else {
            return Err(ExportError::skip(ExportStage::Render, err.message));
        };

        debug!(error = %err.message, "Primary renderer degraded, using fallback");
        run.retries += 1;
        self.render_with(fallback, &analysis, format, cancel, run)
            .await
            .map_err(|e| match e.class {
                ErrorClass::Degrade => ExportError::skip(ExportStage::Render, e.message),
                _ => e,
            })
    }

    async fn render_with(
        &self,
        renderer: Arc<dyn Renderer>,
        analysis: &Arc<AnalysisResult>,
        format: OutputFormat,
        cancel: &CancellationToken,
        run: &mut ItemRun,
    ) -> Result<Vec<u8>, ExportError> {
        self.with_retry(cancel, run, |_| {
            let renderer = Arc::clone(&renderer);
            let analysis = Arc::clone(analysis);
            self.on_pool(ExportStage::Render, move || renderer.render(&analysis, format))
        })
        .await
    }

    async fn with_retry<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        run: &mut ItemRun,
        op: F,
    ) -> Result<T, ExportError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ExportError>>,
    {
        let retried = run_with_retry(&self.retry, self.timer.as_ref(), cancel, op).await;
        run.retries += retried.attempts.saturating_sub(1);
        retried.result
    }

    /// Runs a synchronous collaborator call on the worker pool.
    async fn on_pool<T, F>(&self, stage: ExportStage, f: F) -> Result<T, ExportError>
    where
        F: FnOnce() -> Result<T, ExportError> + Send + 'static,
        T: Send + 'static,
    {
        self.processor
            .execute(f)
            .await
            .map_err(|e| pool_error(stage, e))?
    }
}

impl std::fmt::Debug for ExportPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportPipeline")
            .field("retry", &self.retry)
            .field("has_fallback_renderer", &self.fallback_renderer.is_some())
            .finish_non_exhaustive()
    }
}

struct ItemRun {
    retries: u32,
    output: Option<PathBuf>,
}

fn checkpoint(cancel: &CancellationToken, stage: ExportStage) -> Result<(), ExportError> {
    if cancel.is_cancelled() {
        Err(ExportError::cancelled(stage))
    } else {
        Ok(())
    }
}

fn pool_error(stage: ExportStage, err: ProcessingError) -> ExportError {
    match err {
        ProcessingError::Abandoned => ExportError::recoverable(stage, err.to_string()),
        ProcessingError::Operator(message) => ExportError::skip(stage, message),
        other => ExportError::skip(stage, other.to_string()),
    }
}

async fn write_output(
    planned: &Path,
    policy: ConflictPolicy,
    bytes: &[u8],
) -> Result<PathBuf, ExportError> {
    let io_err = |e: io::Error| ExportError::from_destination_io(&e);

    if let Some(parent) = planned.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    if policy == ConflictPolicy::Overwrite {
        tokio::fs::write(planned, bytes).await.map_err(io_err)?;
        return Ok(planned.to_path_buf());
    }

    // create_new makes the free-name check and the claim one step.
    for n in 0u32.. {
        let candidate = suffixed_path(planned, n);
        let opened = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await;
        match opened {
            Ok(mut file) => {
                file.write_all(bytes).await.map_err(io_err)?;
                file.flush().await.map_err(io_err)?;
                return Ok(candidate);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(io_err(e)),
        }
    }
    Err(ExportError::skip(
        ExportStage::Write,
        format!("no free file name for {}", planned.display()),
    ))
}
