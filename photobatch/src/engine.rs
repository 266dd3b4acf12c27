//! Engine facade that wires every component from one [`EngineConfig`].
//!
//! ```text
//!   ResourceManager ◄── TaskCoordinator ◄── JobManager ──► ProgressBus
//!         ▲                                    │
//!         └──── ConcurrentProcessor ◄── ExportPipeline
//! ```
//!
//! # Example
//!
//! ```ignore
//! use photobatch::engine::{BatchEngine, Collaborators};
//! use photobatch::config::EngineConfig;
//!
//! let config = EngineConfig::load_from(Path::new("photobatch.ini"))?;
//! let engine = BatchEngine::new(&config, Collaborators::new(operator, analyzer))?;
//!
//! let jobs = engine.jobs();
//! let job = jobs.create_job("J1");
//! jobs.add_images(job.id, paths)?;
//! jobs.create_export_task(job.id, engine.export_config("/out", vec!["histogram".into()]))?;
//!
//! engine.shutdown().await;
//! ```

use crate::config::EngineConfig;
use crate::coordinator::{CoordinatorConfig, TaskCoordinator, TracingTelemetrySink};
use crate::error::EngineError;
use crate::events::ProgressBus;
use crate::export::{AnalysisType, Analyzer, ExportConfig, ExportPipeline, ImageLoader, Renderer};
use crate::jobs::JobManager;
use crate::processor::{ConcurrentProcessor, ImageOperator, ProcessorConfig};
use crate::resource::{ResourceKind, ResourceManager, ThresholdId};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Application-supplied collaborators.
///
/// The operator and analyzer are required. Loader and renderer default to
/// [`FsImageLoader`](crate::export::FsImageLoader) and
/// [`JsonRenderer`](crate::export::JsonRenderer); there is no fallback
/// renderer unless one is given.
pub struct Collaborators {
    operator: Arc<dyn ImageOperator>,
    analyzer: Arc<dyn Analyzer>,
    loader: Option<Arc<dyn ImageLoader>>,
    renderer: Option<Arc<dyn Renderer>>,
    fallback_renderer: Option<Arc<dyn Renderer>>,
}

impl Collaborators {
    pub fn new(operator: Arc<dyn ImageOperator>, analyzer: Arc<dyn Analyzer>) -> Self {
        Self {
            operator,
            analyzer,
            loader: None,
            renderer: None,
            fallback_renderer: None,
        }
    }

    pub fn with_loader(mut self, loader: Arc<dyn ImageLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_fallback_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.fallback_renderer = Some(renderer);
        self
    }
}

/// The assembled engine.
///
/// Must be created inside a Tokio runtime: the coordinator's dispatcher and
/// the progress delivery task are spawned on construction.
pub struct BatchEngine {
    config: EngineConfig,
    resources: Arc<ResourceManager>,
    coordinator: Arc<TaskCoordinator>,
    processor: Arc<ConcurrentProcessor>,
    pipeline: Arc<ExportPipeline>,
    progress: Arc<ProgressBus>,
    jobs: JobManager,
    usage_alert: ThresholdId,
}

impl BatchEngine {
    /// Builds every component, leaves first.
    ///
    /// Fails only if the configured usage alert fraction is out of range.
    pub fn new(config: &EngineConfig, collaborators: Collaborators) -> Result<Self, EngineError> {
        let resources = Arc::new(ResourceManager::new(config.resource_limits()));
        let usage_alert = resources.register_threshold(
            config.resources.usage_alert_fraction,
            |event| {
                let unit = match event.kind {
                    ResourceKind::Memory => "bytes",
                    ResourceKind::Cpu => "cores",
                };
                warn!(
                    resource = %event.kind,
                    used = event.used,
                    limit = event.limit,
                    unit,
                    fraction = event.fraction,
                    "Resource usage crossed alert threshold"
                );
            },
        )?;

        let coordinator = Arc::new(TaskCoordinator::with_telemetry(
            CoordinatorConfig::from(config),
            Arc::clone(&resources),
            Arc::new(TracingTelemetrySink),
        ));

        let processor = Arc::new(ConcurrentProcessor::new(
            ProcessorConfig::from(config),
            collaborators.operator,
            &resources,
        ));

        let mut pipeline = ExportPipeline::new(Arc::clone(&processor), collaborators.analyzer)
            .with_retry_policy(config.retry_policy());
        if let Some(loader) = collaborators.loader {
            pipeline = pipeline.with_loader(loader);
        }
        if let Some(renderer) = collaborators.renderer {
            pipeline = pipeline.with_renderer(renderer);
        }
        if let Some(renderer) = collaborators.fallback_renderer {
            pipeline = pipeline.with_fallback_renderer(renderer);
        }
        let pipeline = Arc::new(pipeline);

        let progress = Arc::new(ProgressBus::new());
        let jobs = JobManager::new(
            Arc::clone(&coordinator),
            Arc::clone(&pipeline),
            Arc::clone(&progress),
        );

        info!(
            max_memory = config.resources.max_memory,
            max_cpu_cores = config.resources.max_cpu_cores,
            workers = processor.worker_count(),
            "Batch engine started"
        );

        Ok(Self {
            config: config.clone(),
            resources,
            coordinator,
            processor,
            pipeline,
            progress,
            jobs,
            usage_alert,
        })
    }

    /// An export config rooted at `output_root` with the engine's conflict
    /// policy applied.
    pub fn export_config(
        &self,
        output_root: impl Into<PathBuf>,
        analysis_types: Vec<AnalysisType>,
    ) -> ExportConfig {
        ExportConfig::new(output_root, analysis_types)
            .with_conflict_policy(self.config.export.conflict_policy)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn coordinator(&self) -> &Arc<TaskCoordinator> {
        &self.coordinator
    }

    pub fn processor(&self) -> &Arc<ConcurrentProcessor> {
        &self.processor
    }

    pub fn pipeline(&self) -> &Arc<ExportPipeline> {
        &self.pipeline
    }

    pub fn progress(&self) -> &Arc<ProgressBus> {
        &self.progress
    }

    /// Stops accepting work, cancels whatever is queued or running, drains
    /// the worker pool and delivers pending progress events.
    pub async fn shutdown(&self) {
        info!("Batch engine shutting down");
        self.coordinator.shutdown().await;
        let drained = self.processor.shutdown().await;
        self.progress.flush().await;
        self.resources.unregister_threshold(self.usage_alert);
        info!(drained, "Batch engine shut down");
    }
}

impl std::fmt::Debug for BatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchEngine")
            .field("coordinator", &self.coordinator)
            .field("workers", &self.processor.worker_count())
            .field("observers", &self.progress.observer_count())
            .finish_non_exhaustive()
    }
}
