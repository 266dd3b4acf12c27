//! End-to-end tests for the batch engine.
//!
//! These tests drive the public API the way an embedding application does:
//! - Build a `BatchEngine` from an `EngineConfig`
//! - Create jobs over real files in a temporary directory
//! - Export and wait for the job to finish
//! - Inspect the export history, progress events and written files

use parking_lot::Mutex;
use photobatch::config::EngineConfig;
use photobatch::engine::{BatchEngine, Collaborators};
use photobatch::events::ProgressEvent;
use photobatch::export::{
    AnalysisResult, AnalysisType, Analyzer, ErrorClass, ExportConfig, ExportError,
};
use photobatch::jobs::{JobId, JobStatus};
use photobatch::processor::{Image, ImageOperator, Operation, ProcessingError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const JOB_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Test Helpers
// =============================================================================

/// Reverses the pixel bytes.
struct Invert;

impl ImageOperator for Invert {
    fn apply(&self, image: &Image, _operations: &[Operation]) -> Result<Image, ProcessingError> {
        let data: Vec<u8> = image.data().iter().rev().copied().collect();
        Ok(Image::new(format!("{}:inverted", image.content_id()), data))
    }
}

/// Reports the byte count, optionally slowly.
struct ByteCount {
    delay: Duration,
}

impl Analyzer for ByteCount {
    fn analyze(
        &self,
        image: &Image,
        analysis_type: &AnalysisType,
    ) -> Result<AnalysisResult, ExportError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok(AnalysisResult {
            analysis_type: analysis_type.clone(),
            image_content_id: image.content_id().to_string(),
            data: serde_json::json!({ "bytes": image.len() }),
        })
    }
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.resources.max_memory = 1024 * 1024 * 1024;
    config.resources.max_cpu_cores = 2;
    config.processor.max_workers = 2;
    config.scheduler.requeue_base_delay = Duration::from_millis(1);
    config.scheduler.requeue_max_delay = Duration::from_millis(20);
    config.export.retry_base_delay = Duration::from_millis(1);
    config.export.retry_max_delay = Duration::from_millis(5);
    config
}

fn engine_with_delay(delay: Duration) -> BatchEngine {
    BatchEngine::new(
        &test_config(),
        Collaborators::new(Arc::new(Invert), Arc::new(ByteCount { delay })),
    )
    .unwrap()
}

fn engine() -> BatchEngine {
    engine_with_delay(Duration::ZERO)
}

/// Writes `count` distinct image files and returns their paths.
fn write_images(dir: &Path, count: usize) -> Vec<PathBuf> {
    (0..count)
        .map(|i| {
            let path = dir.join(format!("img{i}.jpg"));
            std::fs::write(&path, format!("pixels of image {i}")).unwrap();
            path
        })
        .collect()
}

fn analyses() -> Vec<AnalysisType> {
    vec!["histogram".into(), "statistics".into()]
}

fn subscribe_progress(engine: &BatchEngine, job_id: JobId) -> Arc<Mutex<Vec<u8>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    engine.progress().subscribe(move |event: &ProgressEvent| {
        if event.job_id == job_id {
            sink.lock().push(event.percentage);
        }
    });
    seen
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_all_valid_images_export_every_item() {
    let source = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    let engine = engine();
    let jobs = engine.jobs();

    let job = jobs.create_job("J1");
    let seen = subscribe_progress(&engine, job.id);
    let report = jobs.add_images(job.id, write_images(source.path(), 5)).unwrap();
    assert_eq!(report.count_added(), 5);

    let handles = jobs
        .create_export_task(job.id, engine.export_config(output.path(), analyses()))
        .unwrap();
    assert_eq!(handles.len(), 10);

    let job = jobs.wait_for_job(job.id, JOB_TIMEOUT).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(jobs.get_progress(job.id).unwrap(), 100);

    let history = jobs.get_export_history(job.id).unwrap();
    assert_eq!(history.len(), 10);
    assert!(history.iter().all(|r| r.success && r.attempts == 1));

    for analysis in ["histogram", "statistics"] {
        for i in 0..5 {
            let path = output.path().join("J1").join(analysis).join(format!("img{i}.json"));
            assert!(path.is_file(), "missing {}", path.display());
        }
    }

    engine.progress().flush().await;
    let seen = seen.lock().clone();
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress regressed: {seen:?}");
    assert_eq!(seen.last(), Some(&100));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_one_invalid_image_is_skipped_without_failing_the_job() {
    let source = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    let engine = engine();
    let jobs = engine.jobs();

    let mut paths = write_images(source.path(), 4);
    let corrupt = source.path().join("corrupt.jpg");
    std::fs::write(&corrupt, b"").unwrap();
    paths.push(corrupt);

    let job = jobs.create_job("J2");
    jobs.add_images(job.id, &paths).unwrap();
    jobs.create_export_task(job.id, engine.export_config(output.path(), analyses()))
        .unwrap();

    let job = jobs.wait_for_job(job.id, JOB_TIMEOUT).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);

    let history = jobs.get_export_history(job.id).unwrap();
    let successes = history.iter().filter(|r| r.success).count();
    let failures: Vec<_> = history.iter().filter(|r| !r.success).collect();
    assert_eq!(successes, 8);
    assert_eq!(failures.len(), 2);
    for failure in failures {
        assert_eq!(failure.error_class, Some(ErrorClass::Skip));
        assert!(failure.error_message.is_some());
        assert!(failure.output_path.is_none());
    }

    engine.shutdown().await;
}

#[tokio::test]
async fn test_identical_transforms_run_once_per_image() {
    let source = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    let engine = engine();
    let jobs = engine.jobs();

    let job = jobs.create_job("cached");
    jobs.add_images(job.id, write_images(source.path(), 3)).unwrap();
    let config = engine
        .export_config(output.path(), analyses())
        .with_operations(vec![Operation::new("invert")]);
    jobs.create_export_task(job.id, config).unwrap();

    let job = jobs.wait_for_job(job.id, JOB_TIMEOUT).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(engine.processor().stats().operator_runs, 3);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_unwritable_destination_aborts_the_job() {
    let source = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    let blocker = output.path().join("not-a-dir");
    std::fs::write(&blocker, "x").unwrap();

    let engine = engine();
    let jobs = engine.jobs();
    let job = jobs.create_job("J3");
    jobs.add_images(job.id, write_images(source.path(), 3)).unwrap();
    jobs.create_export_task(job.id, ExportConfig::new(&blocker, analyses()))
        .unwrap();

    let job = jobs.wait_for_job(job.id, JOB_TIMEOUT).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.aborted);
    assert_eq!(job.progress, 100);
    assert_eq!(job.export_history.len(), 6);
    assert!(job.export_history.iter().all(|r| !r.success));
    assert!(job.export_history.iter().any(|r| r.is_abort()));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_cancel_job_records_every_item() {
    let source = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    let engine = engine_with_delay(Duration::from_millis(100));
    let jobs = engine.jobs();

    let job = jobs.create_job("cancelled");
    jobs.add_images(job.id, write_images(source.path(), 10)).unwrap();
    let handles = jobs
        .create_export_task(job.id, engine.export_config(output.path(), analyses()))
        .unwrap();
    assert_eq!(handles.len(), 20);

    jobs.cancel_job(job.id).unwrap();

    let job = jobs.wait_for_job(job.id, JOB_TIMEOUT).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.export_history.len(), 20);
    assert!(job.export_history.iter().any(|r| !r.success));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_config_file_drives_engine() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("photobatch.ini");
    std::fs::write(
        &path,
        "[resources]\nmax_memory = 512MB\nmax_cpu_cores = 1\n\n[export]\nmax_retry_attempts = 4\nconflict_policy = suffix\n",
    )
    .unwrap();

    let config = EngineConfig::load_from(&path).unwrap();
    let engine = BatchEngine::new(
        &config,
        Collaborators::new(Arc::new(Invert), Arc::new(ByteCount { delay: Duration::ZERO })),
    )
    .unwrap();

    assert_eq!(engine.resources().limits().max_memory_bytes, 512 * 1024 * 1024);
    assert_eq!(engine.processor().worker_count(), 1);
    assert_eq!(engine.pipeline().retry_policy().max_attempts, 4);

    engine.shutdown().await;
}
