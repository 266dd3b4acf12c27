//! Bounded worker pool for CPU-bound image work.

use super::cache::{CacheStats, ResultCache};
use super::coalesce::{follow, Coalescer, Registration};
use super::error::ProcessingError;
use super::image::{Fingerprint, Image, Operation};
use crate::panic::panic_message;
use crate::resource::ResourceManager;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

// =============================================================================
// Operator Trait
// =============================================================================

/// Applies an operation pipeline to an image.
///
/// Implementations are synchronous and CPU-bound; the processor runs them on
/// the blocking pool.
pub trait ImageOperator: Send + Sync + 'static {
    fn apply(&self, image: &Image, operations: &[Operation]) -> Result<Image, ProcessingError>;
}

// =============================================================================
// Configuration
// =============================================================================

/// Default cached result count.
pub const DEFAULT_CACHE_SIZE: usize = 256;

/// Default time `shutdown` waits for in-flight work.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Upper bound on workers; the pool may be smaller on hosts with fewer
    /// cores available.
    pub max_workers: usize,
    /// Maximum cached results.
    pub cache_size: usize,
    /// How long `shutdown` waits for in-flight work.
    pub shutdown_grace: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4),
            cache_size: DEFAULT_CACHE_SIZE,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl From<&crate::config::EngineConfig> for ProcessorConfig {
    fn from(config: &crate::config::EngineConfig) -> Self {
        Self {
            max_workers: config.processor.max_workers,
            cache_size: config.processor.cache_size,
            shutdown_grace: config.processor.shutdown_grace,
        }
    }
}

/// Counters for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub workers: usize,
    pub cache: CacheStats,
    pub coalesced: u64,
    pub operator_runs: u64,
}

// =============================================================================
// Concurrent Processor
// =============================================================================

/// Runs operation pipelines on a bounded pool with a result cache.
///
/// The pool is a semaphore in front of Tokio's blocking thread pool. Its size
/// is `min(max_workers, max_cpu_cores)` from the [`ResourceManager`], and at
/// least one.
///
/// # Example
///
/// ```ignore
/// let processor = ConcurrentProcessor::new(ProcessorConfig::default(), operator, &resources);
///
/// let ops = vec![Operation::new("resize").with_param("width", 800)];
/// let resized = processor.process_async(image, ops).await?;
/// ```
pub struct ConcurrentProcessor {
    operator: Arc<dyn ImageOperator>,
    workers: Arc<Semaphore>,
    worker_count: usize,
    cache: ResultCache,
    coalescer: Coalescer,
    accepting: AtomicBool,
    operator_runs: Arc<AtomicU64>,
    shutdown_grace: Duration,
}

impl ConcurrentProcessor {
    pub fn new(
        config: ProcessorConfig,
        operator: Arc<dyn ImageOperator>,
        resources: &ResourceManager,
    ) -> Self {
        let cpu_cap = resources.limits().max_cpu_cores as usize;
        let worker_count = config.max_workers.min(cpu_cap).max(1);

        info!(
            workers = worker_count,
            max_workers = config.max_workers,
            cpu_cores = cpu_cap,
            cache_size = config.cache_size,
            "Concurrent processor created"
        );

        Self {
            operator,
            workers: Arc::new(Semaphore::new(worker_count)),
            worker_count,
            cache: ResultCache::new(config.cache_size),
            coalescer: Coalescer::new(),
            accepting: AtomicBool::new(true),
            operator_runs: Arc::new(AtomicU64::new(0)),
            shutdown_grace: config.shutdown_grace,
        }
    }

    /// Applies `operations` to `image`, using the cache when possible.
    ///
    /// A cached result is returned without touching the pool. Concurrent
    /// identical requests share a single operator run.
    pub async fn process_async(
        &self,
        image: Image,
        operations: Vec<Operation>,
    ) -> Result<Image, ProcessingError> {
        self.ensure_accepting()?;

        let fingerprint = Fingerprint::compute(&image, &operations)?;
        if let Some(hit) = self.cache.get(&fingerprint) {
            debug!(fingerprint = ?fingerprint, "Result cache hit");
            return Ok(hit);
        }

        match self.coalescer.register(fingerprint) {
            Registration::Follower(rx) => follow(rx).await,
            Registration::Leader(guard) => {
                // A previous leader may have finished between our lookup
                // and registration.
                if let Some(hit) = self.cache.get(&fingerprint) {
                    guard.complete(Ok(hit.clone()));
                    return Ok(hit);
                }

                let operator = Arc::clone(&self.operator);
                let runs = Arc::clone(&self.operator_runs);
                let result = self
                    .execute(move || {
                        runs.fetch_add(1, Ordering::Relaxed);
                        operator.apply(&image, &operations)
                    })
                    .await
                    .and_then(|inner| inner);

                if let Ok(processed) = &result {
                    self.cache.insert(fingerprint, processed.clone());
                }
                guard.complete(result.clone());
                result
            }
        }
    }

    /// Processes every image with the same pipeline.
    ///
    /// Items run in parallel up to the worker cap; results come back in input
    /// order and one item's failure does not affect the others.
    pub async fn process_batch(
        &self,
        images: Vec<Image>,
        operations: &[Operation],
    ) -> Vec<Result<Image, ProcessingError>> {
        let futures = images
            .into_iter()
            .map(|image| self.process_async(image, operations.to_vec()));
        futures::future::join_all(futures).await
    }

    /// Runs an arbitrary CPU-bound closure on the pool.
    ///
    /// Panics are caught and reported as [`ProcessingError::Panicked`].
    pub async fn execute<F, T>(&self, f: F) -> Result<T, ProcessingError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_accepting()?;
        let permit = Arc::clone(&self.workers)
            .acquire_owned()
            .await
            .map_err(|_| ProcessingError::ShutDown)?;

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            catch_unwind(AssertUnwindSafe(f))
        });

        match handle.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => {
                let message = panic_message(payload.as_ref());
                warn!(panic = %message, "Worker panicked");
                Err(ProcessingError::Panicked(message))
            }
            Err(join_err) => Err(ProcessingError::Panicked(join_err.to_string())),
        }
    }

    /// Stops accepting work and drains in-flight work.
    ///
    /// Waits up to the configured grace period. Whether or not the drain
    /// finishes in time, the pool is closed and the cache cleared. Returns
    /// true if all in-flight work finished.
    pub async fn shutdown(&self) -> bool {
        self.shutdown_with_grace(self.shutdown_grace).await
    }

    pub async fn shutdown_with_grace(&self, grace: Duration) -> bool {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return true;
        }

        let permits = u32::try_from(self.worker_count).unwrap_or(u32::MAX);
        let drained = matches!(
            tokio::time::timeout(grace, self.workers.acquire_many(permits)).await,
            Ok(Ok(_))
        );

        self.workers.close();
        self.cache.clear();

        if drained {
            info!("Concurrent processor drained and shut down");
        } else {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "Concurrent processor shut down with work still in flight"
            );
        }
        drained
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Workers currently busy.
    pub fn busy_workers(&self) -> usize {
        self.worker_count
            .saturating_sub(self.workers.available_permits())
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            workers: self.worker_count,
            cache: self.cache.stats(),
            coalesced: self.coalescer.coalesced_count(),
            operator_runs: self.operator_runs.load(Ordering::Relaxed),
        }
    }

    fn ensure_accepting(&self) -> Result<(), ProcessingError> {
        if self.accepting.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProcessingError::ShutDown)
        }
    }
}

impl std::fmt::Debug for ConcurrentProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentProcessor")
            .field("workers", &self.worker_count)
            .field("busy", &self.busy_workers())
            .field("cached", &self.cache.len())
            .field("accepting", &self.is_accepting())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceLimits;
    use std::sync::atomic::AtomicUsize;

    /// Appends each operation name to the payload; fails on "explode".
    struct AppendOperator {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl AppendOperator {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
            })
        }
    }

    impl ImageOperator for AppendOperator {
        fn apply(&self, image: &Image, operations: &[Operation]) -> Result<Image, ProcessingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            let mut data = image.data().to_vec();
            for op in operations {
                match op.name.as_str() {
                    "explode" => panic!("operator exploded"),
                    "reject" => return Err(ProcessingError::Operator("rejected".into())),
                    name => data.extend_from_slice(name.as_bytes()),
                }
            }
            Ok(Image::new(format!("{}+ops", image.content_id()), data))
        }
    }

    fn processor(op: Arc<AppendOperator>, max_workers: usize, cpu: u32) -> ConcurrentProcessor {
        let resources = ResourceManager::new(ResourceLimits::new(1 << 30, cpu));
        ConcurrentProcessor::new(
            ProcessorConfig {
                max_workers,
                cache_size: 16,
                shutdown_grace: Duration::from_secs(1),
            },
            op,
            &resources,
        )
    }

    #[test]
    fn test_worker_count_bounded_by_cpu_limit() {
        let op = AppendOperator::new(Duration::ZERO);
        assert_eq!(processor(Arc::clone(&op), 8, 2).worker_count(), 2);
        assert_eq!(processor(Arc::clone(&op), 3, 16).worker_count(), 3);
        assert_eq!(processor(op, 0, 0).worker_count(), 1);
    }

    #[tokio::test]
    async fn test_second_identical_request_hits_cache() {
        let op = AppendOperator::new(Duration::ZERO);
        let p = processor(Arc::clone(&op), 2, 2);
        let image = Image::new("src", b"x".to_vec());
        let ops = vec![Operation::new("a"), Operation::new("b")];

        let first = p.process_async(image.clone(), ops.clone()).await.unwrap();
        let second = p.process_async(image, ops).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.data(), b"xab");
        assert_eq!(op.calls.load(Ordering::SeqCst), 1);
        assert_eq!(p.stats().cache.hits, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_identical_requests_coalesce() {
        let op = AppendOperator::new(Duration::from_millis(50));
        let p = Arc::new(processor(Arc::clone(&op), 4, 4));
        let image = Image::new("src", vec![]);

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let p = Arc::clone(&p);
                let image = image.clone();
                tokio::spawn(async move { p.process_async(image, vec![Operation::new("blur")]).await })
            })
            .collect();

        for t in tasks {
            assert!(t.await.unwrap().is_ok());
        }
        assert_eq!(op.calls.load(Ordering::SeqCst), 1);
        assert_eq!(p.stats().operator_runs, 1);
    }

    #[tokio::test]
    async fn test_batch_isolates_failures() {
        let op = AppendOperator::new(Duration::ZERO);
        let p = processor(op, 2, 2);
        let images = vec![
            Image::new("ok-1", vec![]),
            Image::new("ok-2", vec![]),
        ];

        let results = p.process_batch(images.clone(), &[Operation::new("s")]).await;
        assert!(results.iter().all(Result::is_ok));

        let rejected = p.process_batch(images, &[Operation::new("reject")]).await;
        assert_eq!(rejected.len(), 2);
        assert!(rejected
            .iter()
            .all(|r| matches!(r, Err(ProcessingError::Operator(_)))));
    }

    #[tokio::test]
    async fn test_operator_panic_becomes_error() {
        let op = AppendOperator::new(Duration::ZERO);
        let p = processor(op, 1, 1);

        let result = p
            .process_async(Image::new("bad", vec![]), vec![Operation::new("explode")])
            .await;
        match result {
            Err(ProcessingError::Panicked(msg)) => assert!(msg.contains("operator exploded")),
            other => panic!("unexpected: {other:?}"),
        }

        // Worker permit was returned
        assert_eq!(p.busy_workers(), 0);
        assert!(p
            .process_async(Image::new("good", vec![]), vec![Operation::new("s")])
            .await
            .is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_execute_respects_worker_cap() {
        let op = AppendOperator::new(Duration::ZERO);
        let p = Arc::new(processor(op, 2, 8));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let jobs: Vec<_> = (0..8)
            .map(|_| {
                let p = Arc::clone(&p);
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    p.execute(move || {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        current.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                })
            })
            .collect();

        for j in jobs {
            j.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work_and_clears_cache() {
        let op = AppendOperator::new(Duration::ZERO);
        let p = processor(op, 2, 2);
        p.process_async(Image::new("a", vec![]), vec![Operation::new("s")])
            .await
            .unwrap();
        assert_eq!(p.stats().cache.entries, 1);

        assert!(p.shutdown().await);
        assert!(!p.is_accepting());
        assert_eq!(p.stats().cache.entries, 0);
        assert_eq!(
            p.process_async(Image::new("a", vec![]), vec![]).await,
            Err(ProcessingError::ShutDown)
        );
        assert_eq!(p.execute(|| 1).await, Err(ProcessingError::ShutDown));

        // Second shutdown is a no-op
        assert!(p.shutdown().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_times_out_on_stuck_work() {
        let op = AppendOperator::new(Duration::from_millis(300));
        let p = Arc::new(processor(op, 1, 1));

        let busy = {
            let p = Arc::clone(&p);
            tokio::spawn(async move {
                p.process_async(Image::new("slow", vec![]), vec![Operation::new("s")])
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!p.shutdown_with_grace(Duration::from_millis(10)).await);
        // The in-flight item still completes
        assert!(busy.await.unwrap().is_ok());
    }
}
