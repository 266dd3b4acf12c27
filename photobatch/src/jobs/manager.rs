//! Job orchestration.
//!
//! The [`JobManager`] owns jobs and the image pool, fans an export out into
//! one coordinator task per (image, analysis type), and folds completions
//! back into job progress and history.
//!
//! # Locking
//!
//! The job map, the image pool and the coordinator's queue each have their
//! own lock and no path holds two at once. Completion hooks run on
//! coordinator threads and take only the job map lock; anything that calls
//! back into the coordinator (cancelling on abort, for instance) happens
//! after that lock is released.

use super::error::JobError;
use super::export_task::{record_from_result, ExportTaskBody, RecordSlot, RunFlags};
use super::job::{ExportTaskEntry, Job, JobId, JobStatus};
use super::pool::{ImagePool, ImagePoolEntry, PoolAddReport};
use crate::coordinator::{
    Task, TaskCoordinator, TaskHandle, TaskId, TaskResult, TaskStatus, TaskType,
};
use crate::events::{ProgressBus, ProgressEvent};
use crate::export::{
    AnalysisType, ExportConfig, ExportError, ExportItem, ExportPipeline, ExportRecord,
    ExportStage,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

// =============================================================================
// Internal State
// =============================================================================

#[derive(Default)]
struct ExportRun {
    total: usize,
    finished: usize,
    succeeded: usize,
    flags: Arc<RunFlags>,
}

struct JobState {
    job: Job,
    /// Handles of submitted tasks that have not finished.
    active: HashMap<TaskId, TaskHandle>,
    run: ExportRun,
    status_tx: watch::Sender<JobStatus>,
}

impl JobState {
    fn set_status(&mut self, status: JobStatus) {
        self.job.status = status;
        self.status_tx.send_replace(status);
    }
}

struct JobsInner {
    jobs: RwLock<HashMap<JobId, JobState>>,
    pool: ImagePool,
    coordinator: Arc<TaskCoordinator>,
    pipeline: Arc<ExportPipeline>,
    progress: Arc<ProgressBus>,
}

fn percent(finished: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((finished.min(total) * 100) / total) as u8
}

// =============================================================================
// Job Manager
// =============================================================================

/// Creates jobs, runs their exports, and tracks progress.
///
/// # Example
///
/// ```ignore
/// let jobs = JobManager::new(coordinator, pipeline, progress);
///
/// let job = jobs.create_job("J1");
/// let report = jobs.add_images(job.id, ["/photos/a.jpg", "/photos/b.jpg"])?;
/// jobs.create_export_task(job.id, ExportConfig::new("/out", vec!["histogram".into()]))?;
///
/// let job = jobs.wait_for_job(job.id, Duration::from_secs(60)).await?;
/// assert_eq!(job.progress, 100);
/// ```
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<JobsInner>,
}

impl JobManager {
    pub fn new(
        coordinator: Arc<TaskCoordinator>,
        pipeline: Arc<ExportPipeline>,
        progress: Arc<ProgressBus>,
    ) -> Self {
        Self {
            inner: Arc::new(JobsInner {
                jobs: RwLock::new(HashMap::new()),
                pool: ImagePool::new(),
                coordinator,
                pipeline,
                progress,
            }),
        }
    }

    /// Creates an empty job. Always succeeds.
    pub fn create_job(&self, name: impl Into<String>) -> Job {
        let job = Job::new(name);
        let snapshot = job.clone();
        let (status_tx, _) = watch::channel(job.status);
        self.inner.jobs.write().insert(
            job.id,
            JobState {
                job,
                active: HashMap::new(),
                run: ExportRun::default(),
                status_tx,
            },
        );
        info!(job_id = %snapshot.id, name = %snapshot.name, "Job created");
        snapshot
    }

    // -------------------------------------------------------------------------
    // Image pool
    // -------------------------------------------------------------------------

    /// Adds images to the shared pool. Invalid paths are reported, not raised.
    pub fn add_images_to_pool<I, P>(&self, paths: I) -> PoolAddReport
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.inner.pool.add(paths)
    }

    /// Adds images to the pool and attaches them to a job.
    pub fn add_images<I, P>(&self, job_id: JobId, paths: I) -> Result<PoolAddReport, JobError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        if !self.inner.jobs.read().contains_key(&job_id) {
            return Err(JobError::NotFound(job_id));
        }
        let report = self.inner.pool.add(paths);
        self.attach_images(job_id, report.image_ids())?;
        Ok(report)
    }

    /// Attaches pool images to a job. Returns how many were newly attached.
    pub fn attach_images<I, S>(&self, job_id: JobId, image_ids: I) -> Result<usize, JobError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids: Vec<String> = image_ids
            .into_iter()
            .map(|id| id.as_ref().to_string())
            .collect();
        if let Some(missing) = ids.iter().find(|id| !self.inner.pool.contains(id)) {
            return Err(JobError::ImageNotInPool(missing.clone()));
        }

        let mut jobs = self.inner.jobs.write();
        let state = jobs.get_mut(&job_id).ok_or(JobError::NotFound(job_id))?;
        let mut attached = 0;
        for id in ids {
            if !state.job.image_refs.contains(&id) {
                state.job.image_refs.push(id);
                attached += 1;
            }
        }
        Ok(attached)
    }

    /// Removes an image from the pool. Jobs that still reference it record a
    /// skipped item on their next export.
    pub fn remove_image_from_pool(&self, image_id: &str) -> bool {
        self.inner.pool.remove(image_id)
    }

    pub fn pool(&self) -> &ImagePool {
        &self.inner.pool
    }

    // -------------------------------------------------------------------------
    // Export
    // -------------------------------------------------------------------------

    /// Submits one task per (attached image, analysis type).
    ///
    /// Returns the handles of the submitted tasks. Item failures never
    /// surface here; they become records in the job's export history.
    pub fn create_export_task(
        &self,
        job_id: JobId,
        config: ExportConfig,
    ) -> Result<Vec<TaskHandle>, JobError> {
        let (job_name, image_refs) = {
            let jobs = self.inner.jobs.read();
            let state = jobs.get(&job_id).ok_or(JobError::NotFound(job_id))?;
            if state.job.status == JobStatus::Running {
                return Err(JobError::ExportInProgress(job_id));
            }
            (state.job.name.clone(), state.job.image_refs.clone())
        };

        let config = Arc::new(config);
        let flags = Arc::new(RunFlags::default());
        let mut planned = Vec::new();
        let mut orphaned = Vec::new();

        for image_id in &image_refs {
            let entry = self.inner.pool.get(image_id);
            for analysis in &config.analysis_types {
                match &entry {
                    Some(entry) => {
                        planned.push(self.build_task(job_id, &job_name, entry, analysis, &config, &flags))
                    }
                    None => orphaned.push(ExportRecord::failed(
                        image_id.clone(),
                        analysis.clone(),
                        None,
                        &ExportError::skip(
                            ExportStage::Load,
                            format!("image {image_id} is no longer in the pool"),
                        ),
                        0,
                    )),
                }
            }
        }

        let total = planned.len() + orphaned.len();
        {
            let mut jobs = self.inner.jobs.write();
            let state = jobs.get_mut(&job_id).ok_or(JobError::NotFound(job_id))?;
            if state.job.status == JobStatus::Running {
                return Err(JobError::ExportInProgress(job_id));
            }
            state.job.export_tasks = planned
                .iter()
                .map(|(_, entry)| (entry.task_id, entry.clone()))
                .collect();
            state.job.progress = percent(0, total);
            state.job.aborted = false;
            state.active.clear();
            state.run = ExportRun {
                total,
                flags: Arc::clone(&flags),
                ..Default::default()
            };
            state.set_status(if total == 0 {
                JobStatus::Completed
            } else {
                JobStatus::Running
            });
        }

        info!(
            job_id = %job_id,
            items = total,
            images = image_refs.len(),
            analyses = config.analysis_types.len(),
            "Export started"
        );
        self.inner.progress.publish(ProgressEvent {
            job_id,
            percentage: percent(0, total),
            message: format!("export started: {total} items"),
        });

        for record in orphaned {
            self.inner.record_completion(job_id, None, record);
        }

        let mut handles = Vec::with_capacity(planned.len());
        for (task, entry) in planned {
            match self.inner.coordinator.submit(task) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    warn!(job_id = %job_id, task_id = %entry.task_id, error = %err, "Export task rejected");
                    let record = ExportRecord::failed(
                        entry.image_id,
                        entry.analysis_type,
                        None,
                        &ExportError::abort(ExportStage::Load, err.to_string()),
                        0,
                    );
                    self.inner
                        .record_completion(job_id, Some((entry.task_id, TaskStatus::Failed)), record);
                }
            }
        }

        // Tasks that already finished are not tracked as active. A stop that
        // arrived during submission is applied now: cancel stops everything,
        // abort only what has not started.
        let (late_cancel, abort_only): (Vec<TaskHandle>, bool) = {
            let mut jobs = self.inner.jobs.write();
            match jobs.get_mut(&job_id) {
                Some(state) => {
                    for handle in &handles {
                        let pending = state
                            .job
                            .export_tasks
                            .get(&handle.id())
                            .is_some_and(|entry| !entry.status.is_terminal());
                        if pending {
                            state.active.insert(handle.id(), handle.clone());
                        }
                    }
                    if flags.cancelled.load(Ordering::Acquire) {
                        (state.active.values().cloned().collect(), false)
                    } else if flags.aborted.load(Ordering::Acquire) {
                        (state.active.values().cloned().collect(), true)
                    } else {
                        (Vec::new(), false)
                    }
                }
                None => (handles.clone(), false),
            }
        };
        for handle in &late_cancel {
            if abort_only {
                self.inner.coordinator.cancel_pending(handle);
            } else {
                self.inner.coordinator.cancel(handle);
            }
        }

        Ok(handles)
    }

    fn build_task(
        &self,
        job_id: JobId,
        job_name: &str,
        entry: &ImagePoolEntry,
        analysis: &AnalysisType,
        config: &Arc<ExportConfig>,
        flags: &Arc<RunFlags>,
    ) -> (Task, ExportTaskEntry) {
        let item = ExportItem {
            job_name: job_name.to_string(),
            image_id: entry.image_id.clone(),
            source_path: entry.source_path.clone(),
            analysis_type: analysis.clone(),
        };
        let slot: RecordSlot = Arc::new(Mutex::new(None));
        let body = ExportTaskBody {
            pipeline: Arc::clone(&self.inner.pipeline),
            item: item.clone(),
            config: Arc::clone(config),
            flags: Arc::clone(flags),
            slot: Arc::clone(&slot),
        };

        let run_flags = Arc::clone(flags);
        let weak = Arc::downgrade(&self.inner);
        let task = Task::new(
            format!("export {} {}", entry.image_id, analysis),
            TaskType::AnalysisExport,
            body,
        )
        .with_priority(config.priority)
        .with_estimate(config.item_estimate)
        .with_completion_hook(move |result: &TaskResult| {
            let record = slot
                .lock()
                .take()
                .unwrap_or_else(|| record_from_result(&item, result, &run_flags));
            if let Some(inner) = weak.upgrade() {
                inner.record_completion(job_id, Some((result.task_id, result.status)), record);
            }
        });

        let tracked = ExportTaskEntry {
            task_id: task.id(),
            image_id: entry.image_id.clone(),
            analysis_type: analysis.clone(),
            status: TaskStatus::Pending,
        };
        (task, tracked)
    }

    // -------------------------------------------------------------------------
    // Queries and control
    // -------------------------------------------------------------------------

    /// Completion percentage of the job's current export.
    pub fn get_progress(&self, job_id: JobId) -> Result<u8, JobError> {
        self.with_job(job_id, |job| job.progress)
    }

    /// Every record of the job, in completion order.
    pub fn get_export_history(&self, job_id: JobId) -> Result<Vec<ExportRecord>, JobError> {
        self.with_job(job_id, |job| job.export_history.clone())
    }

    pub fn get_job(&self, job_id: JobId) -> Result<Job, JobError> {
        self.with_job(job_id, Job::clone)
    }

    /// Snapshots of every job, oldest first.
    pub fn list_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .inner
            .jobs
            .read()
            .values()
            .map(|state| state.job.clone())
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    /// Cancels every unfinished task of the job.
    ///
    /// Cancelled items still produce a failed record; the job ends
    /// `Cancelled` once they have all reported. Returns how many tasks were
    /// signalled.
    pub fn cancel_job(&self, job_id: JobId) -> Result<usize, JobError> {
        let handles: Vec<TaskHandle> = {
            let mut jobs = self.inner.jobs.write();
            let state = jobs.get_mut(&job_id).ok_or(JobError::NotFound(job_id))?;
            match state.job.status {
                JobStatus::Running => {
                    state.run.flags.cancelled.store(true, Ordering::Release);
                    state.active.values().cloned().collect()
                }
                JobStatus::Created => {
                    state.set_status(JobStatus::Cancelled);
                    Vec::new()
                }
                _ => Vec::new(),
            }
        };

        let signalled = handles
            .iter()
            .filter(|handle| self.inner.coordinator.cancel(handle))
            .count();
        info!(job_id = %job_id, signalled, "Job cancellation requested");
        Ok(signalled)
    }

    /// Releases a task's resources early and stops tracking it as active.
    ///
    /// Idempotent. Returns true if an allocation was released.
    pub fn cleanup_export_resources(&self, job_id: JobId, task_id: TaskId) -> Result<bool, JobError> {
        {
            let mut jobs = self.inner.jobs.write();
            let state = jobs.get_mut(&job_id).ok_or(JobError::NotFound(job_id))?;
            state.active.remove(&task_id);
        }
        let released = self.inner.coordinator.release_task_resources(task_id);
        debug!(job_id = %job_id, task_id = %task_id, released, "Export resources cleaned up");
        Ok(released)
    }

    /// Removes a job, cancelling any unfinished tasks.
    pub fn delete_job(&self, job_id: JobId) -> Result<Job, JobError> {
        let state = self
            .inner
            .jobs
            .write()
            .remove(&job_id)
            .ok_or(JobError::NotFound(job_id))?;
        state.run.flags.cancelled.store(true, Ordering::Release);
        for handle in state.active.values() {
            self.inner.coordinator.cancel(handle);
        }
        info!(job_id = %job_id, name = %state.job.name, "Job deleted");
        Ok(state.job)
    }

    /// Waits until the job reaches a terminal status or `timeout` elapses,
    /// then returns its snapshot.
    pub async fn wait_for_job(&self, job_id: JobId, timeout: Duration) -> Result<Job, JobError> {
        let mut rx = {
            let jobs = self.inner.jobs.read();
            jobs.get(&job_id)
                .ok_or(JobError::NotFound(job_id))?
                .status_tx
                .subscribe()
        };
        let _ = tokio::time::timeout(timeout, rx.wait_for(JobStatus::is_terminal)).await;
        self.get_job(job_id)
    }

    pub fn progress_bus(&self) -> &Arc<ProgressBus> {
        &self.inner.progress
    }

    pub fn coordinator(&self) -> &Arc<TaskCoordinator> {
        &self.inner.coordinator
    }

    fn with_job<T>(&self, job_id: JobId, f: impl FnOnce(&Job) -> T) -> Result<T, JobError> {
        self.inner
            .jobs
            .read()
            .get(&job_id)
            .map(|state| f(&state.job))
            .ok_or(JobError::NotFound(job_id))
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("jobs", &self.inner.jobs.read().len())
            .field("pool", &self.inner.pool)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Completion
// =============================================================================

impl JobsInner {
    /// Folds one finished item into its job.
    ///
    /// `task` is `None` for items that never became tasks. The first abort
    /// withdraws the job's queued tasks; tasks already running finish.
    fn record_completion(
        &self,
        job_id: JobId,
        task: Option<(TaskId, TaskStatus)>,
        record: ExportRecord,
    ) {
        let to_cancel: Vec<TaskHandle> = {
            let mut jobs = self.jobs.write();
            let Some(state) = jobs.get_mut(&job_id) else {
                trace!(job_id = %job_id, "Export item finished for a deleted job");
                return;
            };

            if let Some((task_id, status)) = task {
                state.active.remove(&task_id);
                match state.job.export_tasks.get_mut(&task_id) {
                    Some(entry) if !entry.status.is_terminal() => entry.status = status,
                    _ => {
                        trace!(job_id = %job_id, task_id = %task_id, "Stale export completion ignored");
                        return;
                    }
                }
            }

            state.run.finished += 1;
            if record.success {
                state.run.succeeded += 1;
            }

            let abort_now = record.is_abort() && !state.job.aborted;
            if abort_now {
                warn!(
                    job_id = %job_id,
                    image_id = %record.image_id,
                    error = record.error_message.as_deref().unwrap_or(""),
                    "Export aborted; no further items will start"
                );
                state.job.aborted = true;
                state.run.flags.aborted.store(true, Ordering::Release);
            }

            let percentage = percent(state.run.finished, state.run.total);
            state.job.progress = state.job.progress.max(percentage);
            // Published under the lock so observers see percentages in order.
            self.progress.publish(ProgressEvent {
                job_id,
                percentage: state.job.progress,
                message: describe(&record),
            });
            state.job.export_history.push(record);

            if state.run.finished >= state.run.total && state.job.status == JobStatus::Running {
                let status = if state.run.flags.cancelled.load(Ordering::Acquire) {
                    JobStatus::Cancelled
                } else if state.job.aborted || state.run.succeeded == 0 {
                    JobStatus::Failed
                } else {
                    JobStatus::Completed
                };
                state.set_status(status);
                info!(
                    job_id = %job_id,
                    status = %status,
                    succeeded = state.run.succeeded,
                    failed = state.run.finished - state.run.succeeded,
                    "Export finished"
                );
                self.progress.publish(ProgressEvent {
                    job_id,
                    percentage: state.job.progress,
                    message: format!("export {status}"),
                });
            }

            if abort_now {
                state.active.values().cloned().collect()
            } else {
                Vec::new()
            }
        };

        let withdrawn = to_cancel
            .iter()
            .filter(|handle| self.coordinator.cancel_pending(handle))
            .count();
        if withdrawn > 0 {
            debug!(job_id = %job_id, withdrawn, "Queued export items withdrawn after abort");
        }
    }
}

fn describe(record: &ExportRecord) -> String {
    match &record.error_message {
        None => format!("{} {}: exported", record.image_id, record.analysis_type),
        Some(error) => format!("{} {}: {}", record.image_id, record.analysis_type, error),
    }
}
