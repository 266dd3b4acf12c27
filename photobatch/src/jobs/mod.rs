//! Jobs, the shared image pool, and export fan-out.
//!
//! A [`Job`] is a named set of pool images. Exporting a job with an
//! [`ExportConfig`](crate::export::ExportConfig) creates one coordinator task
//! per (image, analysis type); each task runs the export pipeline and its
//! completion hook folds the resulting record back into the job.
//!
//! # Example
//!
//! ```ignore
//! let job = jobs.create_job("holiday");
//! jobs.add_images(job.id, paths)?;
//! jobs.create_export_task(job.id, config)?;
//! println!("{}%", jobs.get_progress(job.id)?);
//! ```

mod error;
mod export_task;
mod job;
mod manager;
mod pool;

pub use error::JobError;
pub use job::{ExportTaskEntry, Job, JobId, JobStatus};
pub use manager::JobManager;
pub use pool::{ImagePool, ImagePoolEntry, PoolAddReport, PoolFailure};
