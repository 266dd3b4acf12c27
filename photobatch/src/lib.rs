//! photobatch - batch job and resource coordination for image export
//!
//! The engine accepts named jobs over a shared pool of source images and
//! exports one result per (image, analysis type) under bounded memory and
//! CPU budgets. One bad image never fails the batch: every item ends as an
//! [`ExportRecord`](export::ExportRecord) in its job's history.
//!
//! # High-Level API
//!
//! The [`engine`] module wires every component from an
//! [`EngineConfig`](config::EngineConfig):
//!
//! ```ignore
//! use photobatch::config::EngineConfig;
//! use photobatch::engine::{BatchEngine, Collaborators};
//!
//! let engine = BatchEngine::new(&EngineConfig::default(), Collaborators::new(operator, analyzer))?;
//! let job = engine.jobs().create_job("J1");
//! engine.jobs().add_images(job.id, ["/photos/a.jpg", "/photos/b.jpg"])?;
//! engine
//!     .jobs()
//!     .create_export_task(job.id, engine.export_config("/out", vec!["histogram".into()]))?;
//! ```
//!
//! # Components
//!
//! - [`resource`]: memory/CPU ledger
//! - [`coordinator`]: priority scheduler with per-type caps
//! - [`processor`]: bounded worker pool and result cache
//! - [`export`]: per-item pipeline and retry policy
//! - [`jobs`]: jobs, image pool, progress aggregation
//! - [`events`]: progress observers

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod events;
pub mod export;
pub mod jobs;
pub mod logging;
pub mod panic;
pub mod processor;
pub mod resource;

pub use error::EngineError;

/// Version of the photobatch library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
