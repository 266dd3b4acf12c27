//! Concurrent image processing with a content-addressed cache.
//!
//! [`ConcurrentProcessor`] owns a fixed-size worker pool (a semaphore in
//! front of Tokio's blocking threads) and a [`ResultCache`] keyed by
//! [`Fingerprint`]: the hash of an image's content identity and its
//! serialized operation pipeline. Pixel work itself is delegated to an
//! [`ImageOperator`] supplied by the embedding application.

mod cache;
mod coalesce;
mod error;
mod image;
#[allow(clippy::module_inception)]
mod processor;

pub use cache::{CacheStats, ResultCache};
pub use error::ProcessingError;
pub use image::{Fingerprint, Image, Operation};
pub use processor::{
    ConcurrentProcessor, ImageOperator, ProcessorConfig, ProcessorStats, DEFAULT_CACHE_SIZE,
    DEFAULT_SHUTDOWN_GRACE,
};
