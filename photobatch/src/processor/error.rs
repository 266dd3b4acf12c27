use thiserror::Error;

/// Errors from the concurrent processor.
///
/// `Clone` so that one failed computation can be delivered to every
/// coalesced waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProcessingError {
    /// The operator rejected the image or pipeline.
    #[error("operation failed: {0}")]
    Operator(String),

    /// The operator or closure panicked.
    #[error("worker panicked: {0}")]
    Panicked(String),

    /// The processor is shutting down and accepts no new work.
    #[error("processor is shut down")]
    ShutDown,

    /// The computation this request was waiting on went away.
    #[error("shared computation was abandoned")]
    Abandoned,

    /// The operation pipeline could not be serialized for fingerprinting.
    #[error("failed to serialize operations: {0}")]
    Serialization(String),
}
