//! Error types for the transcoding worker pool core.
//!
//! Two layers, kept deliberately distinct: [`PoolError`] crosses the façade
//! boundary and is what upstream callers see; [`ExecutorErrorKind`] is
//! returned by [`crate::jobs::executor::Executor::run`] and is consumed
//! entirely inside the worker loop. [`StoreError`] is narrower still and
//! converts into `PoolError` at the façade.

use thiserror::Error;

use crate::jobs::job::JobId;

/// Result alias for fallible pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors surfaced to callers of the [`crate::jobs::pool::WorkerPool`] façade.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// The queue was at capacity when `Submit` attempted to offer the job.
    #[error("queue is at capacity")]
    Backpressure,

    /// No job exists with the given id.
    #[error("job {0} not found")]
    NotFound(JobId),

    /// A transition or operation was attempted from the wrong state.
    #[error("job {0} is in the wrong state for this operation")]
    BadState(JobId),

    /// The operation is invalid because the job already reached a terminal state.
    #[error("job {0} has already reached a terminal state")]
    Terminal(JobId),

    /// The pool is stopped or currently stopping.
    #[error("pool is shutting down")]
    Shutdown,
}

impl From<StoreError> for PoolError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => PoolError::NotFound(id),
            StoreError::BadState(id) => PoolError::BadState(id),
            StoreError::Terminal(id) => PoolError::Terminal(id),
            StoreError::Duplicate(id) => PoolError::BadState(id),
        }
    }
}

/// Errors returned by [`crate::jobs::store::JobStore`] operations.
///
/// Narrower than [`PoolError`]: the store knows nothing about queues,
/// backpressure, or shutdown, only about the shape of its own records.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {0} is not in the expected state")]
    BadState(JobId),

    #[error("job {0} has already reached a terminal state")]
    Terminal(JobId),

    #[error("job {0} already exists")]
    Duplicate(JobId),
}

/// Classification an [`crate::jobs::executor::Executor`] attaches to a
/// failed run, consumed entirely by the worker loop — never surfaced to
/// the façade caller directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorErrorKind {
    /// Transient failure; the worker should retry up to `max_attempts`.
    Retryable,
    /// Permanent failure; the job goes straight to `Failed`.
    Fatal,
    /// The executor stopped because its context was cancelled.
    Cancelled,
}

/// Configuration-level errors raised by [`crate::config::PoolConfig`].
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::sync::Arc<std::io::Error>,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
