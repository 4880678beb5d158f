//! Transcoding worker pool and job-dispatch core.
//!
//! The crate owns exactly the pieces described as in-scope by the system
//! it backs: a bounded, autoscaled pool of worker tasks that pull jobs off
//! a FIFO queue, drive a pluggable [`jobs::Executor`], mutate an
//! authoritative [`jobs::JobStore`], and fan lifecycle events out to a
//! pluggable [`jobs::EventSink`]. HTTP/RPC front doors, authentication,
//! the codec invocation itself, and persistent storage are all external
//! collaborators consumed through the narrow interfaces in [`jobs`].

pub mod error;
pub mod jobs;

pub use error::{ConfigError, ExecutorErrorKind, PoolError, Result, StoreError};
pub use jobs::{
    ChannelEventSink, Event, EventPublishError, EventSink, EventType, Executor, Job, JobId,
    JobQuery, JobState, LoggingEventSink, NullEventSink, PoolConfig, PoolStatus, ProgressCallback,
    Queue, QueueError, WorkerPool,
};

/// Current version of the transcode-core crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
