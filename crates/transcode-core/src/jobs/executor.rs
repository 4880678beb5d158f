//! The pluggable capability that actually performs a transcode.
//!
//! `Executor` is the one component the core treats as an external
//! collaborator: it knows nothing about codecs, only that it is handed an
//! input reference and a profile and must produce an output reference or
//! fail with a classified error.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ExecutorErrorKind;

/// Progress callback handed to the executor by the worker loop.
///
/// Implementations of [`Executor::run`] should call this zero or more
/// times during `run`, with the percentage complete so far. The callback
/// clamps its input to `[0, 100]`, forwards it to the job store, and
/// returns `false` once the job's cancel flag has been observed —
/// executors must treat `false` as "stop as soon as feasible".
pub type ProgressCallback<'a> = Box<dyn Fn(u8) -> bool + Send + Sync + 'a>;

/// One attempt at turning `input_ref` + `profile` into an output.
///
/// Each call is independent; no state is shared across calls, so a single
/// `Executor` instance must be safe to invoke concurrently from multiple
/// worker tasks. An executor that cannot satisfy this should be paired
/// with a pool configured with `max_pool_size = 1`.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(
        &self,
        ctx: CancellationToken,
        input_ref: &str,
        profile: &str,
        progress: ProgressCallback<'_>,
    ) -> Result<String, (ExecutorErrorKind, String)>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Succeeds after reporting a fixed progress sequence.
    pub struct ScriptedExecutor {
        pub progress_sequence: Vec<u8>,
        pub output: String,
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        async fn run(
            &self,
            ctx: CancellationToken,
            _input_ref: &str,
            _profile: &str,
            progress: ProgressCallback<'_>,
        ) -> Result<String, (ExecutorErrorKind, String)> {
            for pct in &self.progress_sequence {
                if ctx.is_cancelled() || !progress(*pct) {
                    return Err((ExecutorErrorKind::Cancelled, "cancelled".into()));
                }
            }
            Ok(self.output.clone())
        }
    }

    /// Fails `fail_attempts` times with `Retryable`, then succeeds.
    pub struct FlakyExecutor {
        pub fail_attempts: u32,
        attempts_seen: Arc<AtomicU32>,
    }

    impl FlakyExecutor {
        pub fn new(fail_attempts: u32) -> Self {
            Self {
                fail_attempts,
                attempts_seen: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    #[async_trait]
    impl Executor for FlakyExecutor {
        async fn run(
            &self,
            _ctx: CancellationToken,
            _input_ref: &str,
            _profile: &str,
            _progress: ProgressCallback<'_>,
        ) -> Result<String, (ExecutorErrorKind, String)> {
            let attempt = self.attempts_seen.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.fail_attempts {
                Err((ExecutorErrorKind::Retryable, "transient".into()))
            } else {
                Ok("output://done".into())
            }
        }
    }

    /// Always fails fatally.
    pub struct AlwaysFatalExecutor;

    #[async_trait]
    impl Executor for AlwaysFatalExecutor {
        async fn run(
            &self,
            _ctx: CancellationToken,
            _input_ref: &str,
            _profile: &str,
            _progress: ProgressCallback<'_>,
        ) -> Result<String, (ExecutorErrorKind, String)> {
            Err((ExecutorErrorKind::Fatal, "bad input".into()))
        }
    }

    /// Runs until its context is cancelled, never calling back.
    pub struct LongRunningExecutor {
        pub step: std::time::Duration,
    }

    #[async_trait]
    impl Executor for LongRunningExecutor {
        async fn run(
            &self,
            ctx: CancellationToken,
            _input_ref: &str,
            _profile: &str,
            _progress: ProgressCallback<'_>,
        ) -> Result<String, (ExecutorErrorKind, String)> {
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        return Err((ExecutorErrorKind::Cancelled, "cancelled".into()));
                    }
                    _ = tokio::time::sleep(self.step) => {}
                }
            }
        }
    }
}
