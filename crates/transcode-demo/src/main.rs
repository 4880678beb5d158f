//! Illustrative CLI driving the transcode-core worker pool.
//!
//! Submits a batch of simulated transcode jobs against a [`SimulatedExecutor`]
//! that sleeps in steps and reports progress, prints every lifecycle event
//! as it arrives, then waits for the batch to settle and requests a
//! graceful shutdown. There is no HTTP/RPC front door here — that front
//! door is explicitly out of scope for the core this binary demonstrates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::info;

use transcode_core::{
    ChannelEventSink, Executor, ExecutorErrorKind, JobId, JobState, PoolConfig, ProgressCallback,
    WorkerPool,
};

/// Run a batch of simulated transcode jobs through the worker pool.
#[derive(Parser, Debug)]
#[command(name = "transcode-demo")]
#[command(about = "Drives transcode-core's worker pool with a simulated executor")]
#[command(version)]
struct Cli {
    /// Number of jobs to submit
    #[arg(short = 'n', long, default_value_t = 20)]
    jobs: usize,

    /// Output profile to request for every job
    #[arg(short, long, default_value = "hls-720p")]
    profile: String,

    /// Fraction of jobs (0.0-1.0) that fail once before succeeding on retry
    #[arg(long, default_value_t = 0.2)]
    fail_rate: f64,

    /// Fraction of jobs (0.0-1.0) that fail on every attempt (exhausts retries)
    #[arg(long, default_value_t = 0.05)]
    always_fail_rate: f64,

    /// Minimum worker pool size
    #[arg(long, default_value_t = 2)]
    min_pool_size: usize,

    /// Maximum worker pool size
    #[arg(long, default_value_t = 8)]
    max_pool_size: usize,

    /// Per-job retry ceiling
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    /// Simulated per-step transcode duration, in milliseconds
    #[arg(long, default_value_t = 150)]
    step_millis: u64,

    /// Deadline given to Stop() once the batch has been submitted, in seconds
    #[arg(long, default_value_t = 30)]
    shutdown_grace_secs: u64,

    /// Log level passed to the tracing env-filter
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Optional TOML file to load pool config from; CLI flags above still
    /// override the worker/queue settings it contains
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

/// Sleeps through a handful of progress checkpoints, then succeeds or
/// fails according to an outcome tag suffixed onto `input_ref` at
/// submission time. A `#retry-once` job needs to remember it already
/// failed once, which means this executor — unlike a real codec
/// invocation — keeps a small per-job attempt counter across calls; the
/// `Executor` contract only requires that concurrent calls not corrupt
/// each other, which a `Mutex`-guarded map still satisfies.
struct SimulatedExecutor {
    step: Duration,
    attempt_counts: Mutex<HashMap<String, u32>>,
}

impl SimulatedExecutor {
    fn new(step: Duration) -> Self {
        Self {
            step,
            attempt_counts: Mutex::new(HashMap::new()),
        }
    }

    fn next_attempt(&self, input_ref: &str) -> u32 {
        let mut counts = self.attempt_counts.lock().unwrap_or_else(|p| p.into_inner());
        let count = counts.entry(input_ref.to_string()).or_insert(0);
        *count += 1;
        *count
    }
}

#[async_trait]
impl Executor for SimulatedExecutor {
    async fn run(
        &self,
        ctx: CancellationToken,
        input_ref: &str,
        _profile: &str,
        progress: ProgressCallback<'_>,
    ) -> Result<String, (ExecutorErrorKind, String)> {
        for pct in [10u8, 30, 55, 80, 100] {
            tokio::select! {
                _ = ctx.cancelled() => {
                    return Err((ExecutorErrorKind::Cancelled, "context cancelled".into()));
                }
                _ = tokio::time::sleep(self.step) => {}
            }
            if !progress(pct) {
                return Err((
                    ExecutorErrorKind::Cancelled,
                    "cancel observed via progress callback".into(),
                ));
            }
        }

        if input_ref.ends_with("#always-fail") {
            return Err((ExecutorErrorKind::Fatal, "simulated fatal failure".into()));
        }
        if input_ref.ends_with("#retry-once") && self.next_attempt(input_ref) == 1 {
            return Err((ExecutorErrorKind::Retryable, "simulated transient failure".into()));
        }
        Ok(format!("blob://output/{input_ref}"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&cli.log_level)
        .init();

    let mut config = match &cli.config {
        Some(path) => PoolConfig::load(path)?,
        None => PoolConfig::development(),
    };
    config.worker.min_pool_size = cli.min_pool_size;
    config.worker.max_pool_size = cli.max_pool_size.max(cli.min_pool_size);
    config.worker.max_attempts = cli.max_attempts;
    config.queue.capacity = (cli.jobs * 2).max(10);
    config.validate()?;

    let (event_sink, mut events) = ChannelEventSink::new(1024);
    let pool = WorkerPool::new(
        config,
        SimulatedExecutor::new(Duration::from_millis(cli.step_millis)),
        Arc::new(event_sink),
    );

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!(
                job_id = %event.job_id,
                attempt = event.attempt,
                event = ?event.event_type,
                progress = ?event.progress,
                error = ?event.error,
                "event"
            );
        }
    });

    let ids = submit_batch(&pool, &cli).await;
    info!(submitted = ids.len(), requested = cli.jobs, "batch submitted");

    wait_for_batch_to_settle(&pool, &ids).await;

    let mut completed = 0usize;
    let mut failed = 0usize;
    let mut cancelled = 0usize;
    for id in &ids {
        match pool.get(*id).map(|job| job.state) {
            Ok(JobState::Completed) => completed += 1,
            Ok(JobState::Failed) => failed += 1,
            Ok(JobState::Cancelled) => cancelled += 1,
            _ => {}
        }
    }
    info!(completed, failed, cancelled, total = ids.len(), "batch settled");

    pool.stop(Duration::from_secs(cli.shutdown_grace_secs)).await;
    printer.abort();

    Ok(())
}

/// Submits `cli.jobs` jobs, backing off briefly and retrying on
/// `Backpressure` rather than dropping the job — a real caller would
/// typically surface backpressure to its own client instead.
async fn submit_batch<E: Executor + 'static>(pool: &Arc<WorkerPool<E>>, cli: &Cli) -> Vec<JobId> {
    let mut ids = Vec::with_capacity(cli.jobs);
    let mut rng = rand::thread_rng();
    for i in 0..cli.jobs {
        let roll: f64 = rng.gen();
        let input_ref = if roll < cli.always_fail_rate {
            format!("blob://input/{i}#always-fail")
        } else if roll < cli.always_fail_rate + cli.fail_rate {
            format!("blob://input/{i}#retry-once")
        } else {
            format!("blob://input/{i}")
        };

        loop {
            match pool
                .submit(input_ref.clone(), cli.profile.clone(), 0, cli.max_attempts)
                .await
            {
                Ok(id) => {
                    ids.push(id);
                    break;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "submit rejected, backing off before retrying");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
    ids
}

async fn wait_for_batch_to_settle<E: Executor + 'static>(pool: &Arc<WorkerPool<E>>, ids: &[JobId]) {
    loop {
        let all_terminal = ids.iter().all(|id| {
            pool.get(*id)
                .map(|job| job.state.is_terminal())
                .unwrap_or(true)
        });
        if all_terminal {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
