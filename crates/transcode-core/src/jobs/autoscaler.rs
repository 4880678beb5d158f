//! Pool-sizing controller.
//!
//! Runs as its own `tokio::task`, sampling [`WorkerPool::status`] every
//! `tick_interval` and issuing `resize` calls. Holds no state the pool
//! doesn't already expose beyond its own cooldown timers and the rolling
//! idle-observation window `scale_down_observation` requires — scale-down
//! only fires once idle workers have stayed above the ratio for the whole
//! window, not on a single high-idle sample.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::info;

use crate::jobs::config::AutoscalerConfig;
use crate::jobs::executor::Executor;
use crate::jobs::pool::{PoolStatus, WorkerPool};

/// Tracks how long idle utilization has stayed above the scale-down
/// threshold without interruption. Reset the moment a sample falls below
/// it, so a brief burst of activity can't be hidden inside a stale
/// observation window.
struct IdleObservation {
    above_threshold_since: Option<Instant>,
}

impl IdleObservation {
    fn new() -> Self {
        Self {
            above_threshold_since: None,
        }
    }

    fn record(&mut self, above_threshold: bool) -> Option<Duration> {
        if !above_threshold {
            self.above_threshold_since = None;
            return None;
        }
        let since = *self.above_threshold_since.get_or_insert_with(Instant::now);
        Some(since.elapsed())
    }
}

/// Spawns the autoscaler loop and returns its `JoinHandle`. The loop exits
/// as soon as the pool's shutdown token is cancelled; the caller is not
/// required to await the handle, but `WorkerPool::stop` does so other
/// components don't outlive the pool they observe.
pub fn spawn_autoscaler<E: Executor + 'static>(pool: Arc<WorkerPool<E>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_autoscaler_loop(pool).await;
    })
}

async fn run_autoscaler_loop<E: Executor + 'static>(pool: Arc<WorkerPool<E>>) {
    let config = pool.config().autoscaler.clone();
    let shutdown = pool.shutdown_token();
    let mut idle_observation = IdleObservation::new();
    let mut last_scale_up: Option<Instant> = None;
    let mut last_scale_down: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("autoscaler exiting: pool is shutting down");
                return;
            }
            _ = tokio::time::sleep(config.tick_interval()) => {}
        }

        let status = pool.status();
        if let Some(target) = decide(
            &status,
            &config,
            &mut idle_observation,
            &mut last_scale_up,
            &mut last_scale_down,
        ) {
            info!(
                from = status.total_workers,
                to = target,
                queue_depth = status.queue_depth,
                idle = status.idle_workers,
                "autoscaler resizing pool"
            );
            pool.resize(target).await;
        }
    }
}

/// Pure decision function, kept free of the pool so it can be exercised
/// directly with synthetic `PoolStatus` samples in tests instead of
/// driving a real tick loop. Rules are checked in order; the first match
/// wins, matching spec.md's "checked in order" framing.
fn decide(
    status: &PoolStatus,
    config: &AutoscalerConfig,
    idle_observation: &mut IdleObservation,
    last_scale_up: &mut Option<Instant>,
    last_scale_down: &mut Option<Instant>,
) -> Option<usize> {
    let total = status.total_workers.max(1);

    let scale_up_cooldown_elapsed = last_scale_up
        .map(|at| at.elapsed() >= config.scale_up_cooldown())
        .unwrap_or(true);

    if (status.queue_depth as f64) > config.scale_up_threshold * total as f64
        && scale_up_cooldown_elapsed
    {
        let step = ((total as f64) * config.scale_up_step_ratio).ceil() as usize;
        let step = step.max(1);
        let target = status.total_workers.saturating_add(step);
        *last_scale_up = Some(Instant::now());
        idle_observation.record(false);
        return Some(target);
    }

    let idle_ratio_breached =
        (status.idle_workers as f64) > config.scale_down_idle_ratio * total as f64;
    let sustained = idle_observation.record(idle_ratio_breached);

    let scale_down_cooldown_elapsed = last_scale_down
        .map(|at| at.elapsed() >= config.scale_down_cooldown())
        .unwrap_or(true);

    if let Some(duration) = sustained {
        if duration >= config.scale_down_observation() && scale_down_cooldown_elapsed {
            let target = status.total_workers.saturating_sub(config.scale_down_step);
            *last_scale_down = Some(Instant::now());
            return Some(target);
        }
    }

    None
}
