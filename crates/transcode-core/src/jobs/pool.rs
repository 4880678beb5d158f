//! Worker pool façade: the entry point upstream layers call.
//!
//! Owns job submission, pass-through reads to the [`JobStore`], and the
//! worker loop lifecycle. `max_pool_size` is enforced twice: `Resize`
//! changes how many worker *loops* exist (the soft target the autoscaler
//! tunes), while a counting [`Semaphore`] sized to `max_pool_size` is the
//! hard ceiling on concurrent executor invocations — a worker loop that
//! cannot get a permit simply waits, it does not count as "running".

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::PoolError;
use crate::jobs::autoscaler::spawn_autoscaler;
use crate::jobs::config::PoolConfig;
use crate::jobs::events::EventSink;
use crate::jobs::executor::Executor;
use crate::jobs::job::{Job, JobId, JobQuery, JobState};
use crate::jobs::queue::{Queue, QueueError};
use crate::jobs::store::JobStore;
use crate::jobs::worker::{run_worker_loop, WorkerShared};

/// Pool-wide aggregate, consumed by the autoscaler and exposed to any
/// owning service for observability.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub total_workers: usize,
    pub active_workers: usize,
    pub idle_workers: usize,
    pub queue_depth: usize,
    pub completed_last_interval: u64,
}

struct ThroughputSample {
    at: std::time::Instant,
}

pub(crate) struct ThroughputTracker {
    window: Duration,
    samples: std::sync::Mutex<Vec<ThroughputSample>>,
}

impl ThroughputTracker {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            samples: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn record_completion(&self) {
        let mut samples = self.samples.lock().unwrap_or_else(|p| p.into_inner());
        samples.push(ThroughputSample {
            at: std::time::Instant::now(),
        });
    }

    fn count_recent(&self) -> u64 {
        let window = self.window;
        let mut samples = self.samples.lock().unwrap_or_else(|p| p.into_inner());
        let cutoff = std::time::Instant::now() - window;
        samples.retain(|s| s.at >= cutoff);
        samples.len() as u64
    }
}

pub struct WorkerPool<E: Executor + 'static> {
    store: Arc<JobStore>,
    queue: Arc<Queue>,
    executor: Arc<E>,
    event_sink: Arc<dyn EventSink>,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
    retire_budget: Arc<AtomicUsize>,
    active_count: Arc<AtomicUsize>,
    last_activity_ms: Arc<AtomicI64>,
    throughput: Arc<ThroughputTracker>,
    handles: Mutex<HashMap<usize, JoinHandle<()>>>,
    next_worker_slot: AtomicUsize,
    target_size: AtomicUsize,
    autoscaler_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<E: Executor + 'static> WorkerPool<E> {
    pub fn new(config: PoolConfig, executor: E, event_sink: Arc<dyn EventSink>) -> Arc<Self> {
        let store = Arc::new(JobStore::new());
        let queue = Arc::new(Queue::new(config.queue.capacity));
        let semaphore = Arc::new(Semaphore::new(config.worker.max_pool_size));

        let pool = Arc::new(Self {
            store,
            queue,
            executor: Arc::new(executor),
            event_sink,
            config: config.clone(),
            semaphore,
            shutdown: CancellationToken::new(),
            retire_budget: Arc::new(AtomicUsize::new(0)),
            active_count: Arc::new(AtomicUsize::new(0)),
            last_activity_ms: Arc::new(AtomicI64::new(chrono::Utc::now().timestamp_millis())),
            throughput: Arc::new(ThroughputTracker::new(Duration::from_secs(60))),
            handles: Mutex::new(HashMap::new()),
            next_worker_slot: AtomicUsize::new(0),
            target_size: AtomicUsize::new(0),
            autoscaler_handle: std::sync::Mutex::new(None),
        });

        let pool_for_spawn = pool.clone();
        let initial_size = config.worker.min_pool_size;
        tokio::spawn(async move {
            pool_for_spawn.resize(initial_size).await;
        });

        let autoscaler_handle = spawn_autoscaler(pool.clone());
        *pool
            .autoscaler_handle
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(autoscaler_handle);

        pool
    }

    fn worker_shared(&self) -> Arc<WorkerShared<E>> {
        Arc::new(WorkerShared {
            store: self.store.clone(),
            queue: self.queue.clone(),
            executor: self.executor.clone(),
            event_sink: self.event_sink.clone(),
            semaphore: self.semaphore.clone(),
            shutdown: self.shutdown.clone(),
            worker_config: self.config.worker.clone(),
            retry_config: self.config.retry.clone(),
            event_config: self.config.event.clone(),
            retire_budget: self.retire_budget.clone(),
            active_count: self.active_count.clone(),
            last_activity_ms: self.last_activity_ms.clone(),
            throughput: self.throughput.clone(),
        })
    }

    /// Creates a Job record (state `Queued`) and offers it to the queue.
    /// On `ErrFull` the record is removed and `Backpressure` returned so
    /// no orphaned record survives a rejected submission.
    pub async fn submit(
        &self,
        input_ref: impl Into<String>,
        profile: impl Into<String>,
        priority: i32,
        max_attempts: u32,
    ) -> Result<JobId, PoolError> {
        if self.shutdown.is_cancelled() {
            return Err(PoolError::Shutdown);
        }

        let max_attempts = if max_attempts == 0 {
            self.config.worker.max_attempts
        } else {
            max_attempts
        };
        let job = Job::new(input_ref, profile, priority, max_attempts);
        let id = job.id;
        self.store.insert(job).map_err(PoolError::from)?;

        // Published before the id is offered to the queue: once offered, a
        // free worker can claim it and publish `JobStarted` immediately, and
        // that publish must never race ahead of this one. The rare cost is
        // that a `JobSubmitted` fires for a job the queue then rejects below.
        let event = crate::jobs::events::Event::new(
            crate::jobs::events::EventType::JobSubmitted,
            id,
            1,
        );
        if let Err(err) = self.event_sink.publish(event).await {
            tracing::warn!(error = %err, "event sink rejected JobSubmitted; continuing");
        }

        match self.queue.offer(id) {
            Ok(()) => Ok(id),
            Err(QueueError::Full) => {
                self.store.remove(id);
                Err(PoolError::Backpressure)
            }
            Err(QueueError::Shutdown) => {
                self.store.remove(id);
                Err(PoolError::Shutdown)
            }
            Err(QueueError::Cancelled) => unreachable!("offer() never returns Cancelled"),
        }
    }

    pub fn cancel(&self, id: JobId) -> Result<(), PoolError> {
        self.store.cancel_mark(id).map_err(PoolError::from)
    }

    pub fn get(&self, id: JobId) -> Result<Job, PoolError> {
        self.store.get(id).map_err(PoolError::from)
    }

    pub fn list(&self, filter: &JobQuery) -> Vec<Job> {
        self.store.list(filter)
    }

    /// Requests a target pool size, clamped to `[min_pool_size,
    /// max_pool_size]`. Growing spawns new worker loops immediately;
    /// shrinking adds to the retire budget so currently-running workers
    /// finish their job before exiting — no worker is ever pre-empted.
    pub async fn resize(&self, target: usize) {
        let target = target.clamp(self.config.worker.min_pool_size, self.config.worker.max_pool_size);
        let mut handles = self.handles.lock().await;
        let current = handles.len();

        if target > current {
            for _ in current..target {
                let slot = self.next_worker_slot.fetch_add(1, Ordering::SeqCst);
                let shared = self.worker_shared();
                let handle = tokio::spawn(run_worker_loop(shared));
                handles.insert(slot, handle);
            }
        } else if target < current {
            let to_retire = current - target;
            self.retire_budget.fetch_add(to_retire, Ordering::SeqCst);
        }

        self.target_size.store(target, Ordering::SeqCst);
        handles.retain(|_, h| !h.is_finished());
    }

    pub fn status(&self) -> PoolStatus {
        let active = self.active_count.load(Ordering::SeqCst);
        let total = self.target_size.load(Ordering::SeqCst).max(active);
        PoolStatus {
            total_workers: total,
            active_workers: active,
            idle_workers: total.saturating_sub(active),
            queue_depth: self.queue.depth(),
            completed_last_interval: self.throughput.count_recent(),
        }
    }

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Closes the queue, lets running jobs finish or hit `deadline`, then
    /// cancels anything still running and awaits every worker task.
    pub async fn stop(&self, deadline: Duration) {
        info!("pool stop requested, deadline={:?}", deadline);
        self.queue.shutdown();

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().await;
            guard.drain().map(|(_, h)| h).collect()
        };

        let all_done = futures_join_all(handles, deadline).await;

        if !all_done {
            self.shutdown.cancel();
            for job in self.store.list(&JobQuery::new()) {
                if !job.state.is_terminal() {
                    let reason = "shutdown-timeout".to_string();
                    let _ = self.store.transition(
                        job.id,
                        job.state,
                        Box::new(move |j| {
                            j.state = JobState::Cancelled;
                            j.last_error = Some(reason);
                            j.ended_at = Some(chrono::Utc::now());
                        }),
                    );
                }
            }
        }

        // Every worker has either finished or been force-marked above;
        // cancel unconditionally so the autoscaler loop (which only
        // watches this token, not the queue's own shutdown flag) exits.
        self.shutdown.cancel();
        if let Some(handle) = self
            .autoscaler_handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

/// Awaits every handle up to `deadline`; returns whether all finished in
/// time. Kept as a free function (not a trait bound on `JoinHandle`) to
/// avoid pulling in `futures` for a single join-all.
async fn futures_join_all(handles: Vec<JoinHandle<()>>, deadline: Duration) -> bool {
    let joined = tokio::time::timeout(deadline, async move {
        for handle in handles {
            let _ = handle.await;
        }
    })
    .await;
    joined.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::events::NullEventSink;
    use crate::jobs::executor::test_support::ScriptedExecutor;

    #[tokio::test]
    async fn submit_then_get_returns_queued_job() {
        let mut config = PoolConfig::development();
        config.worker.min_pool_size = 0;
        config.worker.max_pool_size = 1;
        let pool = WorkerPool::new(
            config,
            ScriptedExecutor {
                progress_sequence: vec![100],
                output: "o".into(),
            },
            Arc::new(NullEventSink),
        );

        let id = pool.submit("in", "p", 0, 1).await.unwrap();
        let job = pool.get(id).unwrap();
        assert_eq!(job.state, JobState::Queued);
    }

    #[tokio::test]
    async fn backpressure_rejects_without_creating_a_record() {
        let mut config = PoolConfig::development();
        config.worker.min_pool_size = 0;
        config.worker.max_pool_size = 1;
        config.queue.capacity = 1;
        let pool = WorkerPool::new(
            config,
            ScriptedExecutor {
                progress_sequence: vec![],
                output: "o".into(),
            },
            Arc::new(NullEventSink),
        );

        let first = pool.submit("in", "p", 0, 1).await.unwrap();
        let second = pool.submit("in2", "p", 0, 1).await;
        assert!(matches!(second, Err(PoolError::Backpressure)));
        assert!(pool.get(first).is_ok());
        assert_eq!(pool.list(&JobQuery::new()).len(), 1);
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_not_found() {
        let config = PoolConfig::development();
        let pool = WorkerPool::new(
            config,
            ScriptedExecutor {
                progress_sequence: vec![],
                output: "o".into(),
            },
            Arc::new(NullEventSink),
        );
        let result = pool.cancel(JobId::new_v4());
        assert!(matches!(result, Err(PoolError::NotFound(_))));
    }
}
