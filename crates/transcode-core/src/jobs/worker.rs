//! Per-job worker loop.
//!
//! Each worker is its own `tokio::task`: claim an id from the queue, drive
//! it through `Running`, invoke the executor, and land it in a terminal
//! state (or back onto the queue for a retry). The worker never touches
//! another job's record and never stores a reference to one beyond the
//! loop iteration that owns it.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ExecutorErrorKind;
use crate::jobs::config::{EventConfig, RetryConfig, WorkerConfig};
use crate::jobs::events::{Event, EventSink, EventType};
use crate::jobs::executor::Executor;
use crate::jobs::job::{JobId, JobState};
use crate::jobs::pool::ThroughputTracker;
use crate::jobs::queue::{Queue, QueueError};
use crate::jobs::retry::{ExponentialBackoff, RetryAttempt};
use crate::jobs::store::JobStore;

/// Per-pool shared state a worker loop needs that isn't its own.
pub struct WorkerShared<E: Executor> {
    pub store: Arc<JobStore>,
    pub queue: Arc<Queue>,
    pub executor: Arc<E>,
    pub event_sink: Arc<dyn EventSink>,
    pub semaphore: Arc<Semaphore>,
    pub shutdown: CancellationToken,
    pub worker_config: WorkerConfig,
    pub retry_config: RetryConfig,
    pub event_config: EventConfig,
    pub retire_budget: Arc<AtomicUsize>,
    pub active_count: Arc<AtomicUsize>,
    pub last_activity_ms: Arc<AtomicI64>,
    pub throughput: Arc<ThroughputTracker>,
}

/// Runs until the queue reports shutdown or this worker's retire budget
/// is spent. Returns normally in both cases; the pool awaits the task's
/// `JoinHandle` to implement `Stop`.
pub async fn run_worker_loop<E: Executor + 'static>(shared: Arc<WorkerShared<E>>) {
    loop {
        if consume_retire_budget(&shared.retire_budget) {
            info!("worker retiring: scale-down budget consumed");
            return;
        }

        let id = match shared.queue.take(&shared.shutdown).await {
            Ok(id) => id,
            Err(QueueError::Shutdown) => {
                info!("worker exiting: queue shut down");
                return;
            }
            Err(QueueError::Cancelled) => continue,
            Err(QueueError::Full) => unreachable!("take() never returns Full"),
        };

        process_one(&shared, id).await;
    }
}

fn consume_retire_budget(budget: &AtomicUsize) -> bool {
    loop {
        let current = budget.load(Ordering::SeqCst);
        if current == 0 {
            return false;
        }
        if budget
            .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return true;
        }
    }
}

async fn process_one<E: Executor + 'static>(shared: &Arc<WorkerShared<E>>, id: JobId) {
    // The cancel flag is read inside the same mutate_fn that would
    // otherwise claim the job, under the record's own lock, so a `Cancel`
    // racing this claim can never be missed and the job can never be
    // driven into `Running` once it has been marked: either this sees the
    // flag and takes the job straight to `Cancelled`, or `Cancel` hasn't
    // set it yet and normal claiming proceeds.
    let claim = shared.store.transition(
        id,
        JobState::Queued,
        Box::new(|job| {
            if job.cancel_requested {
                job.state = JobState::Cancelled;
                job.ended_at = Some(chrono::Utc::now());
            } else {
                job.state = JobState::Running;
                job.started_at.get_or_insert_with(chrono::Utc::now);
            }
        }),
    );

    let job = match claim {
        Ok(job) if job.state == JobState::Cancelled => {
            publish_terminal(shared, Event::new(EventType::JobCancelled, id, job.attempts)).await;
            return;
        }
        Ok(job) => job,
        Err(_) => {
            // The job left `Queued` through some other path (e.g. a
            // forced shutdown cancellation) before this worker could
            // claim it; that path is responsible for its own event.
            return;
        }
    };

    shared.active_count.fetch_add(1, Ordering::SeqCst);
    shared
        .last_activity_ms
        .store(now_ms(), Ordering::SeqCst);
    publish(
        shared,
        Event::new(EventType::JobStarted, id, job.attempts),
    )
    .await;

    let exec_ctx = CancellationToken::new();
    let cancel_watcher = spawn_cancel_watcher(shared.clone(), id, exec_ctx.clone());

    let permit = shared
        .semaphore
        .clone()
        .acquire_owned()
        .await
        .expect("pool semaphore is never closed while workers run");

    let store = shared.store.clone();
    let job_id = id;
    let progress_config = shared.worker_config.progress_min_interval();
    let last_event = Arc::new(std::sync::Mutex::new(std::time::Instant::now() - progress_config));
    let attempt = job.attempts;
    let last_event_for_cb = last_event.clone();

    // Progress events are pushed onto this channel in call order (the
    // callback's `send` is synchronous, never `.await`s) and drained by a
    // single task that publishes them one at a time, so they can never be
    // reordered relative to each other or to the terminal event published
    // after `progress_drain` below is awaited to completion.
    let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel::<Event>();
    let drain_sink = shared.event_sink.clone();
    let progress_drain = tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            if let Err(err) = drain_sink.publish(event).await {
                warn!(error = %err, "event sink rejected event; continuing");
            }
        }
    });

    let progress_cb: crate::jobs::executor::ProgressCallback<'_> = Box::new(move |percent| {
        let percent = percent.min(100);
        let _ = store.update_progress(job_id, percent);
        let cancelled = store.is_cancel_requested(job_id);

        let mut last = last_event_for_cb.lock().unwrap_or_else(|p| p.into_inner());
        if last.elapsed() >= progress_config {
            *last = std::time::Instant::now();
            let event = Event::new(EventType::JobProgress, job_id, attempt).with_progress(percent);
            let _ = progress_tx.send(event);
        }

        !cancelled
    });

    let run_result = shared
        .executor
        .run(exec_ctx.clone(), &job.input_ref, &job.profile, progress_cb)
        .await;
    // `progress_cb` (and the sender it owns) was consumed by `run`, so the
    // channel is already closed; awaiting the drain task guarantees every
    // progress event queued during this attempt is published before the
    // terminal event below.
    let _ = progress_drain.await;
    drop(permit);
    cancel_watcher.abort();
    shared.active_count.fetch_sub(1, Ordering::SeqCst);
    shared
        .last_activity_ms
        .store(now_ms(), Ordering::SeqCst);

    match run_result {
        Ok(output_ref) => {
            let updated = shared.store.transition(
                id,
                JobState::Running,
                Box::new(move |job| {
                    job.state = JobState::Completed;
                    job.output_ref = Some(output_ref);
                    job.progress = 100;
                    job.ended_at = Some(chrono::Utc::now());
                }),
            );
            if updated.is_ok() {
                shared.throughput.record_completion();
                publish_terminal(
                    shared,
                    Event::new(EventType::JobCompleted, id, attempt)
                        .with_progress(100)
                        .with_output_ref(updated.unwrap().output_ref.unwrap_or_default()),
                )
                .await;
            }
        }
        Err((ExecutorErrorKind::Cancelled, reason)) => {
            let _ = shared.store.transition(
                id,
                JobState::Running,
                Box::new(move |job| {
                    job.state = JobState::Cancelled;
                    job.last_error = Some(reason.clone());
                    job.ended_at = Some(chrono::Utc::now());
                }),
            );
            publish_terminal(shared, Event::new(EventType::JobCancelled, id, attempt)).await;
        }
        Err((ExecutorErrorKind::Fatal, reason)) => {
            fail_terminally(shared, id, attempt, reason).await;
        }
        Err((ExecutorErrorKind::Retryable, reason)) => {
            handle_retryable(shared, id, attempt, reason).await;
        }
    }
}

async fn handle_retryable<E: Executor + 'static>(
    shared: &Arc<WorkerShared<E>>,
    id: JobId,
    attempt: u32,
    reason: String,
) {
    let current = match shared.store.get(id) {
        Ok(job) => job,
        Err(_) => return,
    };

    if !current.can_retry() {
        fail_terminally(shared, id, attempt, reason).await;
        return;
    }

    let backoff = ExponentialBackoff::new(
        shared.retry_config.base_backoff(),
        shared.retry_config.max_backoff(),
    );
    let delay = backoff.calculate_delay(current.attempts);

    let reason_clone = reason.clone();
    let history_reason = reason.clone();
    let retried = shared.store.transition(
        id,
        JobState::Running,
        Box::new(move |job| {
            job.state = JobState::Queued;
            job.attempts += 1;
            job.last_error = Some(reason_clone);
            job.progress = 0;
            job.retry_history
                .add_attempt(RetryAttempt::new(attempt, history_reason, delay));
        }),
    );
    let retried = match retried {
        Ok(job) => job,
        Err(_) => return,
    };

    publish(shared, Event::new(EventType::JobRetry, id, retried.attempts)).await;

    let cancel_or_shutdown = tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shared.shutdown.cancelled() => true,
        _ = wait_for_job_cancel(shared, id) => true,
    };

    if cancel_or_shutdown {
        let _ = shared.store.transition(
            id,
            JobState::Queued,
            Box::new(|job| {
                job.state = JobState::Cancelled;
                job.last_error = Some("shutdown-timeout".into());
                job.ended_at = Some(chrono::Utc::now());
            }),
        );
        publish_terminal(
            shared,
            Event::new(EventType::JobCancelled, id, retried.attempts),
        )
        .await;
        return;
    }

    reoffer_with_backoff(shared, id, retried.attempts, backoff).await;
}

/// Hard cap on re-offer attempts once a retried job's slot in the queue is
/// full; after this many failed offers the job downgrades to `Failed`.
const REOFFER_RETRY_LIMIT: u32 = 5;

/// Re-offers a retried job to the queue, retrying with bounded backoff
/// while it reports `Full` (spec.md §4.3.2 step 7) rather than downgrading
/// to `Failed` on the first rejection.
async fn reoffer_with_backoff<E: Executor + 'static>(
    shared: &Arc<WorkerShared<E>>,
    id: JobId,
    attempts: u32,
    backoff: ExponentialBackoff,
) {
    for offer_attempt in 1..=REOFFER_RETRY_LIMIT {
        match shared.queue.offer(id) {
            Ok(()) => return,
            Err(QueueError::Shutdown) => {
                let _ = shared.store.transition(
                    id,
                    JobState::Queued,
                    Box::new(|job| {
                        job.state = JobState::Cancelled;
                        job.last_error = Some("shutdown-timeout".into());
                        job.ended_at = Some(chrono::Utc::now());
                    }),
                );
                publish_terminal(shared, Event::new(EventType::JobCancelled, id, attempts)).await;
                return;
            }
            Err(QueueError::Full) if offer_attempt < REOFFER_RETRY_LIMIT => {
                let delay = backoff.calculate_delay(offer_attempt);
                let cancel_or_shutdown = tokio::select! {
                    _ = tokio::time::sleep(delay) => false,
                    _ = shared.shutdown.cancelled() => true,
                    _ = wait_for_job_cancel(shared, id) => true,
                };
                if cancel_or_shutdown {
                    let _ = shared.store.transition(
                        id,
                        JobState::Queued,
                        Box::new(|job| {
                            job.state = JobState::Cancelled;
                            job.last_error = Some("shutdown-timeout".into());
                            job.ended_at = Some(chrono::Utc::now());
                        }),
                    );
                    publish_terminal(shared, Event::new(EventType::JobCancelled, id, attempts))
                        .await;
                    return;
                }
            }
            Err(QueueError::Full) => {
                fail_terminally(
                    shared,
                    id,
                    attempts,
                    "queue full after exhausting re-offer retries".into(),
                )
                .await;
                return;
            }
            Err(QueueError::Cancelled) => unreachable!("offer() never returns Cancelled"),
        }
    }
}

async fn wait_for_job_cancel<E: Executor + 'static>(shared: &Arc<WorkerShared<E>>, id: JobId) {
    loop {
        if shared.store.is_cancel_requested(id) {
            return;
        }
        tokio::time::sleep(shared.worker_config.cancel_poll_interval()).await;
    }
}

async fn fail_terminally<E: Executor + 'static>(
    shared: &Arc<WorkerShared<E>>,
    id: JobId,
    attempt: u32,
    reason: String,
) {
    let current_state = shared
        .store
        .get(id)
        .map(|j| j.state)
        .unwrap_or(JobState::Running);
    if current_state.is_terminal() {
        return;
    }
    let reason_clone = reason.clone();
    let result = shared.store.transition(
        id,
        current_state,
        Box::new(move |job| {
            job.state = JobState::Failed;
            job.last_error = Some(reason_clone);
            job.ended_at = Some(chrono::Utc::now());
        }),
    );
    if result.is_ok() {
        publish_terminal(
            shared,
            Event::new(EventType::JobFailed, id, attempt).with_error(reason),
        )
        .await;
    }
}

/// Polls the store's cancel flag and the pool shutdown token out-of-band,
/// cancelling `exec_ctx` if either fires — covers executors that don't
/// frequently call the progress callback.
fn spawn_cancel_watcher<E: Executor + 'static>(
    shared: Arc<WorkerShared<E>>,
    id: JobId,
    exec_ctx: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = shared.worker_config.cancel_poll_interval();
        loop {
            if exec_ctx.is_cancelled() {
                return;
            }
            if shared.shutdown.is_cancelled() || shared.store.is_cancel_requested(id) {
                exec_ctx.cancel();
                return;
            }
            tokio::time::sleep(interval).await;
        }
    })
}

async fn publish<E: Executor>(shared: &Arc<WorkerShared<E>>, event: Event) {
    if let Err(err) = shared.event_sink.publish(event).await {
        warn!(error = %err, "event sink rejected event; continuing");
    }
}

/// Terminal lifecycle events (`JobCompleted`/`JobFailed`/`JobCancelled`) get
/// a bounded number of retries with backoff before being dropped — losing
/// one of these is more costly to downstream consumers than losing an
/// intermediate progress tick, which `publish` lets go on the first failure.
async fn publish_terminal<E: Executor>(shared: &Arc<WorkerShared<E>>, event: Event) {
    let max_retries = shared.event_config.terminal_publish_retries;
    let mut delay = Duration::from_millis(100);

    for attempt in 0..=max_retries {
        match shared.event_sink.publish(event.clone()).await {
            Ok(()) => return,
            Err(err) if attempt < max_retries => {
                warn!(error = %err, attempt, "terminal event publish failed; retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(2));
            }
            Err(err) => {
                warn!(error = %err, attempt, "terminal event publish failed; giving up");
            }
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::events::NullEventSink;
    use crate::jobs::executor::test_support::{FlakyExecutor, ScriptedExecutor};
    use crate::jobs::job::Job;

    fn shared_with<E: Executor + 'static>(executor: E) -> (Arc<WorkerShared<E>>, Arc<JobStore>, Arc<Queue>) {
        let store = Arc::new(JobStore::new());
        let queue = Arc::new(Queue::new(16));
        let shared = Arc::new(WorkerShared {
            store: store.clone(),
            queue: queue.clone(),
            executor: Arc::new(executor),
            event_sink: Arc::new(NullEventSink),
            semaphore: Arc::new(Semaphore::new(4)),
            shutdown: CancellationToken::new(),
            worker_config: WorkerConfig {
                cancel_poll_interval_ms: 20,
                ..Default::default()
            },
            retry_config: RetryConfig {
                base_backoff_secs: 0,
                max_backoff_secs: 0,
                ..Default::default()
            },
            event_config: EventConfig::default(),
            retire_budget: Arc::new(AtomicUsize::new(0)),
            active_count: Arc::new(AtomicUsize::new(0)),
            last_activity_ms: Arc::new(AtomicI64::new(now_ms())),
            throughput: Arc::new(ThroughputTracker::new(Duration::from_secs(60))),
        });
        (shared, store, queue)
    }

    #[tokio::test]
    async fn happy_path_completes_job() {
        let (shared, store, queue) = shared_with(ScriptedExecutor {
            progress_sequence: vec![25, 50, 75, 100],
            output: "output://a".into(),
        });

        let job = Job::new("in", "p", 0, 1);
        let id = job.id;
        store.insert(job).unwrap();
        queue.offer(id).unwrap();

        process_one(&shared, id).await;

        let final_job = store.get(id).unwrap();
        assert_eq!(final_job.state, JobState::Completed);
        assert_eq!(final_job.progress, 100);
        assert_eq!(final_job.output_ref.as_deref(), Some("output://a"));
    }

    #[tokio::test]
    async fn retryable_failure_requeues_then_succeeds() {
        let (shared, store, queue) = shared_with(FlakyExecutor::new(1));
        let job = Job::new("in", "p", 0, 3);
        let id = job.id;
        store.insert(job).unwrap();
        queue.offer(id).unwrap();

        let claimed = queue.take(&shared.shutdown).await.unwrap();
        process_one(&shared, claimed).await;

        let after_retry = store.get(id).unwrap();
        assert_eq!(after_retry.state, JobState::Queued);
        assert_eq!(after_retry.attempts, 2);

        let claimed2 = queue.take(&shared.shutdown).await.unwrap();
        process_one(&shared, claimed2).await;

        let final_job = store.get(id).unwrap();
        assert_eq!(final_job.state, JobState::Completed);
        assert_eq!(final_job.attempts, 2);
    }

    #[tokio::test]
    async fn retry_exhaustion_fails_terminally() {
        let (shared, store, queue) = shared_with(FlakyExecutor::new(10));
        let job = Job::new("in", "p", 0, 2);
        let id = job.id;
        store.insert(job).unwrap();
        queue.offer(id).unwrap();

        let claimed = queue.take(&shared.shutdown).await.unwrap();
        process_one(&shared, claimed).await;
        let after_retry = store.get(id).unwrap();
        assert_eq!(after_retry.state, JobState::Queued);

        let claimed2 = queue.take(&shared.shutdown).await.unwrap();
        process_one(&shared, claimed2).await;

        let final_job = store.get(id).unwrap();
        assert_eq!(final_job.state, JobState::Failed);
        assert_eq!(final_job.attempts, 2);
        assert!(final_job.last_error.is_some());
    }

    #[tokio::test]
    async fn cancel_before_pickup_short_circuits_to_cancelled() {
        let (shared, store, queue) = shared_with(ScriptedExecutor {
            progress_sequence: vec![],
            output: "x".into(),
        });
        let job = Job::new("in", "p", 0, 1);
        let id = job.id;
        store.insert(job).unwrap();
        queue.offer(id).unwrap();

        // Mark cancellation the real way — the flag only, no transition —
        // same as `WorkerPool::cancel` does against a job still sitting in
        // the queue.
        store.cancel_mark(id).unwrap();

        process_one(&shared, id).await;
        let final_job = store.get(id).unwrap();
        assert_eq!(final_job.state, JobState::Cancelled);
        assert_eq!(final_job.attempts, 1);
        assert!(final_job.started_at.is_none());
    }

    /// Always rejects, so every call to `publish_terminal` exhausts its
    /// retry budget; counts how many attempts it actually saw.
    struct CountingFailingSink {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl crate::jobs::events::EventSink for CountingFailingSink {
        async fn publish(
            &self,
            _event: Event,
        ) -> Result<(), crate::jobs::events::EventPublishError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(crate::jobs::events::EventPublishError)
        }
    }

    #[tokio::test]
    async fn terminal_publish_retries_bounded_number_of_times_then_gives_up() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let sink: Arc<dyn crate::jobs::events::EventSink> = Arc::new(CountingFailingSink {
            attempts: attempts.clone(),
        });

        let shared = Arc::new(WorkerShared {
            store: Arc::new(JobStore::new()),
            queue: Arc::new(Queue::new(4)),
            executor: Arc::new(ScriptedExecutor {
                progress_sequence: vec![],
                output: "x".into(),
            }),
            event_sink: sink,
            semaphore: Arc::new(Semaphore::new(1)),
            shutdown: CancellationToken::new(),
            worker_config: WorkerConfig::default(),
            retry_config: RetryConfig::default(),
            event_config: EventConfig {
                terminal_publish_retries: 2,
            },
            retire_budget: Arc::new(AtomicUsize::new(0)),
            active_count: Arc::new(AtomicUsize::new(0)),
            last_activity_ms: Arc::new(AtomicI64::new(now_ms())),
            throughput: Arc::new(ThroughputTracker::new(Duration::from_secs(60))),
        });

        publish_terminal(&shared, Event::new(EventType::JobCompleted, JobId::new_v4(), 1)).await;

        // One initial attempt plus `terminal_publish_retries` retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
