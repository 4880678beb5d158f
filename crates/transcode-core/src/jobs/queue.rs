//! Bounded FIFO of job ids awaiting a worker.
//!
//! A `tokio::sync::mpsc` bounded channel gives the non-blocking `offer` /
//! cancellable blocking `take` pair almost for free: `try_send` is the
//! non-blocking `Offer`, and `recv` raced against a `CancellationToken`
//! (for pool shutdown) and the caller's own per-call token (for
//! cancelling an individual `take`) gives the three-way wait the design
//! calls for. `depth` is tracked by a side `AtomicUsize` since the
//! channel itself exposes no length.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::jobs::job::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    Full,
    Shutdown,
    Cancelled,
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Full => write!(f, "queue is at capacity"),
            QueueError::Shutdown => write!(f, "queue is shut down"),
            QueueError::Cancelled => write!(f, "take was cancelled"),
        }
    }
}

impl std::error::Error for QueueError {}

pub struct Queue {
    sender: mpsc::Sender<JobId>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<JobId>>,
    depth: AtomicUsize,
    shutdown: CancellationToken,
    capacity: usize,
}

impl Queue {
    /// `capacity` must be strictly positive; the recommended default is
    /// `10 * max_pool_size`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            depth: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Non-blocking enqueue. Fails with `Full` at capacity, `Shutdown` if
    /// the queue has already been shut down.
    pub fn offer(&self, id: JobId) -> Result<(), QueueError> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::Shutdown);
        }
        match self.sender.try_send(id) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(QueueError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(QueueError::Shutdown),
        }
    }

    /// Blocks until an id is available, shutdown is requested, or `cancel`
    /// fires — whichever comes first.
    pub async fn take(&self, cancel: &CancellationToken) -> Result<JobId, QueueError> {
        let mut receiver = self.receiver.lock().await;
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                match receiver.try_recv() {
                    Ok(id) => {
                        self.depth.fetch_sub(1, Ordering::SeqCst);
                        Ok(id)
                    }
                    Err(_) => Err(QueueError::Shutdown),
                }
            }
            _ = cancel.cancelled() => Err(QueueError::Cancelled),
            maybe_id = receiver.recv() => {
                match maybe_id {
                    Some(id) => {
                        self.depth.fetch_sub(1, Ordering::SeqCst);
                        Ok(id)
                    }
                    None => Err(QueueError::Shutdown),
                }
            }
        }
    }

    /// Advisory only; may race with concurrent `offer`/`take`.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Wake all blocked `take` callers with `Shutdown`; subsequent
    /// `offer` calls also fail with `Shutdown`. Ids already queued remain
    /// drainable by `take` until empty, consistent with letting in-flight
    /// work finish during `Stop(deadline)`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
