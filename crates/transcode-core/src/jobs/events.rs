//! Lifecycle event fan-out.
//!
//! Delivery is at-least-once: a worker that fails to publish an event
//! logs and continues rather than blocking job-state progression on the
//! sink. Consumers must be idempotent on job id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::jobs::job::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    JobSubmitted,
    JobStarted,
    JobProgress,
    JobRetry,
    JobCompleted,
    JobFailed,
    JobCancelled,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub job_id: JobId,
    pub timestamp: DateTime<Utc>,
    pub attempt: u32,
    pub progress: Option<u8>,
    pub error: Option<String>,
    pub output_ref: Option<String>,
}

impl Event {
    pub fn new(event_type: EventType, job_id: JobId, attempt: u32) -> Self {
        Self {
            event_type,
            job_id,
            timestamp: Utc::now(),
            attempt,
            progress: None,
            error: None,
            output_ref: None,
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_output_ref(mut self, output_ref: impl Into<String>) -> Self {
        self.output_ref = Some(output_ref.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventPublishError;

impl std::fmt::Display for EventPublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "event sink rejected the event")
    }
}

impl std::error::Error for EventPublishError {}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: Event) -> Result<(), EventPublishError>;
}

/// Drops every event. The zero-cost default when nobody is listening.
pub struct NullEventSink;

#[async_trait]
impl EventSink for NullEventSink {
    async fn publish(&self, _event: Event) -> Result<(), EventPublishError> {
        Ok(())
    }
}

/// Forwards to a bounded channel; useful for tests and for bridging into
/// an owning service's own event bus. A full channel is treated as sink
/// backpressure and reported as a publish error, matching at-least-once
/// semantics (the caller may retry).
pub struct ChannelEventSink {
    sender: mpsc::Sender<Event>,
}

impl ChannelEventSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn publish(&self, event: Event) -> Result<(), EventPublishError> {
        self.sender.try_send(event).map_err(|_| EventPublishError)
    }
}

/// Logs every event at `info` (or `warn` for terminal failure/cancel),
/// the default for the demo binary.
pub struct LoggingEventSink;

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn publish(&self, event: Event) -> Result<(), EventPublishError> {
        match event.event_type {
            EventType::JobFailed => tracing::warn!(
                job_id = %event.job_id,
                attempt = event.attempt,
                error = ?event.error,
                "job failed"
            ),
            EventType::JobCancelled => tracing::warn!(
                job_id = %event.job_id,
                attempt = event.attempt,
                "job cancelled"
            ),
            _ => tracing::info!(
                job_id = %event.job_id,
                attempt = event.attempt,
                event = ?event.event_type,
                progress = ?event.progress,
                "job event"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_sink_always_succeeds() {
        let sink = NullEventSink;
        let event = Event::new(EventType::JobSubmitted, JobId::new_v4(), 1);
        assert!(sink.publish(event).await.is_ok());
    }

    #[tokio::test]
    async fn channel_sink_forwards_events() {
        let (sink, mut rx) = ChannelEventSink::new(4);
        let job_id = JobId::new_v4();
        sink.publish(Event::new(EventType::JobStarted, job_id, 1))
            .await
            .unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.job_id, job_id);
        assert_eq!(received.event_type, EventType::JobStarted);
    }

    #[tokio::test]
    async fn channel_sink_reports_backpressure_as_error() {
        let (sink, _rx) = ChannelEventSink::new(1);
        let job_id = JobId::new_v4();
        sink.publish(Event::new(EventType::JobStarted, job_id, 1))
            .await
            .unwrap();
        let err = sink
            .publish(Event::new(EventType::JobProgress, job_id, 1))
            .await;
        assert!(err.is_err());
    }
}
