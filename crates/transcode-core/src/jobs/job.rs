//! Job record types and the per-job state machine.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::retry::RetryHistory;

/// Unique job identifier.
pub type JobId = Uuid;

/// Lifecycle state of a job. `Completed`, `Failed`, and `Cancelled` are
/// terminal — no outgoing transitions exist from them.
///
/// Allowed transitions: `Queued -> Running`, `Queued -> Cancelled`,
/// `Running -> Completed`, `Running -> Failed`, `Running -> Cancelled`,
/// `Running -> Queued` (retry). Anything else is a programming error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl Default for JobState {
    fn default() -> Self {
        JobState::Queued
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl JobState {
    /// No outgoing transitions exist from a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether `to` is a legal transition target from `self`.
    pub fn can_transition_to(&self, to: JobState) -> bool {
        matches!(
            (self, to),
            (JobState::Queued, JobState::Running)
                | (JobState::Queued, JobState::Cancelled)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
                | (JobState::Running, JobState::Cancelled)
                | (JobState::Running, JobState::Queued)
        )
    }
}

/// One transcoding request and everything known about its progress.
///
/// See the module invariants enforced by [`crate::jobs::store::JobStore::transition`]:
/// `output_ref` is set iff `state == Completed`; `last_error` is set iff the
/// most recent attempt failed; `started_at`/`ended_at` are each set exactly
/// once; `attempts <= max_attempts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub input_ref: String,
    pub profile: String,
    pub priority: i32,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub state: JobState,
    pub progress: u8,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub output_ref: Option<String>,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,

    /// Every retry offered so far, in order; appended to by
    /// [`crate::jobs::worker`] each time a retryable failure requeues the
    /// job. Empty for a job that has never failed.
    #[serde(default)]
    pub retry_history: RetryHistory,

    /// Best-effort cancellation flag, observed by the worker owning this
    /// job and by the progress callback it hands the executor. Mutation
    /// goes through [`crate::jobs::store::JobStore::cancel_mark`], never
    /// set directly.
    #[serde(skip)]
    pub cancel_requested: bool,
}

impl Job {
    pub fn new(
        input_ref: impl Into<String>,
        profile: impl Into<String>,
        priority: i32,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            input_ref: input_ref.into(),
            profile: profile.into(),
            priority,
            submitted_at: Utc::now(),
            started_at: None,
            ended_at: None,
            state: JobState::Queued,
            progress: 0,
            attempts: 1,
            max_attempts: max_attempts.max(1),
            last_error: None,
            output_ref: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
            retry_history: RetryHistory::new(),
            cancel_requested: false,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Filter used by [`crate::jobs::store::JobStore::list`] /
/// [`crate::jobs::pool::WorkerPool::list`]; every `Some`/non-empty field
/// narrows the result, `tags` requires all listed tags to be present.
#[derive(Debug, Default, Clone)]
pub struct JobQuery {
    pub state: Option<JobState>,
    pub tags: Vec<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl JobQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub(crate) fn matches(&self, job: &Job) -> bool {
        if let Some(state) = self.state {
            if job.state != state {
                return false;
            }
        }
        if !self.tags.is_empty() && !self.tags.iter().all(|t| job.tags.contains(t)) {
            return false;
        }
        if let Some(after) = self.created_after {
            if job.submitted_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if job.submitted_at > before {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_starts_queued_at_attempt_one() {
        let job = Job::new("blob://input", "hls-720p", 0, 3);
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.progress, 0);
        assert!(job.started_at.is_none());
        assert!(job.output_ref.is_none());
    }

    #[test]
    fn max_attempts_floors_at_one() {
        let job = Job::new("x", "y", 0, 0);
        assert_eq!(job.max_attempts, 1);
    }

    #[test]
    fn terminal_states_have_no_outgoing_transitions() {
        assert!(!JobState::Completed.can_transition_to(JobState::Running));
        assert!(!JobState::Failed.can_transition_to(JobState::Queued));
        assert!(!JobState::Cancelled.can_transition_to(JobState::Completed));
    }

    #[test]
    fn legal_transitions() {
        assert!(JobState::Queued.can_transition_to(JobState::Running));
        assert!(JobState::Queued.can_transition_to(JobState::Cancelled));
        assert!(JobState::Running.can_transition_to(JobState::Completed));
        assert!(JobState::Running.can_transition_to(JobState::Failed));
        assert!(JobState::Running.can_transition_to(JobState::Cancelled));
        assert!(JobState::Running.can_transition_to(JobState::Queued));
    }

    #[test]
    fn illegal_transitions_rejected() {
        assert!(!JobState::Queued.can_transition_to(JobState::Completed));
        assert!(!JobState::Queued.can_transition_to(JobState::Failed));
        assert!(!JobState::Running.can_transition_to(JobState::Running));
    }

    #[test]
    fn query_filters_by_tags_and_state() {
        let job = Job::new("x", "y", 0, 1).with_tags(vec!["tenant-a".into()]);
        let query = JobQuery::new()
            .with_state(JobState::Queued)
            .with_tags(vec!["tenant-a".into()]);
        assert!(query.matches(&job));

        let wrong_tag = JobQuery::new().with_tags(vec!["tenant-b".into()]);
        assert!(!wrong_tag.matches(&job));
    }
}
