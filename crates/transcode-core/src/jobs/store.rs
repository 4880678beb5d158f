//! In-memory authoritative record of all jobs.
//!
//! `Transition` is the sole mutation primitive: it only applies the
//! supplied `mutate_fn` if the record's current state equals `from_state`,
//! making the compare-and-mutate linearizable at job granularity. Every
//! other write method (`update_progress`, `cancel_mark`) is built on top of
//! the same per-row lock, never bypassing it.

use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;

use crate::error::StoreError;
use crate::jobs::job::{Job, JobId, JobQuery, JobState};

/// `Transition`'s mutate function receives a mutable reference to the
/// record and applies whatever field changes its transition requires
/// (state, timestamps, progress, error, output ref). It must not be used
/// to change the record's id.
pub type MutateFn<'a> = Box<dyn FnOnce(&mut Job) + Send + 'a>;

pub struct JobStore {
    records: DashMap<JobId, Mutex<Job>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Insert a new job record. Fails if the id already exists, which
    /// should not happen for freshly generated UUIDs but is checked
    /// because `Insert` is the one place a caller could race itself.
    pub fn insert(&self, job: Job) -> Result<JobId, StoreError> {
        let id = job.id;
        if self.records.contains_key(&id) {
            return Err(StoreError::Duplicate(id));
        }
        self.records.insert(id, Mutex::new(job));
        Ok(id)
    }

    /// Return a deep copy of the job; never a mutable alias.
    pub fn get(&self, id: JobId) -> Result<Job, StoreError> {
        let entry = self.records.get(&id).ok_or(StoreError::NotFound(id))?;
        let guard = entry.lock().unwrap_or_else(|p| p.into_inner());
        Ok(guard.clone())
    }

    /// Atomic compare-and-mutate: `mutate_fn` only runs if the record's
    /// current state equals `from_state`. Returns the post-mutation
    /// snapshot on success.
    ///
    /// A `from_state -> job.state` combination never legal per
    /// [`JobState::can_transition_to`] is a programming error in the
    /// caller, not a data race, and aborts the process rather than
    /// returning an error — see invariant 1 in the module documentation.
    pub fn transition(
        &self,
        id: JobId,
        from_state: JobState,
        mutate_fn: MutateFn<'_>,
    ) -> Result<Job, StoreError> {
        let entry = self.records.get(&id).ok_or(StoreError::NotFound(id))?;
        let mut guard = entry.lock().unwrap_or_else(|p| p.into_inner());

        if guard.state != from_state {
            return Err(StoreError::BadState(id));
        }

        let before = guard.state;
        mutate_fn(&mut guard);

        if before != guard.state && !before.can_transition_to(guard.state) {
            unreachable!(
                "illegal job state transition attempted: {before} -> {}",
                guard.state
            );
        }

        Ok(guard.clone())
    }

    /// Advance `progress` while `state == Running`; backwards moves and
    /// moves while not running are silently rejected (idempotent for an
    /// equal value) rather than treated as an error, since these are
    /// expected races against a job that just left `Running`.
    pub fn update_progress(&self, id: JobId, percent: u8) -> Result<(), StoreError> {
        let entry = self.records.get(&id).ok_or(StoreError::NotFound(id))?;
        let mut guard = entry.lock().unwrap_or_else(|p| p.into_inner());
        let percent = percent.min(100);
        if guard.state == JobState::Running && percent >= guard.progress {
            guard.progress = percent;
        }
        Ok(())
    }

    /// Set the per-job cancel flag. Does not itself transition state;
    /// the owning worker observes the flag and transitions on its own.
    pub fn cancel_mark(&self, id: JobId) -> Result<(), StoreError> {
        let entry = self.records.get(&id).ok_or(StoreError::NotFound(id))?;
        let mut guard = entry.lock().unwrap_or_else(|p| p.into_inner());
        if guard.state.is_terminal() {
            return Err(StoreError::Terminal(id));
        }
        guard.cancel_requested = true;
        Ok(())
    }

    /// Forcibly drops a record regardless of its state. Used only to undo
    /// an `insert` that lost the race against a full queue at submission —
    /// never exposed as a general-purpose deletion; terminal housekeeping
    /// goes through [`Self::prune_terminal`] instead.
    pub(crate) fn remove(&self, id: JobId) {
        self.records.remove(&id);
    }

    pub fn is_cancel_requested(&self, id: JobId) -> bool {
        self.records
            .get(&id)
            .map(|entry| entry.lock().unwrap_or_else(|p| p.into_inner()).cancel_requested)
            .unwrap_or(false)
    }

    /// Paginated, deep-copied view. Collects matching ids first and
    /// releases each row's lock before building the next snapshot, so no
    /// single lock is held across the full scan.
    pub fn list(&self, filter: &JobQuery) -> Vec<Job> {
        let mut matched: Vec<Job> = self
            .records
            .iter()
            .filter_map(|entry| {
                let job = entry.value().lock().unwrap_or_else(|p| p.into_inner()).clone();
                filter.matches(&job).then_some(job)
            })
            .collect();

        matched.sort_by_key(|j| j.submitted_at);

        let offset = filter.offset.unwrap_or(0);
        let matched = matched.into_iter().skip(offset);
        match filter.limit {
            Some(limit) => matched.take(limit).collect(),
            None => matched.collect(),
        }
    }

    /// Remove terminal jobs older than `older_than`. Never invoked by the
    /// store's own request path; an owning service calls this on a timer.
    /// Refuses (skips) any record that is not terminal rather than
    /// silently leaving it half-pruned.
    pub fn prune_terminal(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        let mut to_remove = Vec::new();
        for entry in self.records.iter() {
            let guard = entry.value().lock().unwrap_or_else(|p| p.into_inner());
            if guard.state.is_terminal() {
                if let Some(ended_at) = guard.ended_at {
                    if ended_at < cutoff {
                        to_remove.push(*entry.key());
                    }
                }
            }
        }
        for id in &to_remove {
            self.records.remove(id);
        }
        to_remove.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}
