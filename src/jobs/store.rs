use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::MirageError;
use crate::jobs::{is_valid_transition, JobChange, JobEvent, JobStatus, PendingJob};

/// Capacity of the change-feed channel. Slow subscribers observe a lagged
/// receiver and fall back to polling rather than blocking writers.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Terminal rows older than this are removed by the retention sweep.
pub const TERMINAL_RETENTION_DAYS: i64 = 7;

/// Fields applied together with a terminal transition.
#[derive(Clone, Debug, Default)]
pub struct TransitionFields {
    pub result_url: Option<String>,
    pub error_message: Option<String>,
}

/// Outcome of a transition request. `applied == false` means the job was
/// already terminal and the delivery was absorbed as a no-op.
#[derive(Clone, Debug)]
pub struct TransitionOutcome {
    pub job: PendingJob,
    pub applied: bool,
}

/// Durable, queryable record of in-flight and recently-terminal jobs, with a
/// row-level broadcast change feed. All mutations happen under one mutex;
/// the guard is never held across an await.
pub struct PendingJobStore {
    inner: Mutex<HashMap<Uuid, PendingJob>>,
    events: broadcast::Sender<JobEvent>,
}

impl Default for PendingJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingJobStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to row-level insert/update events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, PendingJob>> {
        // Mutex poisoning only happens if a writer panicked; the map itself
        // stays coherent, so recover the guard.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, job: &PendingJob, change: JobChange) {
        // Send fails only when no subscriber exists, which is fine.
        let _ = self.events.send(JobEvent {
            job: job.clone(),
            change,
        });
    }

    /// Insert a new pending job. Fails with `DuplicateTaskId` when another
    /// non-terminal job already carries the same task id (across providers).
    pub fn create(&self, job: PendingJob) -> Result<PendingJob, MirageError> {
        let inserted = {
            let mut map = self.lock();
            let duplicate = map
                .values()
                .any(|j| j.task_id == job.task_id && !j.status.is_terminal());
            if duplicate {
                return Err(MirageError::DuplicateTaskId(job.task_id));
            }
            map.insert(job.id, job.clone());
            job
        };
        tracing::info!(
            task_id = inserted.task_id,
            user_id = inserted.user_id,
            provider = inserted.provider.as_str(),
            "pending job created"
        );
        self.emit(&inserted, JobChange::Created);
        Ok(inserted)
    }

    /// Apply a status transition keyed by provider task id. Valid transitions
    /// mutate the row; a terminal re-delivery against an already-terminal job
    /// is an accepted no-op; anything else is `InvalidTransition` and a no-op.
    pub fn transition(
        &self,
        task_id: &str,
        new_status: JobStatus,
        fields: TransitionFields,
    ) -> Result<TransitionOutcome, MirageError> {
        let outcome = {
            let mut map = self.lock();
            // Prefer the non-terminal row: a retained terminal row may share
            // a task id with a newer job.
            let id = map
                .values()
                .filter(|j| j.task_id == task_id)
                .min_by_key(|j| j.status.is_terminal())
                .map(|j| j.id)
                .ok_or_else(|| MirageError::JobNotFound(task_id.to_string()))?;
            let job = map
                .get_mut(&id)
                .ok_or_else(|| MirageError::JobNotFound(task_id.to_string()))?;

            if job.status.is_terminal() {
                if new_status.is_terminal() {
                    // Providers may redeliver; absorb silently.
                    return Ok(TransitionOutcome {
                        job: job.clone(),
                        applied: false,
                    });
                }
                return Err(MirageError::InvalidTransition {
                    from: job.status.to_string(),
                    to: new_status.to_string(),
                });
            }

            if job.status == new_status {
                return Ok(TransitionOutcome {
                    job: job.clone(),
                    applied: false,
                });
            }

            if !is_valid_transition(job.status, new_status) {
                return Err(MirageError::InvalidTransition {
                    from: job.status.to_string(),
                    to: new_status.to_string(),
                });
            }

            let now = Utc::now();
            job.status = new_status;
            job.updated_at = now;
            match new_status {
                JobStatus::Completed => {
                    job.result_url = fields.result_url;
                    job.completed_at = Some(now);
                }
                JobStatus::Failed => {
                    job.error_message = fields.error_message;
                    job.completed_at = Some(now);
                }
                JobStatus::Pending | JobStatus::Processing => {}
            }
            TransitionOutcome {
                job: job.clone(),
                applied: true,
            }
        };
        tracing::info!(
            task_id = task_id,
            status = outcome.job.status.as_str(),
            "job transitioned"
        );
        self.emit(&outcome.job, JobChange::Updated);
        Ok(outcome)
    }

    /// Privileged lookup by provider task id (reconciler path).
    pub fn find_by_task_id(&self, task_id: &str) -> Option<PendingJob> {
        let map = self.lock();
        map.values()
            .filter(|j| j.task_id == task_id)
            .min_by_key(|j| j.status.is_terminal())
            .cloned()
    }

    pub fn get(&self, job_id: Uuid) -> Option<PendingJob> {
        self.lock().get(&job_id).cloned()
    }

    /// Client-facing lookup: a user only sees their own rows.
    pub fn get_for_user(&self, user_id: &str, job_id: Uuid) -> Option<PendingJob> {
        self.lock()
            .get(&job_id)
            .filter(|j| j.user_id == user_id)
            .cloned()
    }

    /// Client-facing listing scoped to one user, newest first.
    pub fn list_for_user(&self, user_id: &str, status: Option<JobStatus>) -> Vec<PendingJob> {
        let map = self.lock();
        let mut jobs: Vec<PendingJob> = map
            .values()
            .filter(|j| j.user_id == user_id)
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Sum of cost estimates over one user's non-terminal jobs. Advisory
    /// read used for the liability projection; never mutates anything.
    pub fn pending_cost_for_user(&self, user_id: &str) -> Decimal {
        let map = self.lock();
        map.values()
            .filter(|j| j.user_id == user_id && !j.status.is_terminal())
            .map(|j| j.cost())
            .sum()
    }

    /// Flag a job as dismissed by its owner. The row keeps transitioning for
    /// ledger correctness, but notifications are suppressed from here on.
    pub fn mark_cancelled(&self, user_id: &str, job_id: Uuid) -> Result<PendingJob, MirageError> {
        let job = {
            let mut map = self.lock();
            let job = map
                .get_mut(&job_id)
                .filter(|j| j.user_id == user_id)
                .ok_or_else(|| MirageError::JobNotFound(job_id.to_string()))?;
            job.user_cancelled = true;
            job.updated_at = Utc::now();
            job.clone()
        };
        self.emit(&job, JobChange::Updated);
        Ok(job)
    }

    /// Record that a push was dispatched for this job's terminal state.
    pub fn mark_notification_sent(&self, job_id: Uuid) {
        let updated = {
            let mut map = self.lock();
            match map.get_mut(&job_id) {
                Some(job) => {
                    job.notification_sent = true;
                    job.updated_at = Utc::now();
                    Some(job.clone())
                }
                None => None,
            }
        };
        if let Some(job) = updated {
            self.emit(&job, JobChange::Updated);
        }
    }

    /// Retention sweep: delete terminal rows older than `max_age`. Rows that
    /// are still non-terminal are never deleted. Returns the number removed.
    pub fn sweep_terminal(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut map = self.lock();
        let before = map.len();
        map.retain(|_, j| !(j.status.is_terminal() && j.updated_at < cutoff));
        let removed = before - map.len();
        if removed > 0 {
            tracing::info!(removed = removed, "retention sweep removed terminal jobs");
        }
        removed
    }
}
