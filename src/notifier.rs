use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::MirageError;
use crate::jobs::store::PendingJobStore;
use crate::jobs::{JobStatus, PendingJob};
use crate::providers::dispatch::SubmitDispatch;
use crate::providers::{JobKind, Provider, WebhookBinding};
use crate::providers::apis::api_for;
use crate::reconciler::Reconciler;

/// If no realtime event arrives within this bound, the notifier checks for
/// polling-provider jobs without an active poller and launches one per job.
const HEARTBEAT: Duration = Duration::from_secs(10);

/// A job may be cancelled only once this much time has passed since
/// creation — inside the window the provider is considered committed.
pub const CANCEL_GRACE: Duration = Duration::from_secs(120);

/// Nominal completion time used for the progress heuristic. None of the
/// providers report fine-grained progress.
fn nominal_duration(kind: JobKind) -> Duration {
    match kind {
        JobKind::Image => Duration::from_secs(30),
        JobKind::Video => Duration::from_secs(240),
    }
}

/// Elapsed-time progress estimate, capped below 1.0 until the job is
/// actually terminal.
pub fn progress_estimate(job: &PendingJob) -> f32 {
    if job.status.is_terminal() {
        return 1.0;
    }
    let elapsed = (Utc::now() - job.created_at)
        .to_std()
        .unwrap_or(Duration::ZERO);
    let nominal = nominal_duration(job.kind);
    (elapsed.as_secs_f32() / nominal.as_secs_f32()).min(0.95)
}

/// UI-facing notification state mirrored from job rows.
#[derive(Clone, Debug, Serialize)]
pub struct JobNotification {
    pub job_id: Uuid,
    pub title: String,
    pub message: String,
    pub progress: f32,
    pub thumbnail_url: Option<String>,
    pub dismissed: bool,
    pub created_at: chrono::DateTime<Utc>,
}

struct Listener {
    token: CancellationToken,
    user_id: String,
}

/// Client-side bridge from the job store's change feed to in-app
/// notifications, with a polling fallback for the synchronous provider.
pub struct JobStatusNotifier {
    store: Arc<PendingJobStore>,
    reconciler: Arc<Reconciler>,
    dispatch: Arc<SubmitDispatch>,
    /// API key for the polling-only provider's status endpoint.
    poll_api_key: Option<String>,
    notifications: Mutex<HashMap<Uuid, JobNotification>>,
    /// Jobs with a poller currently in flight; entries are released when the
    /// poller exits.
    polling: Mutex<HashSet<Uuid>>,
    listener: Mutex<Option<Listener>>,
}

impl JobStatusNotifier {
    pub fn new(
        store: Arc<PendingJobStore>,
        reconciler: Arc<Reconciler>,
        dispatch: Arc<SubmitDispatch>,
        poll_api_key: Option<String>,
    ) -> Self {
        Self {
            store,
            reconciler,
            dispatch,
            poll_api_key,
            notifications: Mutex::new(HashMap::new()),
            polling: Mutex::new(HashSet::new()),
            listener: Mutex::new(None),
        }
    }

    fn lock_notifications(&self) -> MutexGuard<'_, HashMap<Uuid, JobNotification>> {
        self.notifications.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe to change events for one user's jobs and mirror them into
    /// notification state. Must be paired with `stop_listening` on sign-out;
    /// starting again for another user releases the previous subscription.
    pub fn start_listening(self: &Arc<Self>, user_id: &str) {
        let token = CancellationToken::new();
        {
            let mut listener = self.listener.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = listener.take() {
                previous.token.cancel();
            }
            *listener = Some(Listener {
                token: token.clone(),
                user_id: user_id.to_string(),
            });
        }

        let notifier = Arc::clone(self);
        let user = user_id.to_string();
        let mut rx = self.store.subscribe();
        tokio::spawn(async move {
            tracing::info!(user_id = user, "job status listener started");
            let mut heartbeat = tokio::time::interval(HEARTBEAT);
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(event) => {
                            if event.job.user_id == user {
                                notifier.apply_job_update(&event.job);
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            // Missed events: resync from the store instead of
                            // trusting the feed.
                            tracing::warn!(skipped = skipped, "change feed lagged, resyncing");
                            for job in notifier.store.list_for_user(&user, None) {
                                notifier.apply_job_update(&job);
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = heartbeat.tick() => {
                        notifier.poll_stalled_jobs(&user);
                    }
                }
            }
            tracing::info!(user_id = user, "job status listener stopped");
        });
    }

    /// Release the active subscription. Safe to call when none is active.
    pub fn stop_listening(&self) {
        let mut listener = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(active) = listener.take() {
            active.token.cancel();
            tracing::debug!(user_id = active.user_id, "listener cancelled");
        }
    }

    /// Map one job row onto its notification record. Dismissed jobs are
    /// never resurrected, even by a late terminal update.
    fn apply_job_update(&self, job: &PendingJob) {
        let mut notifications = self.lock_notifications();
        let dismissed = job.user_cancelled
            || notifications.get(&job.id).is_some_and(|n| n.dismissed);
        let (title, message) = notification_copy(job);
        notifications.insert(
            job.id,
            JobNotification {
                job_id: job.id,
                title,
                message,
                progress: progress_estimate(job),
                thumbnail_url: job.result_url.clone(),
                dismissed,
                created_at: job.created_at,
            },
        );
    }

    /// Current notification records for rendering, newest jobs first.
    pub fn notifications(&self) -> Vec<JobNotification> {
        let notifications = self.lock_notifications();
        let mut records: Vec<JobNotification> = notifications
            .values()
            .filter(|n| !n.dismissed)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// Cancel a job: allowed only while it is still non-terminal and only
    /// after the provider grace period has elapsed. Best-effort — the
    /// provider may still complete the job, in which case the late webhook
    /// settles credits but surfaces nothing.
    pub fn cancel(&self, user_id: &str, job_id: Uuid) -> Result<(), MirageError> {
        let job = self
            .store
            .get_for_user(user_id, job_id)
            .ok_or_else(|| MirageError::JobNotFound(job_id.to_string()))?;
        if job.status.is_terminal() {
            return Err(MirageError::CancelNotAllowed(format!(
                "job already {}",
                job.status
            )));
        }
        let age = (Utc::now() - job.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if age < CANCEL_GRACE {
            return Err(MirageError::CancelNotAllowed(format!(
                "within the {}s grace period",
                CANCEL_GRACE.as_secs()
            )));
        }

        self.store.mark_cancelled(user_id, job_id)?;
        let mut notifications = self.lock_notifications();
        if let Some(record) = notifications.get_mut(&job_id) {
            record.dismissed = true;
        }
        tracing::info!(job_id = %job_id, "job cancelled by user (advisory, provider may still complete)");
        Ok(())
    }

    /// Launch a poller for each of this user's polling-provider jobs that is
    /// non-terminal and not already being polled. Each poller drives the
    /// provider's fixed interval and attempt bound; exhaustion marks the job
    /// failed with a timeout, never a deduction.
    fn poll_stalled_jobs(self: &Arc<Self>, user_id: &str) {
        let Some(api_key) = self.poll_api_key.clone() else {
            return;
        };
        let stalled: Vec<PendingJob> = self
            .store
            .list_for_user(user_id, None)
            .into_iter()
            .filter(|j| !j.status.is_terminal() && is_polling_provider(j.provider))
            .collect();

        for job in stalled {
            if !self.begin_poll(job.id) {
                continue;
            }
            let notifier = Arc::clone(self);
            let api_key = api_key.clone();
            tokio::spawn(async move {
                notifier.drive_poll(&job, &api_key).await;
                notifier.finish_poll(job.id);
            });
        }
    }

    async fn drive_poll(&self, job: &PendingJob, api_key: &str) {
        let api = api_for(job.provider);
        let result = self
            .dispatch
            .poll_until_terminal(
                job.provider,
                &job.task_id,
                api_key,
                api.max_poll_attempts(job.kind),
                api.poll_interval(),
            )
            .await;
        match result {
            Ok(outcome) => {
                if let Err(e) = self
                    .reconciler
                    .apply_poll_outcome(&job.task_id, outcome)
                    .await
                {
                    tracing::warn!(task_id = job.task_id, "poll reconcile failed: {e}");
                }
            }
            Err(MirageError::Timeout { attempts }) => {
                if let Err(e) = self
                    .reconciler
                    .apply_poll_timeout(&job.task_id, attempts)
                    .await
                {
                    tracing::warn!(task_id = job.task_id, "timeout transition failed: {e}");
                }
            }
            Err(e) => {
                // Fatal poll error; the slot is released so a later
                // heartbeat can retry from scratch.
                tracing::warn!(task_id = job.task_id, "poll abandoned: {e}");
            }
        }
    }

    /// Reserve the poll slot for a job. False when a poller is already in
    /// flight for it.
    fn begin_poll(&self, job_id: Uuid) -> bool {
        let mut polling = self.polling.lock().unwrap_or_else(|e| e.into_inner());
        polling.insert(job_id)
    }

    fn finish_poll(&self, job_id: Uuid) {
        let mut polling = self.polling.lock().unwrap_or_else(|e| e.into_inner());
        polling.remove(&job_id);
    }
}

/// True for providers whose completion is observed by client-side polling
/// rather than a webhook.
pub fn is_polling_provider(provider: Provider) -> bool {
    api_for(provider).webhook_binding() == WebhookBinding::None
}

fn notification_copy(job: &PendingJob) -> (String, String) {
    let noun = match job.kind {
        JobKind::Image => "image",
        JobKind::Video => "video",
    };
    match job.status {
        JobStatus::Pending => (
            format!("Generating your {noun}"),
            "Queued with the provider".to_string(),
        ),
        JobStatus::Processing => (
            format!("Generating your {noun}"),
            "The provider is working on it".to_string(),
        ),
        JobStatus::Completed => (
            format!("Your {noun} is ready"),
            "Tap to view the result".to_string(),
        ),
        JobStatus::Failed => (
            format!("Your {noun} could not be generated"),
            job.error_message
                .clone()
                .unwrap_or_else(|| "Something went wrong — you were not charged".to_string()),
        ),
    }
}
