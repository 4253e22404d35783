use std::collections::HashMap;
use std::sync::Arc;

use crate::error::MirageError;
use crate::jobs::store::{PendingJobStore, TransitionFields};
use crate::jobs::{JobStatus, PendingJob};
use crate::ledger::CreditLedger;
use crate::providers::{JobKind, PollOutcome, Provider};
use crate::push::{PushDispatch, PushRequest};

/// How a provider authenticates its callbacks. All three observed schemes
/// are supported; each provider is pinned to one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WebhookAuth {
    /// Secret carried as the `token` query parameter.
    QueryToken,
    /// Secret carried in a request header.
    HeaderSignature { header: &'static str },
    /// Secret carried as a field in the JSON body.
    BodySecret { field: &'static str },
}

pub fn auth_scheme(provider: Provider) -> WebhookAuth {
    match provider {
        Provider::Fal => WebhookAuth::QueryToken,
        Provider::Runway => WebhookAuth::HeaderSignature {
            header: "x-runway-signature",
        },
        Provider::Luma => WebhookAuth::BodySecret { field: "secret" },
    }
}

/// Provider-agnostic view of one callback, after field-name normalization.
#[derive(Clone, Debug)]
pub struct NormalizedCallback {
    pub task_id: String,
    pub status: JobStatus,
    pub result_url: Option<String>,
    pub error_message: Option<String>,
}

/// Map a provider callback body onto the internal contract. Field names and
/// status vocabularies differ per provider and are not trusted beyond this
/// function.
pub fn normalize_callback(
    provider: Provider,
    body: &serde_json::Value,
) -> Result<NormalizedCallback, MirageError> {
    let (task_id, status_str, result_url, error_message) = match provider {
        Provider::Fal => (
            body["request_id"]
                .as_str()
                .or_else(|| body["gateway_request_id"].as_str()),
            body["status"].as_str(),
            body["payload"]["images"][0]["url"]
                .as_str()
                .or_else(|| body["payload"]["video"]["url"].as_str()),
            body["error"].as_str(),
        ),
        Provider::Runway => (
            body["id"].as_str(),
            body["status"].as_str(),
            body["output"][0].as_str(),
            body["failure"].as_str(),
        ),
        Provider::Luma => (
            body["id"].as_str(),
            body["state"].as_str(),
            body["assets"]["video"]
                .as_str()
                .or_else(|| body["assets"]["image"].as_str()),
            body["failure_reason"].as_str(),
        ),
    };

    let task_id = task_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| MirageError::SchemaParse(format!("{provider} callback missing task id")))?
        .to_string();
    let status_str = status_str
        .ok_or_else(|| MirageError::SchemaParse(format!("{provider} callback missing status")))?;

    let status = match status_str {
        "OK" | "COMPLETED" | "SUCCEEDED" | "completed" => JobStatus::Completed,
        "ERROR" | "FAILED" | "CANCELLED" | "failed" => JobStatus::Failed,
        "IN_PROGRESS" | "RUNNING" | "THROTTLED" | "dreaming" => JobStatus::Processing,
        "IN_QUEUE" | "PENDING" | "queued" => JobStatus::Pending,
        other => {
            return Err(MirageError::SchemaParse(format!(
                "{provider} callback has unknown status: {other}"
            )));
        }
    };

    Ok(NormalizedCallback {
        task_id,
        status,
        result_url: result_url.map(str::to_string),
        error_message: error_message.map(str::to_string),
    })
}

/// Terminal-state disposition of one callback, reported back to the HTTP
/// layer. Everything here maps to 200 — providers only ever observe a
/// generic success, never internal error kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The transition was applied (and settlement ran for completions).
    Applied,
    /// Benign replay: the job was already terminal.
    Duplicate,
    /// No job matches the task id. Logged, not an error to the provider.
    UnknownTask,
    /// Progress update with no state change required.
    NoChange,
}

/// Converts authenticated provider callbacks into job-state transitions,
/// credit settlement, and push requests.
pub struct Reconciler {
    store: Arc<PendingJobStore>,
    ledger: Arc<CreditLedger>,
    push: Arc<dyn PushDispatch>,
    secrets: HashMap<Provider, String>,
}

impl Reconciler {
    pub fn new(
        store: Arc<PendingJobStore>,
        ledger: Arc<CreditLedger>,
        push: Arc<dyn PushDispatch>,
        secrets: HashMap<Provider, String>,
    ) -> Self {
        Self {
            store,
            ledger,
            push,
            secrets,
        }
    }

    /// Verify the callback secret before anything else — no lookup and no
    /// mutation happen for an unauthenticated request.
    pub fn authenticate(
        &self,
        provider: Provider,
        query_token: Option<&str>,
        header_value: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<(), MirageError> {
        let expected = self
            .secrets
            .get(&provider)
            .ok_or(MirageError::Unauthorized {
                provider: provider.to_string(),
            })?;
        let presented = match auth_scheme(provider) {
            WebhookAuth::QueryToken => query_token,
            WebhookAuth::HeaderSignature { .. } => header_value,
            WebhookAuth::BodySecret { field } => body[field].as_str(),
        };
        match presented {
            Some(secret) if constant_time_eq(secret, expected) => Ok(()),
            _ => {
                tracing::warn!(
                    provider = provider.as_str(),
                    "webhook auth failed — rejecting callback"
                );
                Err(MirageError::Unauthorized {
                    provider: provider.to_string(),
                })
            }
        }
    }

    /// Process one authenticated, normalized callback: transition the job,
    /// settle credits on completion, and request a push for the terminal
    /// state. Duplicate deliveries collapse to a no-op.
    pub async fn reconcile(
        &self,
        provider: Provider,
        callback: NormalizedCallback,
    ) -> Result<ReconcileOutcome, MirageError> {
        let fields = TransitionFields {
            result_url: callback.result_url,
            error_message: callback.error_message,
        };

        let outcome = match self.store.transition(&callback.task_id, callback.status, fields) {
            Ok(outcome) => outcome,
            Err(MirageError::JobNotFound(task_id)) => {
                tracing::warn!(
                    provider = provider.as_str(),
                    task_id = task_id,
                    "callback for unknown task id, ignoring"
                );
                return Ok(ReconcileOutcome::UnknownTask);
            }
            Err(e) if e.is_benign_replay() => {
                tracing::warn!(
                    provider = provider.as_str(),
                    task_id = callback.task_id,
                    "out-of-order callback discarded: {e}"
                );
                return Ok(ReconcileOutcome::Duplicate);
            }
            Err(e) => return Err(e),
        };

        let job = outcome.job.clone();
        if job.status == JobStatus::Completed {
            // Attempted on every completed delivery; the ledger is
            // idempotent per job id, so a redelivery never double-deducts.
            self.settle(&job);
        }
        if job.status.is_terminal() && outcome.applied {
            self.request_push(&job).await;
        }

        Ok(if outcome.applied {
            ReconcileOutcome::Applied
        } else if job.status.is_terminal() {
            ReconcileOutcome::Duplicate
        } else {
            ReconcileOutcome::NoChange
        })
    }

    /// Terminal path for the client-side polling fallback: identical
    /// transition rules and settlement as a webhook delivery.
    pub async fn apply_poll_outcome(
        &self,
        task_id: &str,
        outcome: PollOutcome,
    ) -> Result<ReconcileOutcome, MirageError> {
        let callback = match outcome {
            PollOutcome::InProgress => NormalizedCallback {
                task_id: task_id.to_string(),
                status: JobStatus::Processing,
                result_url: None,
                error_message: None,
            },
            PollOutcome::Completed { result_url } => NormalizedCallback {
                task_id: task_id.to_string(),
                status: JobStatus::Completed,
                result_url: Some(result_url),
                error_message: None,
            },
            PollOutcome::Failed { message } => NormalizedCallback {
                task_id: task_id.to_string(),
                status: JobStatus::Failed,
                result_url: None,
                error_message: Some(message),
            },
        };
        // Provider is only used for log context on this path.
        let job = self.store.find_by_task_id(task_id);
        let provider = job.map(|j| j.provider).unwrap_or(Provider::Luma);
        self.reconcile(provider, callback).await
    }

    /// Polling exhaustion: mark the job failed with the timeout message. No
    /// deduction ever happens for a failed job.
    pub async fn apply_poll_timeout(
        &self,
        task_id: &str,
        attempts: u32,
    ) -> Result<ReconcileOutcome, MirageError> {
        self.apply_poll_outcome(
            task_id,
            PollOutcome::Failed {
                message: MirageError::Timeout { attempts }.to_string(),
            },
        )
        .await
    }

    /// Deduct the recorded cost for a completed job. A settlement shortfall
    /// never reverts the completion — the job stays completed and the
    /// shortfall is logged for reconciliation.
    fn settle(&self, job: &PendingJob) {
        let cost = job.cost();
        if cost <= rust_decimal::Decimal::ZERO {
            tracing::debug!(job_id = %job.id, "zero-cost job, nothing to settle");
            return;
        }
        match self.ledger.deduct_credits(&job.user_id, cost, job.id) {
            Ok(balance) => {
                tracing::info!(
                    job_id = %job.id,
                    user_id = job.user_id,
                    cost = %cost,
                    balance = %balance,
                    "job settled"
                );
            }
            Err(MirageError::InsufficientCredits { balance, requested }) => {
                tracing::error!(
                    job_id = %job.id,
                    user_id = job.user_id,
                    balance = %balance,
                    requested = %requested,
                    "settlement shortfall — completed job left unsettled for reconciliation"
                );
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, "settlement failed: {e}");
            }
        }
    }

    /// Request a push for a terminal job. Dispatch failure never rolls back
    /// the transition; a user-cancelled job gets no notification at all.
    async fn request_push(&self, job: &PendingJob) {
        if job.notification_sent || job.user_cancelled {
            return;
        }
        let Some(token) = &job.device_token else {
            return;
        };
        let (title, body) = notification_text(job);
        let req = PushRequest {
            device_token: token.clone(),
            job_id: job.id,
            kind: job.kind,
            title,
            body,
        };
        match self.push.dispatch(req).await {
            Ok(()) => self.store.mark_notification_sent(job.id),
            Err(e) => {
                tracing::warn!(job_id = %job.id, "push dispatch failed (non-fatal): {e}");
            }
        }
    }
}

fn notification_text(job: &PendingJob) -> (String, String) {
    let noun = match job.kind {
        JobKind::Image => "image",
        JobKind::Video => "video",
    };
    match job.status {
        JobStatus::Completed => (
            format!("Your {noun} is ready"),
            "Tap to view the result".to_string(),
        ),
        _ => (
            format!("Your {noun} could not be generated"),
            job.error_message
                .clone()
                .unwrap_or_else(|| "Something went wrong — you were not charged".to_string()),
        ),
    }
}

/// Compare secrets without short-circuiting on the first mismatched byte.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
