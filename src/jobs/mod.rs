pub mod store;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::providers::{JobKind, Provider};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allowed status transitions. Terminal states absorb nothing; re-delivery
/// of an identical terminal status is handled separately as a no-op.
pub fn is_valid_transition(from: JobStatus, to: JobStatus) -> bool {
    matches!(
        (from, to),
        (JobStatus::Pending, JobStatus::Processing)
            | (JobStatus::Pending, JobStatus::Completed)
            | (JobStatus::Pending, JobStatus::Failed)
            | (JobStatus::Processing, JobStatus::Completed)
            | (JobStatus::Processing, JobStatus::Failed)
    )
}

/// Durable record of one in-flight or recently-terminal generation job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingJob {
    pub id: Uuid,
    pub user_id: String,
    /// Provider-issued identifier; primary correlation key for webhook
    /// matching. Unique among non-terminal jobs across all providers.
    pub task_id: String,
    pub provider: Provider,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Set only on transition to Completed; immutable afterwards.
    pub result_url: Option<String>,
    /// Set only on transition to Failed.
    pub error_message: Option<String>,
    /// Opaque bag: prompt, generation parameters, and the `cost` estimate
    /// needed for settlement and history rendering.
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub device_token: Option<String>,
    pub notification_sent: bool,
    /// Set when the user dismisses the job. Late terminal webhooks still
    /// update the record and settle credits, but never re-surface a
    /// notification.
    pub user_cancelled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PendingJob {
    pub fn new(
        user_id: impl Into<String>,
        task_id: impl Into<String>,
        provider: Provider,
        kind: JobKind,
        cost: Decimal,
    ) -> Self {
        let now = Utc::now();
        let mut metadata = serde_json::Map::new();
        metadata.insert("cost".to_string(), serde_json::json!(cost.to_string()));
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            task_id: task_id.into(),
            provider,
            kind,
            status: JobStatus::Pending,
            result_url: None,
            error_message: None,
            metadata,
            device_token: None,
            notification_sent: false,
            user_cancelled: false,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn with_device_token(mut self, token: impl Into<String>) -> Self {
        self.device_token = Some(token.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Cost estimate recorded at creation. Zero when missing or malformed —
    /// settlement then deducts nothing rather than guessing.
    pub fn cost(&self) -> Decimal {
        self.metadata
            .get("cost")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(Decimal::ZERO)
    }
}

/// Row-level change event emitted on every insert/update.
#[derive(Clone, Debug)]
pub struct JobEvent {
    pub job: PendingJob,
    pub change: JobChange,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobChange {
    Created,
    Updated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_accept_no_transitions() {
        for terminal in [JobStatus::Completed, JobStatus::Failed] {
            for to in [
                JobStatus::Pending,
                JobStatus::Processing,
                JobStatus::Completed,
                JobStatus::Failed,
            ] {
                assert!(!is_valid_transition(terminal, to));
            }
        }
    }

    #[test]
    fn pending_and_processing_reach_both_terminals() {
        assert!(is_valid_transition(JobStatus::Pending, JobStatus::Processing));
        assert!(is_valid_transition(JobStatus::Pending, JobStatus::Completed));
        assert!(is_valid_transition(JobStatus::Pending, JobStatus::Failed));
        assert!(is_valid_transition(JobStatus::Processing, JobStatus::Completed));
        assert!(is_valid_transition(JobStatus::Processing, JobStatus::Failed));
        assert!(!is_valid_transition(JobStatus::Processing, JobStatus::Pending));
    }

    #[test]
    fn cost_reads_metadata_or_zero() {
        use rust_decimal_macros::dec;
        let job = PendingJob::new("u1", "t1", Provider::Fal, JobKind::Image, dec!(0.50));
        assert_eq!(job.cost(), dec!(0.50));

        let mut bare = job.clone();
        bare.metadata.clear();
        assert_eq!(bare.cost(), Decimal::ZERO);
    }
}
