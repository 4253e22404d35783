use std::sync::Arc;

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::config::Config;
use crate::error::MirageError;
use crate::jobs::store::PendingJobStore;
use crate::jobs::PendingJob;
use crate::ledger::CreditLedger;
use crate::providers::dispatch::SubmitDispatch;
use crate::providers::{GenerationRequest, JobKind, Provider};

/// What the UI asks for: one generation against one provider, with the cost
/// estimate already priced from the catalog.
#[derive(Clone, Debug)]
pub struct SubmitSpec {
    pub provider: Provider,
    pub kind: JobKind,
    pub model: String,
    pub prompt: String,
    pub media_refs: Vec<String>,
    pub aspect_ratio: Option<String>,
    pub options: serde_json::Map<String, serde_json::Value>,
    pub cost: Decimal,
    pub device_token: Option<String>,
}

/// Front door for the submission path: provider dispatch plus the durable
/// pending-job record. Settlement happens later, on webhook or poll
/// observation — credits are checked upfront but not reserved.
pub struct GenerationEngine {
    config: Arc<Config>,
    dispatch: Arc<SubmitDispatch>,
    store: Arc<PendingJobStore>,
    ledger: Arc<CreditLedger>,
}

impl GenerationEngine {
    pub fn new(
        config: Arc<Config>,
        dispatch: Arc<SubmitDispatch>,
        store: Arc<PendingJobStore>,
        ledger: Arc<CreditLedger>,
    ) -> Self {
        Self {
            config,
            dispatch,
            store,
            ledger,
        }
    }

    /// Submit a generation request and record the pending job. A provider
    /// rejection or network failure surfaces immediately: no job row is
    /// created and nothing is charged.
    pub async fn submit(
        &self,
        user_id: &str,
        spec: SubmitSpec,
    ) -> Result<PendingJob, MirageError> {
        // The cost is known upfront, so an uncoverable job is rejected
        // before the provider ever sees it.
        let balance = self.ledger.balance(user_id);
        if spec.cost > Decimal::ZERO && balance < spec.cost {
            return Err(MirageError::InsufficientCredits {
                balance,
                requested: spec.cost,
            });
        }

        let api_key = self
            .config
            .api_key(spec.provider)
            .ok_or_else(|| MirageError::Submission {
                provider: spec.provider.to_string(),
                message: "provider not configured".to_string(),
                status: None,
            })?
            .to_string();

        let request = GenerationRequest {
            kind: spec.kind,
            model: spec.model.clone(),
            prompt: spec.prompt.clone(),
            media_refs: spec.media_refs.clone(),
            aspect_ratio: spec.aspect_ratio.clone(),
            options: spec.options.clone(),
            client_task_id: Uuid::new_v4().to_string(),
        };
        let callback_url = self.config.callback_url_for(spec.provider);

        let receipt = self
            .dispatch
            .submit(spec.provider, &request, &api_key, callback_url.as_deref())
            .await?;

        let mut job = PendingJob::new(
            user_id,
            receipt.task_id,
            spec.provider,
            spec.kind,
            spec.cost,
        )
        .with_metadata("prompt", serde_json::json!(spec.prompt))
        .with_metadata("model", serde_json::json!(spec.model));
        if let Some(ratio) = &spec.aspect_ratio {
            job = job.with_metadata("aspect_ratio", serde_json::json!(ratio));
        }
        if let Some(token) = spec.device_token {
            job = job.with_device_token(token);
        }

        self.store.create(job)
    }
}
