use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::jobs::store::PendingJobStore;
use crate::ledger::CreditLedger;
use crate::providers::Provider;
use crate::reconciler::{auth_scheme, normalize_callback, Reconciler, WebhookAuth};

/// Shared handler state for the webhook receiver.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<PendingJobStore>,
    pub ledger: Arc<CreditLedger>,
    pub reconciler: Arc<Reconciler>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/generation", post(receive_webhook))
        .with_state(state)
}

async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

/// Single webhook endpoint multiplexed by the `provider` query parameter.
/// Providers only ever observe a generic status: 200 for processed, benign
/// duplicate, and unknown task; 401 for a failed secret check; 400 for a
/// body that cannot be normalized.
async fn receive_webhook(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> StatusCode {
    let Some(provider) = params.get("provider").and_then(|p| Provider::parse(p)) else {
        tracing::warn!("webhook with missing or unknown provider parameter");
        return StatusCode::BAD_REQUEST;
    };

    let json: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(provider = provider.as_str(), "unparseable webhook body: {e}");
            return StatusCode::BAD_REQUEST;
        }
    };

    let header_value = match auth_scheme(provider) {
        WebhookAuth::HeaderSignature { header } => {
            headers.get(header).and_then(|v| v.to_str().ok())
        }
        _ => None,
    };
    if let Err(e) = state.reconciler.authenticate(
        provider,
        params.get("token").map(String::as_str),
        header_value,
        &json,
    ) {
        tracing::warn!(provider = provider.as_str(), "rejected webhook: {e}");
        return StatusCode::UNAUTHORIZED;
    }

    let callback = match normalize_callback(provider, &json) {
        Ok(callback) => callback,
        Err(e) => {
            tracing::warn!(provider = provider.as_str(), "malformed webhook: {e}");
            return StatusCode::BAD_REQUEST;
        }
    };

    match state.reconciler.reconcile(provider, callback).await {
        Ok(outcome) => {
            tracing::debug!(provider = provider.as_str(), outcome = ?outcome, "webhook processed");
            StatusCode::OK
        }
        Err(e) => {
            // Internal detail stays in the logs; the provider sees only a
            // retryable generic failure.
            tracing::error!(provider = provider.as_str(), "webhook processing failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
