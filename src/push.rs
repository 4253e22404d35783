use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::MirageError;
use crate::providers::JobKind;

/// Payload handed to the push-delivery collaborator. Transport specifics
/// (APNs, etc.) live behind the gateway.
#[derive(Clone, Debug, Serialize)]
pub struct PushRequest {
    pub device_token: String,
    pub job_id: Uuid,
    pub kind: JobKind,
    pub title: String,
    pub body: String,
}

/// External push-dispatch collaborator. Failure is non-fatal to job
/// settlement — callers log and move on.
#[async_trait]
pub trait PushDispatch: Send + Sync {
    async fn dispatch(&self, req: PushRequest) -> Result<(), MirageError>;
}

/// HTTP gateway implementation.
pub struct HttpPushDispatch {
    client: reqwest::Client,
    gateway_url: String,
}

impl HttpPushDispatch {
    pub fn new(gateway_url: String) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(15))
            .build()
            .expect("failed to build push HTTP client");
        Self {
            client,
            gateway_url,
        }
    }
}

#[async_trait]
impl PushDispatch for HttpPushDispatch {
    async fn dispatch(&self, req: PushRequest) -> Result<(), MirageError> {
        let response = self.client.post(&self.gateway_url).json(&req).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MirageError::Other(format!(
                "push gateway returned HTTP {status}"
            )));
        }
        tracing::debug!(job_id = %req.job_id, "push dispatched");
        Ok(())
    }
}

/// Used when no push gateway is configured: every dispatch is a logged no-op.
pub struct NullPushDispatch;

#[async_trait]
impl PushDispatch for NullPushDispatch {
    async fn dispatch(&self, req: PushRequest) -> Result<(), MirageError> {
        tracing::debug!(job_id = %req.job_id, "push gateway not configured, skipping dispatch");
        Ok(())
    }
}
