use std::time::Duration;

use reqwest::Client;

use crate::error::MirageError;
use crate::providers::apis::api_for;
use crate::providers::{
    encode_query_value, extract_task_id, GenerationRequest, PollOutcome, Provider, SubmitReceipt,
    WebhookBinding,
};

/// Max response body size for provider responses.
const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// Per-request timeout for submit and poll calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SubmitDispatch {
    client: Client,
}

impl Default for SubmitDispatch {
    fn default() -> Self {
        Self::new()
    }
}

impl SubmitDispatch {
    pub fn new() -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()
            .expect("failed to build provider HTTP client");
        Self { client }
    }

    /// Submit a generation request. On acceptance returns the provider task
    /// id (or the client-generated one when the response carries none); a
    /// 4xx/5xx or network failure is a `Submission` error and no job exists.
    pub async fn submit(
        &self,
        provider: Provider,
        req: &GenerationRequest,
        api_key: &str,
        callback_url: Option<&str>,
    ) -> Result<SubmitReceipt, MirageError> {
        let api = api_for(provider);
        let (url, headers, body) = api.build_submit_request(req, api_key, callback_url);
        let url = match (api.webhook_binding(), callback_url) {
            (WebhookBinding::QueryParam { name }, Some(cb)) => {
                bind_callback_query(&url, name, cb)
            }
            _ => url,
        };

        let mut http_req = self.client.post(&url).timeout(REQUEST_TIMEOUT);
        for (k, v) in &headers {
            http_req = http_req.header(k, v);
        }

        let response = http_req.json(&body).send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(MirageError::RateLimited {
                provider: provider.to_string(),
            });
        }
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(MirageError::AuthFailed {
                provider: provider.to_string(),
                message: format!("{status}"),
            });
        }
        if !status.is_success() {
            // Cap error body reads to MAX_RESPONSE_BYTES
            let error_bytes = response.bytes().await.unwrap_or_default();
            let truncated = &error_bytes[..error_bytes.len().min(MAX_RESPONSE_BYTES)];
            return Err(MirageError::Submission {
                provider: provider.to_string(),
                message: format!("{status}: {}", String::from_utf8_lossy(truncated)),
                status: Some(status.as_u16()),
            });
        }

        let bytes = response.bytes().await?;
        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(MirageError::Submission {
                provider: provider.to_string(),
                message: format!("response too large: {} bytes", bytes.len()),
                status: None,
            });
        }

        let task_id = extract_task_id(&bytes, api.task_id_fields(), &req.client_task_id);
        tracing::info!(
            provider = provider.as_str(),
            model = req.model,
            task_id = task_id,
            "generation job submitted"
        );

        Ok(SubmitReceipt { task_id })
    }

    /// One status poll for a synchronous-submit provider.
    pub async fn poll_status(
        &self,
        provider: Provider,
        task_id: &str,
        api_key: &str,
    ) -> Result<PollOutcome, MirageError> {
        let api = api_for(provider);
        let (url, headers) = api.build_poll_request(task_id, api_key);

        let mut http_req = self.client.get(&url).timeout(REQUEST_TIMEOUT);
        for (k, v) in &headers {
            http_req = http_req.header(k, v);
        }

        let response = http_req.send().await?;
        let status = response.status();

        // Auth failures during poll are not transient — fail fast
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(MirageError::AuthFailed {
                provider: provider.to_string(),
                message: format!("poll HTTP {status}"),
            });
        }
        if !status.is_success() {
            return Err(MirageError::Submission {
                provider: provider.to_string(),
                message: format!("poll failed with HTTP {status}"),
                status: Some(status.as_u16()),
            });
        }

        let bytes = response.bytes().await?;
        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(MirageError::SchemaParse(format!(
                "poll response too large: {} bytes",
                bytes.len()
            )));
        }
        api.parse_poll_response(&bytes)
    }

    /// Drive `poll_status` at a fixed interval until a terminal outcome or
    /// the attempt bound. Exhaustion is `Timeout`, distinct from a
    /// provider-reported failure; transient poll errors consume an attempt
    /// rather than aborting.
    pub async fn poll_until_terminal(
        &self,
        provider: Provider,
        task_id: &str,
        api_key: &str,
        max_attempts: u32,
        interval: Duration,
    ) -> Result<PollOutcome, MirageError> {
        poll_with_bounds(max_attempts, interval, |attempt| {
            tracing::debug!(
                provider = provider.as_str(),
                task_id = task_id,
                attempt = attempt,
                "polling job status"
            );
            self.poll_status(provider, task_id, api_key)
        })
        .await
    }
}

/// Fixed-interval poll loop over an arbitrary poll future. `InProgress` and
/// retryable errors each consume one attempt; a terminal outcome or fatal
/// error ends the loop; exhaustion is `Timeout`.
async fn poll_with_bounds<F, Fut>(
    max_attempts: u32,
    interval: Duration,
    mut poll: F,
) -> Result<PollOutcome, MirageError>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<PollOutcome, MirageError>>,
{
    for attempt in 1..=max_attempts {
        tokio::time::sleep(interval).await;
        match poll(attempt).await {
            Ok(PollOutcome::InProgress) => {}
            Ok(outcome) => return Ok(outcome),
            Err(e) if e.is_retryable() => {
                tracing::warn!(attempt = attempt, "poll attempt failed: {e}");
            }
            Err(e) => return Err(e),
        }
    }
    Err(MirageError::Timeout {
        attempts: max_attempts,
    })
}

/// Append the percent-encoded callback URL as a query parameter, respecting
/// an already-parameterized endpoint URL.
fn bind_callback_query(url: &str, param: &str, callback_url: &str) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}{param}={}", encode_query_value(callback_url))
}
