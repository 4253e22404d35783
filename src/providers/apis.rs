use serde_json::json;

use crate::error::MirageError;
use crate::providers::{GenerationApi, GenerationRequest, PollOutcome, Provider, WebhookBinding};

// ---------------------------------------------------------------------------
// Fal queue API (image models; async, webhook via query parameter)
// ---------------------------------------------------------------------------

pub struct FalApi;

impl GenerationApi for FalApi {
    fn provider(&self) -> Provider {
        Provider::Fal
    }

    fn build_submit_request(
        &self,
        req: &GenerationRequest,
        api_key: &str,
        _callback_url: Option<&str>,
    ) -> (String, Vec<(String, String)>, serde_json::Value) {
        // Callback URL is bound by the dispatcher as a query parameter, not here.
        let url = format!("https://queue.fal.run/{}", req.model);
        let headers = vec![
            ("Authorization".to_string(), format!("Key {api_key}")),
            ("Content-Type".to_string(), "application/json".to_string()),
        ];

        let mut body = serde_json::Map::new();
        body.insert("prompt".to_string(), json!(req.prompt));
        if let Some(image_url) = req.media_refs.first() {
            body.insert("image_url".to_string(), json!(image_url));
        }
        if let Some(ratio) = &req.aspect_ratio {
            body.insert("aspect_ratio".to_string(), json!(ratio));
        }
        for (k, v) in &req.options {
            body.entry(k.clone()).or_insert_with(|| v.clone());
        }

        (url, headers, serde_json::Value::Object(body))
    }

    fn task_id_fields(&self) -> &'static [&'static str] {
        &["request_id", "gateway_request_id"]
    }

    fn webhook_binding(&self) -> WebhookBinding {
        WebhookBinding::QueryParam { name: "fal_webhook" }
    }

    fn build_poll_request(&self, task_id: &str, api_key: &str) -> (String, Vec<(String, String)>) {
        let url = format!("https://queue.fal.run/requests/{task_id}/status");
        let headers = vec![("Authorization".to_string(), format!("Key {api_key}"))];
        (url, headers)
    }

    fn parse_poll_response(&self, body: &[u8]) -> Result<PollOutcome, MirageError> {
        let v: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| MirageError::SchemaParse(format!("fal status response: {e}")))?;
        match v["status"].as_str() {
            Some("IN_QUEUE" | "IN_PROGRESS") => Ok(PollOutcome::InProgress),
            Some("COMPLETED" | "OK") => {
                let result_url = v["response"]["images"][0]["url"]
                    .as_str()
                    .or_else(|| v["response"]["video"]["url"].as_str())
                    .unwrap_or("")
                    .to_string();
                Ok(PollOutcome::Completed { result_url })
            }
            Some("ERROR" | "FAILED") => Ok(PollOutcome::Failed {
                message: v["error"].as_str().unwrap_or("generation failed").to_string(),
            }),
            Some(other) => Ok(PollOutcome::Failed {
                message: format!("unknown status: {other}"),
            }),
            None => Err(MirageError::SchemaParse(
                "fal status response missing 'status'".into(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Runway tasks API (video models; async, webhook via body field)
// ---------------------------------------------------------------------------

pub struct RunwayApi;

impl GenerationApi for RunwayApi {
    fn provider(&self) -> Provider {
        Provider::Runway
    }

    fn build_submit_request(
        &self,
        req: &GenerationRequest,
        api_key: &str,
        callback_url: Option<&str>,
    ) -> (String, Vec<(String, String)>, serde_json::Value) {
        let url = "https://api.dev.runwayml.com/v1/image_to_video".to_string();
        let headers = vec![
            ("Authorization".to_string(), format!("Bearer {api_key}")),
            ("X-Runway-Version".to_string(), "2024-11-06".to_string()),
            ("Content-Type".to_string(), "application/json".to_string()),
        ];

        let mut body = serde_json::Map::new();
        body.insert("model".to_string(), json!(req.model));
        body.insert("promptText".to_string(), json!(req.prompt));
        if let Some(image_url) = req.media_refs.first() {
            body.insert("promptImage".to_string(), json!(image_url));
        }
        if let Some(ratio) = &req.aspect_ratio {
            body.insert("ratio".to_string(), json!(ratio));
        }
        if let Some(cb) = callback_url {
            body.insert("webhookUrl".to_string(), json!(cb));
        }
        for (k, v) in &req.options {
            body.entry(k.clone()).or_insert_with(|| v.clone());
        }

        (url, headers, serde_json::Value::Object(body))
    }

    fn task_id_fields(&self) -> &'static [&'static str] {
        &["request_id", "gateway_request_id", "id"]
    }

    fn webhook_binding(&self) -> WebhookBinding {
        WebhookBinding::BodyField { name: "webhookUrl" }
    }

    fn build_poll_request(&self, task_id: &str, api_key: &str) -> (String, Vec<(String, String)>) {
        let url = format!("https://api.dev.runwayml.com/v1/tasks/{task_id}");
        let headers = vec![
            ("Authorization".to_string(), format!("Bearer {api_key}")),
            ("X-Runway-Version".to_string(), "2024-11-06".to_string()),
        ];
        (url, headers)
    }

    fn parse_poll_response(&self, body: &[u8]) -> Result<PollOutcome, MirageError> {
        let v: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| MirageError::SchemaParse(format!("runway task response: {e}")))?;
        match v["status"].as_str() {
            Some("PENDING" | "RUNNING" | "THROTTLED") => Ok(PollOutcome::InProgress),
            Some("SUCCEEDED") => {
                let result_url = v["output"][0].as_str().unwrap_or("").to_string();
                Ok(PollOutcome::Completed { result_url })
            }
            Some("FAILED" | "CANCELLED") => Ok(PollOutcome::Failed {
                message: v["failure"].as_str().unwrap_or("generation failed").to_string(),
            }),
            Some(other) => Ok(PollOutcome::Failed {
                message: format!("unknown status: {other}"),
            }),
            None => Err(MirageError::SchemaParse(
                "runway task response missing 'status'".into(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Luma Dream Machine API (sync submit, no webhook — client-side polling)
// ---------------------------------------------------------------------------

pub struct LumaApi;

impl GenerationApi for LumaApi {
    fn provider(&self) -> Provider {
        Provider::Luma
    }

    fn build_submit_request(
        &self,
        req: &GenerationRequest,
        api_key: &str,
        _callback_url: Option<&str>,
    ) -> (String, Vec<(String, String)>, serde_json::Value) {
        let url = "https://api.lumalabs.ai/dream-machine/v1/generations".to_string();
        let headers = vec![
            ("Authorization".to_string(), format!("Bearer {api_key}")),
            ("Content-Type".to_string(), "application/json".to_string()),
        ];

        let mut body = serde_json::Map::new();
        body.insert("model".to_string(), json!(req.model));
        body.insert("prompt".to_string(), json!(req.prompt));
        if let Some(ratio) = &req.aspect_ratio {
            body.insert("aspect_ratio".to_string(), json!(ratio));
        }
        if let Some(image_url) = req.media_refs.first() {
            body.insert(
                "keyframes".to_string(),
                json!({"frame0": {"type": "image", "url": image_url}}),
            );
        }
        for (k, v) in &req.options {
            body.entry(k.clone()).or_insert_with(|| v.clone());
        }

        (url, headers, serde_json::Value::Object(body))
    }

    fn task_id_fields(&self) -> &'static [&'static str] {
        &["request_id", "gateway_request_id", "id"]
    }

    fn webhook_binding(&self) -> WebhookBinding {
        WebhookBinding::None
    }

    fn build_poll_request(&self, task_id: &str, api_key: &str) -> (String, Vec<(String, String)>) {
        let url = format!("https://api.lumalabs.ai/dream-machine/v1/generations/{task_id}");
        let headers = vec![("Authorization".to_string(), format!("Bearer {api_key}"))];
        (url, headers)
    }

    fn parse_poll_response(&self, body: &[u8]) -> Result<PollOutcome, MirageError> {
        let v: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| MirageError::SchemaParse(format!("luma generation response: {e}")))?;
        match v["state"].as_str() {
            Some("queued" | "dreaming") => Ok(PollOutcome::InProgress),
            Some("completed") => {
                let result_url = v["assets"]["video"]
                    .as_str()
                    .or_else(|| v["assets"]["image"].as_str())
                    .unwrap_or("")
                    .to_string();
                Ok(PollOutcome::Completed { result_url })
            }
            Some("failed") => Ok(PollOutcome::Failed {
                message: v["failure_reason"]
                    .as_str()
                    .unwrap_or("generation failed")
                    .to_string(),
            }),
            Some(other) => Ok(PollOutcome::Failed {
                message: format!("unknown state: {other}"),
            }),
            None => Err(MirageError::SchemaParse(
                "luma generation response missing 'state'".into(),
            )),
        }
    }
}

/// Resolve the API implementation for a provider.
pub fn api_for(provider: Provider) -> Box<dyn GenerationApi> {
    match provider {
        Provider::Fal => Box::new(FalApi),
        Provider::Runway => Box::new(RunwayApi),
        Provider::Luma => Box::new(LumaApi),
    }
}
