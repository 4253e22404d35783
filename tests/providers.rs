//! Tests for the provider adapter layer: submit-request construction per
//! provider, webhook-URL binding and encoding, task-id extraction, and
//! poll-response parsing.

use mirage::providers::apis::{api_for, FalApi, LumaApi, RunwayApi};
use mirage::providers::{
    decode_query_value, encode_query_value, extract_task_id, GenerationApi, GenerationRequest,
    JobKind, PollOutcome, Provider, WebhookBinding,
};

fn request(kind: JobKind, model: &str) -> GenerationRequest {
    GenerationRequest {
        kind,
        model: model.to_string(),
        prompt: "a lighthouse at dusk".to_string(),
        media_refs: vec!["https://cdn.example.com/ref.jpg".to_string()],
        aspect_ratio: Some("16:9".to_string()),
        options: serde_json::Map::new(),
        client_task_id: "client-generated-id".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Fal: submit request and webhook binding
// ---------------------------------------------------------------------------

#[test]
fn fal_submit_request_has_required_fields() {
    let api = FalApi;
    let req = request(JobKind::Image, "fal-ai/flux/dev");
    let (url, headers, body) = api.build_submit_request(&req, "fal-key", None);

    assert_eq!(url, "https://queue.fal.run/fal-ai/flux/dev");
    assert!(headers.iter().any(|(k, v)| k == "Authorization" && v == "Key fal-key"));
    assert_eq!(body["prompt"], "a lighthouse at dusk");
    assert_eq!(body["image_url"], "https://cdn.example.com/ref.jpg");
    assert_eq!(body["aspect_ratio"], "16:9");
}

#[test]
fn fal_binds_webhook_as_query_parameter() {
    assert_eq!(
        FalApi.webhook_binding(),
        WebhookBinding::QueryParam { name: "fal_webhook" }
    );
}

#[test]
fn explicit_options_are_not_overridden_by_passthrough() {
    let api = FalApi;
    let mut req = request(JobKind::Image, "fal-ai/flux/dev");
    req.options
        .insert("prompt".to_string(), serde_json::json!("injected"));
    let (_, _, body) = api.build_submit_request(&req, "fal-key", None);
    assert_eq!(body["prompt"], "a lighthouse at dusk");
}

// ---------------------------------------------------------------------------
// Runway: webhook travels in the body
// ---------------------------------------------------------------------------

#[test]
fn runway_submit_request_carries_webhook_in_body() {
    let api = RunwayApi;
    let req = request(JobKind::Video, "gen4_turbo");
    let callback = "https://api.example.com/hook?provider=runway";
    let (url, headers, body) = api.build_submit_request(&req, "rw-key", Some(callback));

    assert_eq!(url, "https://api.dev.runwayml.com/v1/image_to_video");
    assert!(headers.iter().any(|(k, v)| k == "Authorization" && v == "Bearer rw-key"));
    assert!(headers.iter().any(|(k, _)| k == "X-Runway-Version"));
    assert_eq!(body["model"], "gen4_turbo");
    assert_eq!(body["promptText"], "a lighthouse at dusk");
    assert_eq!(body["promptImage"], "https://cdn.example.com/ref.jpg");
    assert_eq!(body["webhookUrl"], callback);
}

// ---------------------------------------------------------------------------
// Luma: sync submit, no webhook, polling contract
// ---------------------------------------------------------------------------

#[test]
fn luma_has_no_webhook_binding() {
    assert_eq!(LumaApi.webhook_binding(), WebhookBinding::None);
}

#[test]
fn luma_submit_request_builds_keyframes_from_media_ref() {
    let api = LumaApi;
    let req = request(JobKind::Video, "ray-2");
    let (url, _, body) = api.build_submit_request(&req, "luma-key", None);

    assert_eq!(url, "https://api.lumalabs.ai/dream-machine/v1/generations");
    assert_eq!(body["model"], "ray-2");
    assert_eq!(
        body["keyframes"]["frame0"]["url"],
        "https://cdn.example.com/ref.jpg"
    );
}

#[test]
fn poll_bounds_depend_on_job_kind() {
    let api = LumaApi;
    assert_eq!(api.poll_interval(), std::time::Duration::from_secs(5));
    assert_eq!(api.max_poll_attempts(JobKind::Image), 15);
    assert_eq!(api.max_poll_attempts(JobKind::Video), 60);
}

#[test]
fn luma_poll_response_maps_states() {
    let api = LumaApi;
    for state in ["queued", "dreaming"] {
        let body = format!(r#"{{"state": "{state}"}}"#);
        assert!(matches!(
            api.parse_poll_response(body.as_bytes()).unwrap(),
            PollOutcome::InProgress
        ));
    }

    let body = br#"{"state": "completed", "assets": {"video": "https://cdn.lumalabs.ai/v.mp4"}}"#;
    match api.parse_poll_response(body).unwrap() {
        PollOutcome::Completed { result_url } => {
            assert_eq!(result_url, "https://cdn.lumalabs.ai/v.mp4");
        }
        other => panic!("expected Completed, got {other:?}"),
    }

    let body = br#"{"state": "failed", "failure_reason": "content policy"}"#;
    match api.parse_poll_response(body).unwrap() {
        PollOutcome::Failed { message } => assert_eq!(message, "content policy"),
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[test]
fn luma_poll_response_missing_state_is_a_parse_error() {
    let api = LumaApi;
    assert!(api.parse_poll_response(br#"{"id": "x"}"#).is_err());
}

// ---------------------------------------------------------------------------
// Callback-URL encoding round trip
// ---------------------------------------------------------------------------

#[test]
fn callback_url_with_nested_query_round_trips() {
    // The provider decodes the embedded parameter value; after decoding it
    // must equal the configured URL exactly.
    let configured = "https://api.example.com/webhooks/generation?provider=fal&token=s3cr3t";
    let embedded = encode_query_value(configured);
    assert!(!embedded.contains('?'));
    assert!(!embedded.contains('&'));
    assert_eq!(decode_query_value(&embedded), configured);
}

#[test]
fn encoding_handles_percent_and_space() {
    let configured = "https://api.example.com/hook?note=50% off&x=a b";
    assert_eq!(decode_query_value(&encode_query_value(configured)), configured);
}

// ---------------------------------------------------------------------------
// Task-id extraction: ordered fallback
// ---------------------------------------------------------------------------

#[test]
fn fal_task_id_prefers_request_id() {
    let api = FalApi;
    let body = br#"{"request_id": "req-9", "gateway_request_id": "gw-9"}"#;
    assert_eq!(
        extract_task_id(body, api.task_id_fields(), "client-1"),
        "req-9"
    );
}

#[test]
fn fal_task_id_falls_back_to_gateway_id() {
    let api = FalApi;
    let body = br#"{"gateway_request_id": "gw-9"}"#;
    assert_eq!(
        extract_task_id(body, api.task_id_fields(), "client-1"),
        "gw-9"
    );
}

#[test]
fn runway_task_id_falls_back_to_provider_id_field() {
    let api = RunwayApi;
    let body = br#"{"id": "task-uuid"}"#;
    assert_eq!(
        extract_task_id(body, api.task_id_fields(), "client-1"),
        "task-uuid"
    );
}

#[test]
fn unrecognized_response_uses_client_generated_id() {
    // Ambiguous id parsing never fails the submission.
    let api = RunwayApi;
    assert_eq!(
        extract_task_id(br#"{"accepted": true}"#, api.task_id_fields(), "client-1"),
        "client-1"
    );
}

// ---------------------------------------------------------------------------
// Provider enum plumbing
// ---------------------------------------------------------------------------

#[test]
fn provider_names_round_trip() {
    for provider in [Provider::Fal, Provider::Runway, Provider::Luma] {
        assert_eq!(Provider::parse(provider.as_str()), Some(provider));
        assert_eq!(api_for(provider).provider(), provider);
    }
    assert_eq!(Provider::parse("unknown"), None);
}
