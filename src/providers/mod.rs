pub mod apis;
pub mod dispatch;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MirageError;

/// External generation provider. Fal and Runway deliver completion via
/// webhook; Luma only supports synchronous submit plus client-side polling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Fal,
    Runway,
    Luma,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fal => "fal",
            Self::Runway => "runway",
            Self::Luma => "luma",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fal" => Some(Self::Fal),
            "runway" => Some(Self::Runway),
            "luma" => Some(Self::Luma),
            _ => None,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Image,
    Video,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
        }
    }
}

/// Internal request type — all provider backends accept this. Media
/// references point at already-uploaded durable storage; this layer never
/// touches local files.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    pub kind: JobKind,
    pub model: String,
    pub prompt: String,
    /// Reference image/video URLs already in durable storage.
    pub media_refs: Vec<String>,
    pub aspect_ratio: Option<String>,
    /// Model-specific parameters passed through to the provider body.
    pub options: serde_json::Map<String, serde_json::Value>,
    /// Task id generated client-side before submission. Used as the
    /// last-resort identifier when the provider response carries none.
    pub client_task_id: String,
}

/// Normalized submission outcome: the correlation key for webhook matching.
#[derive(Clone, Debug)]
pub struct SubmitReceipt {
    pub task_id: String,
}

/// How a provider expects the callback URL to be delivered at submit time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WebhookBinding {
    /// Appended as a query parameter on the submission URL. The embedded
    /// URL must be percent-encoded so its own query string survives the
    /// provider's query parser.
    QueryParam { name: &'static str },
    /// Carried as a top-level field in the JSON submission body.
    BodyField { name: &'static str },
    /// No webhook support — the client polls for completion.
    None,
}

/// Result of polling a synchronous-submit provider for completion.
#[derive(Debug)]
pub enum PollOutcome {
    InProgress,
    Completed { result_url: String },
    Failed { message: String },
}

/// Provider-specific request/response handling for generation APIs.
pub trait GenerationApi: Send + Sync {
    fn provider(&self) -> Provider;

    /// Build the submit request. Returns (url, headers, body). `callback_url`
    /// is already bound per `webhook_binding()` by the dispatcher — body-field
    /// bindings receive it here, query-param bindings see it on the URL.
    fn build_submit_request(
        &self,
        req: &GenerationRequest,
        api_key: &str,
        callback_url: Option<&str>,
    ) -> (String, Vec<(String, String)>, serde_json::Value);

    /// Ordered list of response fields that may carry the provider task id,
    /// tried first to last.
    fn task_id_fields(&self) -> &'static [&'static str];

    fn webhook_binding(&self) -> WebhookBinding;

    /// Build the status-poll request. Returns (url, headers). Only meaningful
    /// for providers with `WebhookBinding::None`.
    fn build_poll_request(&self, task_id: &str, api_key: &str) -> (String, Vec<(String, String)>);

    /// Parse the poll response to determine job status.
    fn parse_poll_response(&self, body: &[u8]) -> Result<PollOutcome, MirageError>;

    /// Fixed delay between polls.
    fn poll_interval(&self) -> Duration {
        Duration::from_secs(5)
    }

    /// Maximum poll attempts before the job is declared timed out.
    fn max_poll_attempts(&self, kind: JobKind) -> u32 {
        match kind {
            JobKind::Image => 15,
            JobKind::Video => 60,
        }
    }
}

/// Percent-encode a value for embedding inside a query string. Everything
/// outside RFC 3986 unreserved is escaped — in particular `?`, `&`, `=`, `%`
/// and `#`, so a callback URL that itself carries query parameters is not
/// mis-split by the provider's query parser.
pub fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
    out
}

/// Decode a percent-encoded query value. Invalid escapes are passed through
/// verbatim rather than rejected.
pub fn decode_query_value(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push((hi << 4) | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Extract the provider task id from a submit response by probing an ordered
/// list of field names, falling back to the client-generated id. Submission
/// never fails solely because id parsing is ambiguous.
pub fn extract_task_id(body: &[u8], fields: &[&str], client_task_id: &str) -> String {
    let Ok(v) = serde_json::from_slice::<serde_json::Value>(body) else {
        return client_task_id.to_string();
    };
    for field in fields {
        if let Some(id) = v[*field].as_str() {
            if !id.is_empty() {
                return id.to_string();
            }
        }
    }
    client_task_id.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_escapes_reserved_query_characters() {
        let url = "https://api.example.com/hook?provider=fal&token=s3cr3t";
        let encoded = encode_query_value(url);
        assert!(!encoded.contains('?'));
        assert!(!encoded.contains('&'));
        assert!(!encoded.contains('='));
        assert!(encoded.contains("%3F"));
        assert!(encoded.contains("%26"));
    }

    #[test]
    fn encode_decode_round_trips() {
        let url = "https://api.example.com/hook?provider=fal&token=a%20b#frag";
        assert_eq!(decode_query_value(&encode_query_value(url)), url);
    }

    #[test]
    fn decode_passes_invalid_escapes_through() {
        assert_eq!(decode_query_value("%zz"), "%zz");
        assert_eq!(decode_query_value("100%"), "100%");
        assert_eq!(decode_query_value("%4"), "%4");
        // A percent followed by multibyte UTF-8 must survive verbatim, not
        // panic on a mid-character slice.
        assert_eq!(decode_query_value("%a€"), "%a€");
    }

    #[test]
    fn extract_task_id_probes_fields_in_order() {
        let body = br#"{"gateway_request_id": "gw-1", "request_id": "req-1"}"#;
        let id = extract_task_id(body, &["request_id", "gateway_request_id"], "client-1");
        assert_eq!(id, "req-1");
    }

    #[test]
    fn extract_task_id_falls_back_to_client_id() {
        assert_eq!(
            extract_task_id(br#"{"status": "queued"}"#, &["request_id"], "client-1"),
            "client-1"
        );
        // Unparseable body also falls back instead of failing the submission.
        assert_eq!(extract_task_id(b"not json", &["request_id"], "client-1"), "client-1");
        // Empty-string ids are skipped.
        assert_eq!(
            extract_task_id(br#"{"request_id": ""}"#, &["request_id"], "client-1"),
            "client-1"
        );
    }
}
