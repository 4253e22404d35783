use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MirageError {
    #[error("submission rejected by {provider}: {message}")]
    Submission {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("auth failed for {provider}: {message}")]
    AuthFailed { provider: String, message: String },

    #[error("polling exhausted after {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error("duplicate task id: {0}")]
    DuplicateTaskId(String),

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("no job found for task id: {0}")]
    JobNotFound(String),

    #[error("webhook auth failed for {provider}")]
    Unauthorized { provider: String },

    #[error("invalid amount: {0}")]
    InvalidAmount(Decimal),

    #[error("insufficient credits: balance {balance}, requested {requested}")]
    InsufficientCredits {
        balance: Decimal,
        requested: Decimal,
    },

    #[error("cancellation not allowed: {0}")]
    CancelNotAllowed(String),

    #[error("schema parse error: {0}")]
    SchemaParse(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl MirageError {
    /// Extract provider name from structured error variants.
    /// Returns None for variants that don't carry provider context.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::Submission { provider, .. } => Some(provider),
            Self::RateLimited { provider } => Some(provider),
            Self::AuthFailed { provider, .. } => Some(provider),
            Self::Unauthorized { provider } => Some(provider),
            _ => None,
        }
    }

    /// Returns true for transient errors that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Timeout { .. } => true,
            Self::Submission { status, .. } => {
                // 5xx = server error (retryable), 4xx = client error (not retryable)
                // status: None = ambiguous (not from HTTP) → safe default: NOT retryable
                status.is_some_and(|s| s >= 500)
            }
            Self::Request(_) => true, // connection errors may be transient
            _ => false,
        }
    }

    /// True for errors that mean "already handled": duplicate webhook
    /// deliveries and replayed transitions land here and are benign.
    pub fn is_benign_replay(&self) -> bool {
        matches!(
            self,
            Self::DuplicateTaskId(_) | Self::InvalidTransition { .. }
        )
    }

    /// Produce a sanitized message safe for showing in the app.
    /// Does not leak internal URLs, secrets, or upstream error bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::Submission { provider, .. } => {
                format!("{provider} could not accept the request — try again")
            }
            Self::RateLimited { provider } => {
                format!("rate limited by {provider} — try again shortly")
            }
            Self::AuthFailed { provider, .. } => {
                format!("authentication failed for {provider}")
            }
            Self::Timeout { .. } => "generation timed out — you were not charged".to_string(),
            Self::InsufficientCredits {
                balance, requested, ..
            } => {
                format!("not enough credits: have {balance}, need {requested}")
            }
            Self::InvalidAmount(_) => "invalid credit amount".to_string(),
            Self::CancelNotAllowed(reason) => format!("cannot cancel: {reason}"),
            Self::SchemaParse(_) => "failed to parse provider response".to_string(),
            Self::Request(_) => "request to provider failed".to_string(),
            // Internal consistency errors are never surfaced as user errors.
            Self::DuplicateTaskId(_)
            | Self::InvalidTransition { .. }
            | Self::JobNotFound(_)
            | Self::Unauthorized { .. } => "request already handled".to_string(),
            Self::Other(msg) => msg.clone(),
        }
    }
}
