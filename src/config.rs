use std::collections::HashMap;
use std::env;

use crate::providers::Provider;

/// Per-provider credentials: the submission API key and the secret expected
/// on inbound webhooks.
#[derive(Clone)]
pub struct ProviderCredentials {
    pub api_key: String,
    pub webhook_secret: Option<String>,
}

impl std::fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("api_key", &"[REDACTED]")
            .field("webhook_secret", &"[REDACTED]")
            .finish()
    }
}

pub struct Config {
    pub providers: HashMap<Provider, ProviderCredentials>,
    /// Base URL advertised to providers for webhook callbacks,
    /// e.g. `https://api.example.com/webhooks/generation`.
    pub callback_base_url: Option<String>,
    pub push_gateway_url: Option<String>,
    pub listen_addr: String,
}

impl Config {
    pub fn from_env() -> Self {
        let mut providers = HashMap::new();

        if let Ok(key) = env::var("FAL_API_KEY") {
            providers.insert(
                Provider::Fal,
                ProviderCredentials {
                    api_key: key,
                    webhook_secret: env::var("FAL_WEBHOOK_SECRET").ok(),
                },
            );
        } else {
            tracing::warn!("FAL_API_KEY not set — fal image generation unavailable");
        }

        if let Ok(key) = env::var("RUNWAY_API_KEY") {
            providers.insert(
                Provider::Runway,
                ProviderCredentials {
                    api_key: key,
                    webhook_secret: env::var("RUNWAY_WEBHOOK_SECRET").ok(),
                },
            );
        } else {
            tracing::warn!("RUNWAY_API_KEY not set — runway video generation unavailable");
        }

        if let Ok(key) = env::var("LUMA_API_KEY") {
            providers.insert(
                Provider::Luma,
                ProviderCredentials {
                    api_key: key,
                    webhook_secret: env::var("LUMA_WEBHOOK_SECRET").ok(),
                },
            );
        } else {
            tracing::warn!("LUMA_API_KEY not set — luma generation unavailable");
        }

        if providers.is_empty() {
            tracing::error!("no providers configured — submissions will fail");
        }

        let callback_base_url = env::var("CALLBACK_BASE_URL").ok();
        if callback_base_url.is_none() {
            tracing::warn!(
                "CALLBACK_BASE_URL not set — webhook-capable providers fall back to polling"
            );
        }

        Config {
            providers,
            callback_base_url,
            push_gateway_url: env::var("PUSH_GATEWAY_URL").ok(),
            listen_addr: env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
        }
    }

    pub fn api_key(&self, provider: Provider) -> Option<&str> {
        self.providers.get(&provider).map(|c| c.api_key.as_str())
    }

    /// Webhook secrets for the reconciler, keyed by provider. Providers
    /// without a configured secret reject all callbacks.
    pub fn webhook_secrets(&self) -> HashMap<Provider, String> {
        self.providers
            .iter()
            .filter_map(|(p, c)| c.webhook_secret.clone().map(|s| (*p, s)))
            .collect()
    }

    /// The callback URL a given provider should deliver to, carrying the
    /// provider discriminator (and, for query-token providers, the secret).
    pub fn callback_url_for(&self, provider: Provider) -> Option<String> {
        let base = self.callback_base_url.as_ref()?;
        let secret = self
            .providers
            .get(&provider)
            .and_then(|c| c.webhook_secret.as_deref());
        Some(match secret {
            Some(secret) => format!("{base}?provider={provider}&token={secret}"),
            None => format!("{base}?provider={provider}"),
        })
    }
}
