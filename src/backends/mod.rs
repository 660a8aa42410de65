//! Backend adapters: one per provider
//!
//! Each adapter translates the common request shape into the provider's
//! native JSON dialect, applies its authentication scheme, and parses the
//! response back into a unified completion. Cost is computed here, at the
//! adapter boundary, using the configured pricing table and FX rate.

mod anthropic;
mod google;
mod openai_compat;

pub use anthropic::AnthropicBackend;
pub use google::GoogleBackend;
pub use openai_compat::OpenAiCompatBackend;

use crate::config::{Config, ModelPricing};
use crate::error::{AppResult, ErrorKind, RouterError};
use crate::registry::{ModelEntry, Provider};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Multimodal payload attached to a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagePayload {
    /// MIME type, e.g. `image/png`
    pub media_type: String,
    /// Base64-encoded image bytes
    pub data: String,
}

impl ImagePayload {
    /// RFC 2397 data URL, the form OpenAI-compatible APIs take images in.
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.data)
    }
}

/// A prior exchange supplied as context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

/// The provider-independent request shape.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub image: Option<ImagePayload>,
    pub history: Vec<HistoryMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            image: None,
            history: Vec::new(),
            max_tokens: 2048,
            temperature: 0.7,
        }
    }
}

/// What an adapter extracts from a provider response.
#[derive(Debug, Clone)]
pub struct RawCompletion {
    pub text: String,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
}

/// The unified response shape handed to the executor.
#[derive(Debug, Clone, Serialize)]
pub struct Completion {
    pub text: String,
    /// Registry key of the model that produced the text
    pub model_key: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// Cost in display currency (FX rate applied)
    pub cost: f64,
    /// For local completions, what the default cloud model would have charged
    pub saved_cost: f64,
}

/// One LLM provider's code path.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> AppResult<RawCompletion>;

    /// Rough token count used when the provider reports no usage.
    fn count_tokens(&self, text: &str) -> u64 {
        (text.chars().count() as u64 + 3) / 4
    }

    /// Check that the configured credential is accepted by the provider.
    async fn validate_credentials(&self) -> AppResult<bool>;
}

/// Construct the adapter for a registry entry.
pub fn backend_for(
    entry: &ModelEntry,
    client: &reqwest::Client,
) -> AppResult<Box<dyn Backend>> {
    match entry.provider {
        Provider::Local => {
            let runtime = entry.runtime.as_ref().ok_or_else(|| {
                RouterError::Config(format!(
                    "local entry '{}' has no runtime descriptor",
                    entry.id
                ))
            })?;
            Ok(Box::new(OpenAiCompatBackend::new(
                client.clone(),
                runtime.openai_base(),
                entry.id.clone(),
                None,
            )))
        }
        Provider::Anthropic => Ok(Box::new(AnthropicBackend::new(
            client.clone(),
            Provider::Anthropic.base_url(),
            entry.id.clone(),
            require_key(Provider::Anthropic)?,
        ))),
        Provider::Google => Ok(Box::new(GoogleBackend::new(
            client.clone(),
            Provider::Google.base_url(),
            entry.id.clone(),
            require_key(Provider::Google)?,
        ))),
        provider => Ok(Box::new(OpenAiCompatBackend::new(
            client.clone(),
            provider.base_url(),
            entry.id.clone(),
            Some(require_key(provider)?),
        ))),
    }
}

fn require_key(provider: Provider) -> AppResult<String> {
    let env_key = provider
        .env_key()
        .expect("cloud providers always name an env key");
    match std::env::var(env_key) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(RouterError::Backend {
            endpoint: provider.as_str().to_string(),
            kind: ErrorKind::Auth,
            message: format!("credential missing: {env_key} is not set"),
            retry_after: None,
        }),
    }
}

/// Turn a raw completion into the unified shape, accounting cost.
///
/// Local models are free, but we still compute the would-have-been cost of
/// sending the same tokens to the default cloud model, which feeds the
/// savings statistic.
pub fn finalize(
    entry: &ModelEntry,
    backend: &dyn Backend,
    request: &GenerateRequest,
    raw: RawCompletion,
    config: &Config,
    default_cloud_pricing: ModelPricing,
) -> Completion {
    let tokens_in = raw
        .tokens_in
        .unwrap_or_else(|| backend.count_tokens(&request.prompt));
    let tokens_out = raw
        .tokens_out
        .unwrap_or_else(|| backend.count_tokens(&raw.text));

    let fx = config.cost.fx_rate;
    let price = |pricing: ModelPricing| {
        (tokens_in as f64 / 1e6 * pricing.input + tokens_out as f64 / 1e6 * pricing.output) * fx
    };

    let (cost, saved_cost) = if entry.is_local() {
        (0.0, price(default_cloud_pricing))
    } else {
        (price(entry.pricing), 0.0)
    };

    Completion {
        text: raw.text,
        model_key: entry.key(),
        tokens_in,
        tokens_out,
        cost,
        saved_cost,
    }
}

/// Parse a `Retry-After` header (seconds form) into a duration.
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Build the `malformed-response` error adapters share.
pub(crate) fn malformed(endpoint: &str, detail: &str) -> RouterError {
    RouterError::Backend {
        endpoint: endpoint.to_string(),
        kind: ErrorKind::MalformedResponse,
        message: format!("cannot extract generation text: {detail}"),
        retry_after: None,
    }
}

/// Shared non-2xx handling: reads the body and classifies by status.
pub(crate) async fn fail_from_response(
    endpoint: &str,
    response: reqwest::Response,
) -> RouterError {
    let status = response.status().as_u16();
    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    crate::error::classify_status(endpoint, status, &body, retry_after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::Provider;
    use std::str::FromStr;

    struct NullBackend;

    #[async_trait]
    impl Backend for NullBackend {
        async fn generate(&self, _request: &GenerateRequest) -> AppResult<RawCompletion> {
            unreachable!("finalize tests never generate")
        }
        async fn validate_credentials(&self) -> AppResult<bool> {
            Ok(true)
        }
    }

    fn config() -> Config {
        Config::from_str(crate::config::test_config_yaml()).unwrap()
    }

    fn cloud_pricing() -> ModelPricing {
        ModelPricing {
            input: 3.0,
            output: 15.0,
        }
    }

    #[test]
    fn token_estimate_rounds_up() {
        let backend = NullBackend;
        assert_eq!(backend.count_tokens(""), 0);
        assert_eq!(backend.count_tokens("abc"), 1);
        assert_eq!(backend.count_tokens("abcd"), 1);
        assert_eq!(backend.count_tokens("abcde"), 2);
    }

    #[test]
    fn finalize_prices_cloud_usage() {
        let entry = crate::registry::tests::cloud_entry(Provider::Anthropic, "claude-sonnet-4-5");
        let raw = RawCompletion {
            text: "answer".to_string(),
            tokens_in: Some(1_000_000),
            tokens_out: Some(1_000_000),
        };
        let request = GenerateRequest::new("question");
        let completion = finalize(&entry, &NullBackend, &request, raw, &config(), cloud_pricing());

        assert_eq!(completion.model_key, "anthropic:claude-sonnet-4-5");
        // 1M in at $3 + 1M out at $15
        assert!((completion.cost - 18.0).abs() < 1e-9);
        assert_eq!(completion.saved_cost, 0.0);
    }

    #[test]
    fn finalize_computes_local_savings() {
        let entry = crate::registry::tests::local_entry("qwen3-4b", true);
        let raw = RawCompletion {
            text: "answer".to_string(),
            tokens_in: Some(2_000_000),
            tokens_out: Some(1_000_000),
        };
        let request = GenerateRequest::new("question");
        let completion = finalize(&entry, &NullBackend, &request, raw, &config(), cloud_pricing());

        assert_eq!(completion.cost, 0.0);
        // Would have been 2M*$3 + 1M*$15 on the default cloud model
        assert!((completion.saved_cost - 21.0).abs() < 1e-9);
    }

    #[test]
    fn finalize_applies_fx_rate() {
        let mut config = config();
        config.cost.fx_rate = 150.0;
        let entry = crate::registry::tests::cloud_entry(Provider::Anthropic, "claude-sonnet-4-5");
        let raw = RawCompletion {
            text: "a".to_string(),
            tokens_in: Some(1_000_000),
            tokens_out: Some(0),
        };
        let request = GenerateRequest::new("q");
        let completion = finalize(&entry, &NullBackend, &request, raw, &config, cloud_pricing());
        assert!((completion.cost - 450.0).abs() < 1e-6);
    }

    #[test]
    fn finalize_estimates_missing_usage() {
        let entry = crate::registry::tests::local_entry("qwen3-4b", true);
        let raw = RawCompletion {
            text: "12345678".to_string(), // 8 chars -> 2 tokens
            tokens_in: None,
            tokens_out: None,
        };
        let request = GenerateRequest::new("1234"); // 4 chars -> 1 token
        let completion = finalize(&entry, &NullBackend, &request, raw, &config(), cloud_pricing());
        assert_eq!(completion.tokens_in, 1);
        assert_eq!(completion.tokens_out, 2);
    }

    #[test]
    fn image_payload_data_url() {
        let image = ImagePayload {
            media_type: "image/png".to_string(),
            data: "QUJD".to_string(),
        };
        assert_eq!(image.to_data_url(), "data:image/png;base64,QUJD");
    }
}
