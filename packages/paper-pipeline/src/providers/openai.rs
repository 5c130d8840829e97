//! OpenAI-compatible chat completions provider.
//!
//! # Example
//!
//! ```rust,ignore
//! use paper_pipeline::providers::OpenAiProvider;
//!
//! let provider = OpenAiProvider::from_env()?.with_model("gpt-4o-mini");
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ConfigError, FatalKind, ProviderError, ProviderResult, TransientKind};
use crate::llm::ProviderFactory;
use crate::traits::provider::{LlmProvider, LlmRequest, LlmResponse, TokenPricing};
use crate::types::extraction::TokenUsage;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const SYSTEM_PROMPT: &str =
    "You extract structured information from research papers. Respond with JSON only.";

/// Per-million-token list prices, USD.
fn list_pricing(model: &str) -> TokenPricing {
    let (input, output) = match model {
        m if m.starts_with("gpt-4o-mini") => (Decimal::new(15, 2), Decimal::new(60, 2)),
        m if m.starts_with("gpt-4o") => (Decimal::new(250, 2), Decimal::new(1000, 2)),
        m if m.starts_with("gpt-4.1-mini") => (Decimal::new(40, 2), Decimal::new(160, 2)),
        m if m.starts_with("gpt-4.1") => (Decimal::new(200, 2), Decimal::new(800, 2)),
        // Unknown models are priced high so budgets err on the safe side.
        _ => (Decimal::new(1000, 2), Decimal::new(3000, 2)),
    };
    TokenPricing::new(input, output)
}

/// Chat completions client for OpenAI and API-compatible gateways.
pub struct OpenAiProvider {
    name: String,
    client: Client,
    api_key: SecretString,
    base_url: String,
    model: String,
    pricing: TokenPricing,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            name: "openai".to_string(),
            client: Client::new(),
            api_key: SecretString::from(api_key.into()),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            pricing: list_pricing(DEFAULT_MODEL),
        }
    }

    /// Create from `OPENAI_API_KEY`, honouring `OPENAI_BASE_URL` and
    /// `OPENAI_MODEL` when set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ConfigError::Missing("OPENAI_API_KEY not set".into()))?;
        let mut provider = Self::new(api_key);
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            provider = provider.with_base_url(url);
        }
        if let Ok(model) = std::env::var("OPENAI_MODEL") {
            provider = provider.with_model(model);
        }
        Ok(provider)
    }

    /// Name used in the fallback chain (default: `openai`).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the chat model. Resets pricing to the model's list price.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self.pricing = list_pricing(&self.model);
        self
    }

    /// Set a custom base URL (for Azure, proxies, etc.).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Override list pricing (negotiated rates, gateways).
    pub fn with_pricing(mut self, pricing: TokenPricing) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Map an HTTP error status onto the provider error taxonomy.
fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ProviderError {
    let message = format!("HTTP {status}: {}", truncate(body, 300));
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::Transient {
            kind: TransientKind::RateLimited,
            message,
            retry_after,
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ProviderError::Transient {
            kind: TransientKind::Timeout,
            message,
            retry_after,
        },
        s if s.is_server_error() => ProviderError::Transient {
            kind: TransientKind::ServerError,
            message,
            retry_after,
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::fatal(FatalKind::Unauthorized, message)
        }
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::NOT_FOUND => {
            ProviderError::fatal(FatalKind::MalformedRequest, message)
        }
        _ => ProviderError::fatal(FatalKind::Other, message),
    }
}

/// `Retry-After` in seconds. HTTP-date values are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn extract(&self, request: &LlmRequest) -> ProviderResult<LlmResponse> {
        let start = std::time::Instant::now();
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            temperature: 0.0,
            max_tokens: request.max_output_tokens,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!(provider = %self.name, error = %e, "OpenAI request failed");
                if e.is_timeout() {
                    ProviderError::transient(TransientKind::Timeout, e.to_string())
                } else {
                    ProviderError::transient(TransientKind::Network, e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let wait = retry_after(response.headers());
            let error_text = response.text().await.unwrap_or_default();
            warn!(provider = %self.name, status = %status, error = %error_text, "OpenAI API error");
            return Err(classify_status(status, wait, &error_text));
        }

        let chat: ChatResponse = response.json().await.map_err(|e| {
            ProviderError::transient(TransientKind::ServerError, format!("unreadable response: {e}"))
        })?;

        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                ProviderError::transient(TransientKind::ServerError, "no choices in response")
            })?;

        let usage = chat
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_else(|| TokenUsage::estimate(&request.prompt, request.max_output_tokens));

        debug!(
            provider = %self.name,
            model = %self.model,
            duration_ms = start.elapsed().as_millis() as u64,
            tokens = usage.total(),
            "OpenAI chat completion"
        );

        Ok(LlmResponse::new(
            content,
            chat.model.unwrap_or_else(|| self.model.clone()),
            usage,
        ))
    }

    fn cost(&self, usage: &TokenUsage) -> Decimal {
        self.pricing.cost(usage)
    }
}

/// Register the `openai` provider, built from the environment on demand.
pub fn register_openai(factory: &mut ProviderFactory) -> &mut ProviderFactory {
    factory.register("openai", || {
        let provider: Arc<dyn LlmProvider> = Arc::new(OpenAiProvider::from_env()?);
        Ok(provider)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_status_classification() {
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(7)), "slow down");
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));

        assert!(classify_status(StatusCode::BAD_GATEWAY, None, "").is_retryable());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, None, "").is_retryable());

        let err = classify_status(StatusCode::UNAUTHORIZED, None, "bad key");
        assert!(matches!(err, ProviderError::Fatal { kind: FatalKind::Unauthorized, .. }));

        let err = classify_status(StatusCode::BAD_REQUEST, None, "context length exceeded");
        assert!(matches!(err, ProviderError::Fatal { kind: FatalKind::MalformedRequest, .. }));
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(12)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_model_pricing() {
        let provider = OpenAiProvider::new("sk-test").with_model("gpt-4o-2024-08-06");
        let cost = provider.cost(&TokenUsage::new(1_000_000, 0));
        assert_eq!(cost, Decimal::new(250, 2));

        let mini = OpenAiProvider::new("sk-test");
        assert!(mini.cost(&TokenUsage::new(1_000, 1_000)) < provider.cost(&TokenUsage::new(1_000, 1_000)));
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let provider = OpenAiProvider::new("sk-test").with_base_url("http://localhost:8080/v1/");
        assert_eq!(provider.base_url, "http://localhost:8080/v1");
    }

    #[test]
    fn test_response_parsing_tolerates_missing_usage() {
        let chat: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":"{}"}}]}"#).unwrap();
        assert!(chat.usage.is_none());
        assert_eq!(chat.choices[0].message.content.as_deref(), Some("{}"));
    }
}
