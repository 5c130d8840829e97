//! LLM provider capability.
//!
//! The resilience layer is polymorphic over this trait. Providers are
//! interchangeable: the layer never branches on which concrete provider it
//! is talking to, only on the errors and costs it reports.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ProviderResult;
use crate::types::extraction::TokenUsage;

/// A single extraction request sent to a provider.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub prompt: String,

    /// Output-token allowance for this call
    pub max_output_tokens: u32,
}

impl LlmRequest {
    pub fn new(prompt: impl Into<String>, max_output_tokens: u32) -> Self {
        Self {
            prompt: prompt.into(),
            max_output_tokens,
        }
    }
}

/// A provider's reply.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
}

impl LlmResponse {
    pub fn new(content: impl Into<String>, model: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
            usage,
        }
    }
}

/// Self-reported provider status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ProviderStatus {
    Healthy,
    Degraded(String),
    Unavailable(String),
}

/// LLM provider trait.
///
/// Implementations wrap a specific vendor API and map its failures onto
/// [`ProviderError`](crate::error::ProviderError): timeouts, 5xx and rate
/// limits are transient; authorization and malformed requests are fatal.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Name used in the fallback order and in logs.
    fn name(&self) -> &str;

    /// Run one extraction prompt.
    async fn extract(&self, request: &LlmRequest) -> ProviderResult<LlmResponse>;

    /// Price of the given token usage.
    fn cost(&self, usage: &TokenUsage) -> Decimal;

    /// Current status as seen by the provider itself.
    async fn health(&self) -> ProviderStatus {
        ProviderStatus::Healthy
    }
}

#[async_trait]
impl<P: LlmProvider + ?Sized> LlmProvider for std::sync::Arc<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn extract(&self, request: &LlmRequest) -> ProviderResult<LlmResponse> {
        (**self).extract(request).await
    }

    fn cost(&self, usage: &TokenUsage) -> Decimal {
        (**self).cost(usage)
    }

    async fn health(&self) -> ProviderStatus {
        (**self).health().await
    }
}

/// Per-million-token pricing, the common shape of vendor price sheets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPricing {
    pub input_per_million: Decimal,
    pub output_per_million: Decimal,
}

impl TokenPricing {
    pub fn new(input_per_million: Decimal, output_per_million: Decimal) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    pub fn cost(&self, usage: &TokenUsage) -> Decimal {
        let million = Decimal::from(1_000_000u64);
        (Decimal::from(usage.prompt_tokens) * self.input_per_million
            + Decimal::from(usage.completion_tokens) * self.output_per_million)
            / million
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_pricing() {
        // $2.50 in / $10.00 out per million
        let pricing = TokenPricing::new(Decimal::new(250, 2), Decimal::new(1000, 2));
        let cost = pricing.cost(&TokenUsage::new(1_000_000, 500_000));
        assert_eq!(cost, Decimal::new(750, 2));
    }

    #[test]
    fn test_zero_usage_is_free() {
        let pricing = TokenPricing::new(Decimal::ONE, Decimal::ONE);
        assert_eq!(pricing.cost(&TokenUsage::default()), Decimal::ZERO);
    }
}
