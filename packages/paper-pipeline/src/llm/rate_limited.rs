//! Rate-limited provider wrapper.
//!
//! Wraps any LlmProvider with a request quota using the governor crate.

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use rust_decimal::Decimal;
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::error::ProviderResult;
use crate::traits::provider::{LlmProvider, LlmRequest, LlmResponse, ProviderStatus};
use crate::types::extraction::TokenUsage;

type DefaultRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// A provider wrapper that enforces a request quota.
///
/// Time spent waiting for a permit counts against the caller's request
/// timeout.
pub struct RateLimitedProvider<P: LlmProvider> {
    inner: P,
    limiter: Arc<DefaultRateLimiter>,
}

impl<P: LlmProvider> RateLimitedProvider<P> {
    /// Allow `requests_per_second` calls per second. Zero is treated as one.
    pub fn new(provider: P, requests_per_second: u32) -> Self {
        Self::with_quota(provider, Quota::per_second(non_zero(requests_per_second)))
    }

    /// Create with a custom quota (per-minute limits, for example).
    pub fn with_quota(provider: P, quota: Quota) -> Self {
        Self {
            inner: provider,
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    /// Sustained rate with a burst allowance.
    pub fn with_burst(provider: P, requests_per_second: u32, burst: u32) -> Self {
        let quota = Quota::per_second(non_zero(requests_per_second)).allow_burst(non_zero(burst));
        Self::with_quota(provider, quota)
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

fn non_zero(n: u32) -> NonZeroU32 {
    NonZeroU32::new(n).unwrap_or(NonZeroU32::MIN)
}

#[async_trait]
impl<P: LlmProvider> LlmProvider for RateLimitedProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn extract(&self, request: &LlmRequest) -> ProviderResult<LlmResponse> {
        self.limiter.until_ready().await;
        self.inner.extract(request).await
    }

    fn cost(&self, usage: &TokenUsage) -> Decimal {
        self.inner.cost(usage)
    }

    async fn health(&self) -> ProviderStatus {
        self.inner.health().await
    }
}

/// Extension trait for easy rate limiting.
pub trait ProviderExt: LlmProvider + Sized {
    /// Wrap this provider with rate limiting.
    fn rate_limited(self, requests_per_second: u32) -> RateLimitedProvider<Self> {
        RateLimitedProvider::new(self, requests_per_second)
    }

    /// Wrap with rate limiting and burst support.
    fn rate_limited_with_burst(self, requests_per_second: u32, burst: u32) -> RateLimitedProvider<Self> {
        RateLimitedProvider::with_burst(self, requests_per_second, burst)
    }
}

impl<P: LlmProvider + Sized> ProviderExt for P {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvider;
    use std::time::Instant;

    #[tokio::test]
    async fn test_rate_limiting() {
        let mock = MockProvider::new("paced").with_default_response("{}");
        let provider = mock.rate_limited(2);

        let start = Instant::now();
        for _ in 0..3 {
            provider.extract(&LlmRequest::new("prompt", 16)).await.unwrap();
        }
        let elapsed = start.elapsed();

        // First call is immediate, the next two wait for the quota.
        assert!(elapsed.as_millis() >= 500, "rate limiting not applied: {elapsed:?}");
        assert_eq!(provider.inner().calls(), 3);
    }

    #[test]
    fn test_wrapper_delegates_identity() {
        let provider = MockProvider::new("named").rate_limited_with_burst(5, 10);
        assert_eq!(provider.name(), "named");
        assert_eq!(provider.cost(&TokenUsage::new(10, 10)), MockProvider::new("x").cost(&TokenUsage::new(10, 10)));
    }

    #[test]
    fn test_zero_rate_is_clamped() {
        let _provider = MockProvider::new("zero").rate_limited(0);
    }
}
