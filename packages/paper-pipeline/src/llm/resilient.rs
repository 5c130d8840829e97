//! Resilient extraction over an ordered list of providers.
//!
//! Each provider has its own circuit breaker. A call walks the fallback
//! chain in order: an open breaker is skipped without a network attempt,
//! transient failures are retried with backoff, fatal failures move straight
//! to the next provider. Every network attempt first reserves its projected
//! cost with the budget tracker.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::breaker::{BreakerSnapshot, CircuitBreaker};
use super::budget::BudgetTracker;
use super::factory::ProviderFactory;
use super::retry::RetryPolicy;
use crate::error::{AttemptOutcome, ConfigError, LlmError, LlmResult, ProviderAttempt, ProviderError};
use crate::traits::clock::Clock;
use crate::traits::provider::{LlmProvider, LlmRequest, ProviderStatus};
use crate::types::config::{BreakerConfig, PipelineConfig, RetryConfig};
use crate::types::extraction::{ExtractionResult, TokenUsage};
use crate::types::requirement::ExtractionRequirement;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_MAX_TOKENS_PER_TARGET: u32 = 1024;

struct ProviderSlot {
    provider: Arc<dyn LlmProvider>,
    breaker: CircuitBreaker,
}

/// Health of one provider in the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider: String,
    pub breaker: BreakerSnapshot,
    pub status: ProviderStatus,
}

pub struct ResilientExtractor {
    slots: Vec<ProviderSlot>,
    retry: RetryPolicy,
    request_timeout: Duration,
    max_tokens_per_target: u32,
    clock: Arc<dyn Clock>,
}

impl ResilientExtractor {
    /// Providers are tried in the order given.
    pub fn new(
        providers: Vec<Arc<dyn LlmProvider>>,
        breaker: &BreakerConfig,
        retry: &RetryConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let slots = providers
            .into_iter()
            .map(|provider| ProviderSlot {
                breaker: CircuitBreaker::new(provider.name(), breaker, clock.clone()),
                provider,
            })
            .collect();
        Self {
            slots,
            retry: RetryPolicy::new(retry),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_tokens_per_target: DEFAULT_MAX_TOKENS_PER_TARGET,
            clock,
        }
    }

    /// Build the fallback chain named in `config.llm.providers`.
    pub fn from_config(
        factory: &ProviderFactory,
        config: &PipelineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let chain = factory.build_fallback_chain(&config.llm.providers)?;
        Ok(Self::new(chain, &config.breaker, &config.retry, clock)
            .with_request_timeout(Duration::from_millis(config.llm.request_timeout_ms))
            .with_max_tokens_per_target(config.budget.max_tokens_per_target))
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_tokens_per_target(mut self, tokens: u32) -> Self {
        self.max_tokens_per_target = tokens.max(1);
        self
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.provider.name()).collect()
    }

    /// Output-token allowance for a requirement set.
    pub fn max_output_tokens(&self, requirements: &ExtractionRequirement) -> u32 {
        let targets = u32::try_from(requirements.len().max(1)).unwrap_or(u32::MAX);
        self.max_tokens_per_target.saturating_mul(targets)
    }

    /// Run one extraction through the fallback chain.
    ///
    /// A budget rejection is returned immediately: no network call is made
    /// and no further provider is tried.
    pub async fn extract(
        &self,
        prompt: &str,
        requirements: &ExtractionRequirement,
        budget: &BudgetTracker,
    ) -> LlmResult<ExtractionResult> {
        if self.slots.is_empty() {
            return Err(LlmError::NoProviders);
        }

        let request = LlmRequest::new(prompt, self.max_output_tokens(requirements));
        let estimate = TokenUsage::estimate(prompt, request.max_output_tokens);
        let mut attempts = Vec::new();

        for slot in &self.slots {
            let name = slot.provider.name();
            let projected = slot.provider.cost(&estimate);
            let mut attempt = 0u32;
            let mut last_error: Option<ProviderError> = None;

            loop {
                let Some(permit) = slot.breaker.try_acquire() else {
                    debug!(provider = %name, "Circuit open, skipping provider");
                    attempts.push(ProviderAttempt {
                        provider: name.to_string(),
                        outcome: match last_error.take() {
                            Some(e) => AttemptOutcome::Failed {
                                message: e.to_string(),
                                retryable: e.is_retryable(),
                            },
                            None => AttemptOutcome::ShortCircuited,
                        },
                    });
                    break;
                };

                // Dropping the permit on this path frees a half-open trial.
                let reservation = budget.reserve(projected)?;
                attempt += 1;

                let outcome = match tokio::time::timeout(
                    self.request_timeout,
                    slot.provider.extract(&request),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::timeout(self.request_timeout)),
                };

                match outcome {
                    Ok(response) => {
                        permit.succeed();
                        let cost = slot.provider.cost(&response.usage);
                        reservation.commit(&response.usage, cost).await;
                        info!(
                            provider = %name,
                            model = %response.model,
                            attempt,
                            tokens = response.usage.total(),
                            %cost,
                            "Extraction succeeded"
                        );
                        return Ok(ExtractionResult {
                            provider: name.to_string(),
                            model: response.model,
                            content: response.content,
                            usage: response.usage,
                            cost,
                            requirement_hash: requirements.fingerprint(),
                            extracted_at: self.clock.now(),
                        });
                    }
                    Err(error) => {
                        permit.fail();
                        drop(reservation);

                        if self.retry.should_retry(attempt, &error) {
                            let delay = self.retry.delay_for(attempt, &error);
                            warn!(
                                provider = %name,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %error,
                                "Transient provider failure, retrying"
                            );
                            last_error = Some(error);
                            tokio::time::sleep(delay).await;
                            continue;
                        }

                        warn!(provider = %name, attempt, error = %error, "Provider failed, falling back");
                        attempts.push(ProviderAttempt {
                            provider: name.to_string(),
                            outcome: AttemptOutcome::Failed {
                                message: error.to_string(),
                                retryable: error.is_retryable(),
                            },
                        });
                        break;
                    }
                }
            }
        }

        warn!(attempts = attempts.len(), "All LLM providers unavailable");
        Err(LlmError::AllProvidersUnavailable { attempts })
    }

    /// True when every provider's breaker would short-circuit right now.
    pub fn all_circuits_open(&self) -> bool {
        !self.slots.is_empty() && self.slots.iter().all(|s| s.breaker.is_open())
    }

    /// Breaker state and self-reported status for every provider, in
    /// fallback order.
    pub async fn health_report(&self) -> Vec<ProviderHealth> {
        let mut report = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            report.push(ProviderHealth {
                provider: slot.provider.name().to_string(),
                breaker: slot.breaker.snapshot(),
                status: slot.provider.health().await,
            });
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Ceiling, FatalKind, TransientKind};
    use crate::llm::breaker::CircuitState;
    use crate::testing::{ManualClock, MockProvider};
    use crate::types::config::BudgetConfig;
    use crate::types::requirement::ExtractionTarget;
    use rust_decimal::Decimal;

    fn requirements() -> ExtractionRequirement {
        ExtractionRequirement::new([ExtractionTarget::new("method", "Core technique")])
    }

    fn extractor(providers: Vec<Arc<MockProvider>>, threshold: u32, attempts: u32) -> ResilientExtractor {
        ResilientExtractor::new(
            providers
                .into_iter()
                .map(|p| p as Arc<dyn LlmProvider>)
                .collect(),
            &BreakerConfig {
                failure_threshold: threshold,
                cooldown_ms: 60_000,
                max_cooldown_ms: 60_000,
            },
            &RetryConfig {
                max_attempts: attempts,
                base_delay_ms: 10,
                max_delay_ms: 100,
                multiplier: 2.0,
            },
            Arc::new(ManualClock::default()),
        )
        .with_max_tokens_per_target(100)
    }

    fn server_error() -> ProviderError {
        ProviderError::transient(TransientKind::ServerError, "503")
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let x = Arc::new(MockProvider::new("x").with_error(server_error()).with_response("{\"ok\":1}"));
        let ex = extractor(vec![x.clone()], 5, 3);

        let result = ex.extract("prompt", &requirements(), &BudgetTracker::unlimited()).await.unwrap();

        assert_eq!(result.provider, "x");
        assert_eq!(x.calls(), 2);
        assert_eq!(result.requirement_hash, requirements().fingerprint());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_failure_falls_back_immediately() {
        let x = Arc::new(MockProvider::new("x").with_error(ProviderError::fatal(FatalKind::Unauthorized, "401")));
        let y = Arc::new(MockProvider::new("y").with_default_response("{}"));
        let ex = extractor(vec![x.clone(), y.clone()], 5, 3);
        assert_eq!(ex.provider_names(), ["x", "y"]);

        let result = ex.extract("prompt", &requirements(), &BudgetTracker::unlimited()).await.unwrap();

        assert_eq!(result.provider, "y");
        assert_eq!(x.calls(), 1);
        assert_eq!(y.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_skips_provider_without_calling_it() {
        let x = Arc::new(MockProvider::new("x").failing_with(server_error()));
        let y = Arc::new(MockProvider::new("y").with_default_response("{}"));
        let ex = extractor(vec![x.clone(), y.clone()], 5, 1);
        let budget = BudgetTracker::unlimited();

        for _ in 0..5 {
            let r = ex.extract("prompt", &requirements(), &budget).await.unwrap();
            assert_eq!(r.provider, "y");
        }
        assert_eq!(x.calls(), 5);

        let r = ex.extract("prompt", &requirements(), &budget).await.unwrap();
        assert_eq!(r.provider, "y");
        assert_eq!(x.calls(), 5, "open breaker must not reach the provider");

        let health = ex.health_report().await;
        assert_eq!(health[0].breaker.state, CircuitState::Open);
        assert_eq!(health[1].breaker.state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_providers_unavailable_lists_attempts() {
        let x = Arc::new(MockProvider::new("x").failing_with(server_error()));
        let y = Arc::new(MockProvider::new("y").failing_with(ProviderError::fatal(FatalKind::MalformedRequest, "400")));
        let ex = extractor(vec![x, y], 2, 2);

        let err = ex.extract("prompt", &requirements(), &BudgetTracker::unlimited()).await.unwrap_err();
        let LlmError::AllProvidersUnavailable { attempts } = err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].provider, "x");
        assert!(matches!(attempts[0].outcome, AttemptOutcome::Failed { retryable: true, .. }));
        assert!(matches!(attempts[1].outcome, AttemptOutcome::Failed { retryable: false, .. }));

        // x's breaker opened after its two failures.
        let err = ex.extract("prompt", &requirements(), &BudgetTracker::unlimited()).await.unwrap_err();
        let LlmError::AllProvidersUnavailable { attempts } = err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(attempts[0].outcome, AttemptOutcome::ShortCircuited);
    }

    #[tokio::test]
    async fn test_budget_rejection_makes_no_call() {
        let x = Arc::new(MockProvider::new("x").with_default_response("{}").with_pricing(Decimal::new(10, 0), Decimal::new(10, 0)));
        let ex = extractor(vec![x.clone()], 5, 3);
        let budget = BudgetTracker::new(
            &BudgetConfig {
                daily_limit: Some(Decimal::new(1, 3)),
                total_limit: None,
                ..Default::default()
            },
            Arc::new(ManualClock::default()),
        );

        let err = ex.extract("prompt", &requirements(), &budget).await.unwrap_err();

        assert!(matches!(err, LlmError::CostLimitExceeded { ceiling: Ceiling::Daily, .. }));
        assert_eq!(x.calls(), 0);
    }

    #[tokio::test]
    async fn test_success_records_actual_cost() {
        let x = Arc::new(MockProvider::new("x").with_default_response("{}"));
        let ex = extractor(vec![x.clone()], 5, 3);
        let budget = BudgetTracker::unlimited();

        let result = ex.extract("prompt", &requirements(), &budget).await.unwrap();

        let usage = budget.usage();
        assert_eq!(usage.calls, 1);
        assert_eq!(usage.total_spend, result.cost);
        assert_eq!(usage.total_tokens, result.usage.total());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_times_out() {
        let x = Arc::new(MockProvider::new("x").with_default_response("{}").with_latency(Duration::from_secs(10)));
        let y = Arc::new(MockProvider::new("y").with_default_response("{}"));
        let ex = extractor(vec![x, y], 5, 1).with_request_timeout(Duration::from_secs(1));

        let result = ex.extract("prompt", &requirements(), &BudgetTracker::unlimited()).await.unwrap();
        assert_eq!(result.provider, "y");
    }

    #[tokio::test]
    async fn test_empty_chain() {
        let ex = extractor(vec![], 5, 3);
        let err = ex.extract("p", &requirements(), &BudgetTracker::unlimited()).await.unwrap_err();
        assert!(matches!(err, LlmError::NoProviders));
        assert!(!ex.all_circuits_open());
    }
}
