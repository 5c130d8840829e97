//! LLM resilience layer: retry, circuit breaking, provider fallback and
//! budget enforcement around interchangeable providers.

pub mod breaker;
pub mod budget;
pub mod factory;
pub mod prompt;
pub mod rate_limited;
pub mod resilient;
pub mod retry;

pub use breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
pub use budget::{BudgetTracker, BudgetUsage, Reservation};
pub use factory::ProviderFactory;
pub use prompt::{extract_prompt_hash, format_extract_prompt};
pub use rate_limited::{ProviderExt, RateLimitedProvider};
pub use resilient::{ProviderHealth, ResilientExtractor};
pub use retry::RetryPolicy;
