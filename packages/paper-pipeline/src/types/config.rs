//! Configuration types for the pipeline.
//!
//! Every section has serde defaults, so a partial JSON file is a valid
//! config. Durations are plain milliseconds and money is a `Decimal`.

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::document::DOI;
use crate::types::outcome::Stage;

/// Top-level configuration consumed by the orchestrator and LLM layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub registry: RegistryConfig,
    pub stages: StageConfig,
    pub queue: QueueConfig,
    pub budget: BudgetConfig,
    pub cache: CacheConfig,
    pub resolver: ResolverConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub llm: LlmConfig,
}

impl PipelineConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file. Missing sections take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load defaults, then apply `PAPER_PIPELINE_*` environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from the environment (and a `.env` file if present).
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        // Load .env file if present (development)
        let _ = dotenvy::dotenv();

        if let Ok(path) = env::var("PAPER_PIPELINE_REGISTRY_PATH") {
            self.registry.path = PathBuf::from(path);
        }
        if let Some(v) = env_parse::<usize>("PAPER_PIPELINE_ACQUISITION_CONCURRENCY")? {
            self.stages.acquisition.concurrency = v;
        }
        if let Some(v) = env_parse::<usize>("PAPER_PIPELINE_CONVERSION_CONCURRENCY")? {
            self.stages.conversion.concurrency = v;
        }
        if let Some(v) = env_parse::<usize>("PAPER_PIPELINE_EXTRACTION_CONCURRENCY")? {
            self.stages.extraction.concurrency = v;
        }
        if let Some(v) = env_parse::<usize>("PAPER_PIPELINE_QUEUE_CAPACITY")? {
            self.queue.capacity = v;
        }
        if let Some(v) = env_parse::<f64>("PAPER_PIPELINE_BACKPRESSURE_THRESHOLD")? {
            self.queue.backpressure_threshold = v;
        }
        if let Some(v) = env_parse::<Decimal>("PAPER_PIPELINE_DAILY_BUDGET")? {
            self.budget.daily_limit = Some(v);
        }
        if let Some(v) = env_parse::<Decimal>("PAPER_PIPELINE_TOTAL_BUDGET")? {
            self.budget.total_limit = Some(v);
        }
        if let Some(v) = env_parse::<i32>("PAPER_PIPELINE_BUDGET_UTC_OFFSET_MINUTES")? {
            self.budget.utc_offset_minutes = v;
        }
        if let Ok(path) = env::var("PAPER_PIPELINE_BUDGET_STATE") {
            self.budget.state_path = Some(PathBuf::from(path));
        }
        if let Some(v) = env_parse::<f64>("PAPER_PIPELINE_SIMILARITY_THRESHOLD")? {
            self.resolver.similarity_threshold = v;
        }
        if let Ok(providers) = env::var("PAPER_PIPELINE_PROVIDERS") {
            self.llm.providers = providers
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
        }
        Ok(())
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for stage in [Stage::Acquisition, Stage::Conversion, Stage::Extraction] {
            if self.stages.limits(stage).concurrency == 0 {
                return Err(ConfigError::Invalid(format!("{stage} concurrency must be > 0")));
            }
        }
        if self.queue.capacity == 0 {
            return Err(ConfigError::Invalid("queue capacity must be > 0".into()));
        }
        let threshold = self.queue.backpressure_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "backpressure threshold must be in (0, 1], got {threshold}"
            )));
        }
        let similarity = self.resolver.similarity_threshold;
        if !(similarity > 0.0 && similarity <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "similarity threshold must be in (0, 1], got {similarity}"
            )));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid("breaker failure threshold must be > 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry max attempts must be > 0".into()));
        }
        if self.llm.providers.is_empty() {
            return Err(ConfigError::Missing("llm.providers".into()));
        }
        Ok(())
    }

    /// Set the provider fallback order.
    pub fn with_providers(mut self, providers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.llm.providers = providers.into_iter().map(|p| p.into()).collect();
        self
    }

    /// Set the daily and total cost ceilings.
    pub fn with_budget(mut self, daily: Option<Decimal>, total: Option<Decimal>) -> Self {
        self.budget.daily_limit = daily;
        self.budget.total_limit = total;
        self
    }

    /// Set the queue capacity and backpressure threshold.
    pub fn with_queue(mut self, capacity: usize, threshold: f64) -> Self {
        self.queue.capacity = capacity;
        self.queue.backpressure_threshold = threshold;
        self
    }

    /// Set limits for one stage.
    pub fn with_stage(mut self, stage: Stage, limits: StageLimits) -> Self {
        *self.stages.limits_mut(stage) = limits;
        self
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::Invalid(format!("{key}: {e}"))),
        Err(_) => Ok(None),
    }
}

/// Where the registry snapshot lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/registry.json"),
        }
    }
}

/// Worker pool settings for one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageLimits {
    /// Maximum concurrent invocations
    pub concurrency: usize,

    /// Per-invocation timeout in milliseconds
    pub timeout_ms: u64,

    /// Retries after the first attempt for retryable failures
    pub max_retries: u32,

    /// Delay before the first retry; doubles per retry
    pub retry_backoff_ms: u64,
}

impl Default for StageLimits {
    fn default() -> Self {
        Self {
            concurrency: 4,
            timeout_ms: 120_000,
            max_retries: 1,
            retry_backoff_ms: 1_000,
        }
    }
}

impl StageLimits {
    pub fn new(concurrency: usize, timeout_ms: u64) -> Self {
        Self {
            concurrency,
            timeout_ms,
            ..Default::default()
        }
    }

    pub fn with_retries(mut self, max_retries: u32, backoff_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff_ms = backoff_ms;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Backoff before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry.saturating_sub(1));
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

/// Per-stage pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub acquisition: StageLimits,
    pub conversion: StageLimits,
    pub extraction: StageLimits,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            acquisition: StageLimits::new(8, 60_000),
            conversion: StageLimits::new(4, 120_000),
            // The whole resilient call, retries and fallback included
            extraction: StageLimits::new(2, 600_000).with_retries(0, 0),
        }
    }
}

impl StageConfig {
    pub fn limits(&self, stage: Stage) -> &StageLimits {
        match stage {
            Stage::Acquisition => &self.acquisition,
            Stage::Conversion => &self.conversion,
            Stage::Extraction => &self.extraction,
        }
    }

    pub fn limits_mut(&mut self, stage: Stage) -> &mut StageLimits {
        match stage {
            Stage::Acquisition => &mut self.acquisition,
            Stage::Conversion => &mut self.conversion,
            Stage::Extraction => &mut self.extraction,
        }
    }
}

/// Bounded queue settings shared by all stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,

    /// Producers suspend once occupancy reaches this fraction of capacity
    pub backpressure_threshold: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            backpressure_threshold: 0.8,
        }
    }
}

/// Cost ceilings for LLM usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// None = unlimited
    pub daily_limit: Option<Decimal>,
    pub total_limit: Option<Decimal>,

    /// Offset of the timezone whose midnight resets the daily counter
    pub utc_offset_minutes: i32,

    /// Where spend counters persist across runs; in-memory when None
    pub state_path: Option<PathBuf>,

    /// Output-token allowance per extraction target
    pub max_tokens_per_target: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_limit: Some(Decimal::new(500, 2)),
            total_limit: Some(Decimal::new(10_000, 2)),
            utc_offset_minutes: 0,
            state_path: None,
            max_tokens_per_target: 1024,
        }
    }
}

/// Per-category cache lifetimes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub query_ttl_ms: u64,
    pub content_ttl_ms: u64,
    pub extraction_ttl_ms: u64,

    /// Least-recently-used bound per category; unbounded when None
    pub max_entries_per_category: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        const HOUR: u64 = 60 * 60 * 1000;
        Self {
            query_ttl_ms: 24 * HOUR,
            content_ttl_ms: 7 * 24 * HOUR,
            extraction_ttl_ms: 30 * 24 * HOUR,
            max_entries_per_category: Some(10_000),
        }
    }
}

/// Identity resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Identifier kind matched first
    pub primary_identifier: String,

    /// Minimum title similarity for a fuzzy match
    pub similarity_threshold: f64,

    /// Also run the fuzzy scan after an identifier match, to log disagreements
    pub detect_conflicts: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            primary_identifier: DOI.to_string(),
            similarity_threshold: 0.95,
            detect_conflicts: true,
        }
    }
}

/// Circuit breaker settings, applied to every provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    pub cooldown_ms: u64,

    /// Cap for the doubled cooldown after a failed half-open trial
    pub max_cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 60_000,
            max_cooldown_ms: 15 * 60_000,
        }
    }
}

/// Retry settings for transient provider failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per provider, including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

/// Provider selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Fallback order, by provider name
    pub providers: Vec<String>,

    /// Timeout for a single provider call
    pub request_timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            providers: vec!["openai".to_string()],
            request_timeout_ms: 120_000,
        }
    }
}
