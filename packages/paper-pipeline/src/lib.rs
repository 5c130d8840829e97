//! Paper Ingestion Pipeline Core
//!
//! Decides, for every paper a discovery provider reports under a research
//! topic, what work is actually needed, and does exactly that work:
//!
//! - recognise the same paper across providers and identifier schemes
//! - keep one canonical, crash-safe registry of processed papers
//! - re-extract only when a topic's extraction requirements changed
//! - run acquisition, conversion and extraction in bounded worker pools
//! - keep LLM extraction inside retry, circuit-breaker and cost limits
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use paper_pipeline::{
//!     BudgetTracker, DiscoveredDocument, Orchestrator, PipelineConfig, ProviderFactory,
//!     RegistryStore, ResilientExtractor, SystemClock,
//! };
//!
//! let config = PipelineConfig::from_env()?;
//! let clock = Arc::new(SystemClock);
//!
//! let mut factory = ProviderFactory::new();
//! paper_pipeline::providers::register_openai(&mut factory);
//!
//! let registry = Arc::new(RegistryStore::open(&config).await?);
//! let extractor = Arc::new(ResilientExtractor::from_config(&factory, &config, clock.clone())?);
//! let budget = Arc::new(BudgetTracker::load(&config.budget, clock).await?);
//!
//! let orchestrator = Orchestrator::new(config, registry, extractor, budget, my_stages);
//! let report = orchestrator.run_batch(topics, discovered, cancel).await?;
//! ```
//!
//! # Modules
//!
//! - [`identity`] - Identity resolution and title similarity
//! - [`registry`] - Canonical paper registry with atomic persistence
//! - [`backfill`] - Per-document action decisions
//! - [`pipeline`] - Stage queues and the worker pool orchestrator
//! - [`llm`] - Retry, circuit breaking, fallback and budget enforcement
//! - [`cache`] - TTL caches for queries, content and extractions
//! - [`testing`] - Mock implementations for testing

pub mod backfill;
pub mod cache;
pub mod error;
pub mod identity;
pub mod llm;
pub(crate) mod persist;
pub mod pipeline;
pub mod registry;
pub mod telemetry;
pub mod testing;
pub mod traits;
pub mod types;

#[cfg(feature = "openai")]
pub mod providers;

// Re-export core types at crate root
pub use backfill::determine_action;
pub use cache::{CacheLayer, TtlCache};
pub use error::{
    Ceiling, CollaboratorError, ConfigError, LlmError, PipelineError, ProviderError,
    RegistryError, StageError,
};
pub use identity::{IdentityConflict, IdentityResolver, MatchBasis, Resolution};
pub use llm::{
    BudgetTracker, CircuitBreaker, CircuitState, ProviderExt, ProviderFactory, ProviderHealth,
    RateLimitedProvider, ResilientExtractor,
};
pub use pipeline::{DiscoveredDocument, Orchestrator};
pub use registry::{RegistrySnapshot, RegistryStore};
pub use traits::{
    clock::{Clock, SystemClock},
    provider::{LlmProvider, LlmRequest, LlmResponse, ProviderStatus, TokenPricing},
    stages::DocumentStages,
};
pub use types::{
    config::PipelineConfig,
    document::{DocumentRecord, DOI},
    extraction::{ExtractionResult, TokenUsage},
    outcome::{DocumentOutcome, DocumentStatus, ProcessingAction, RunReport, Stage},
    registry::{PaperId, RegistryDelta, RegistryEntry},
    requirement::{ExtractionRequirement, ExtractionTarget, RequirementHash, Topic, TopicId},
};
