//! Shared setup for pipeline integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use paper_pipeline::testing::{ManualClock, MockProvider, MockStages};
use paper_pipeline::types::config::{BreakerConfig, RetryConfig};
use paper_pipeline::{
    BudgetTracker, LlmProvider, Orchestrator, PipelineConfig, RegistryStore, ResilientExtractor,
};

pub type TestOrchestrator = Orchestrator<Arc<MockStages>>;

/// Config with fast retries so failure paths finish quickly in real time.
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default().with_providers(["x", "y"]);
    config.retry = RetryConfig {
        max_attempts: 2,
        base_delay_ms: 1,
        max_delay_ms: 5,
        multiplier: 2.0,
    };
    config.breaker = BreakerConfig {
        failure_threshold: 5,
        cooldown_ms: 60_000,
        max_cooldown_ms: 600_000,
    };
    config
}

pub fn registry_path(dir: &Path) -> PathBuf {
    dir.join("registry.json")
}

pub fn extractor(
    config: &PipelineConfig,
    providers: &[Arc<MockProvider>],
    clock: Arc<ManualClock>,
) -> Arc<ResilientExtractor> {
    let chain = providers
        .iter()
        .map(|p| p.clone() as Arc<dyn LlmProvider>)
        .collect();
    Arc::new(ResilientExtractor::new(chain, &config.breaker, &config.retry, clock))
}

/// An orchestrator over the registry file at `path`, reloaded from disk.
pub async fn orchestrator(
    path: &Path,
    config: PipelineConfig,
    stages: Arc<MockStages>,
    providers: &[Arc<MockProvider>],
) -> TestOrchestrator {
    let registry = Arc::new(RegistryStore::load(path, "doi").await.unwrap());
    let extractor = extractor(&config, providers, Arc::new(ManualClock::default()));
    Orchestrator::new(
        config,
        registry,
        extractor,
        Arc::new(BudgetTracker::unlimited()),
        stages,
    )
}

/// An orchestrator over an in-memory registry.
pub fn in_memory(
    config: PipelineConfig,
    stages: Arc<MockStages>,
    providers: &[Arc<MockProvider>],
) -> TestOrchestrator {
    let extractor = extractor(&config, providers, Arc::new(ManualClock::default()));
    Orchestrator::new(
        config,
        Arc::new(RegistryStore::in_memory("doi")),
        extractor,
        Arc::new(BudgetTracker::unlimited()),
        stages,
    )
}

pub fn json_provider(name: &str) -> Arc<MockProvider> {
    Arc::new(MockProvider::new(name).with_default_response(r#"{"targets":{},"missing":[]}"#))
}
