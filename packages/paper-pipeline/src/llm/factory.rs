//! Name-keyed provider factory.
//!
//! Adding a provider means registering a constructor under a name; the
//! fallback chain is then just a list of names in the config.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use crate::error::ConfigError;
use crate::traits::provider::LlmProvider;

type Constructor = Box<dyn Fn() -> Result<Arc<dyn LlmProvider>, ConfigError> + Send + Sync>;

#[derive(Default)]
pub struct ProviderFactory {
    constructors: IndexMap<String, Constructor>,
}

impl ProviderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor. A later registration under the same name
    /// replaces the earlier one.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn() -> Result<Arc<dyn LlmProvider>, ConfigError> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Box::new(constructor));
        self
    }

    /// Register an already-built provider under its own name.
    pub fn register_instance(&mut self, provider: Arc<dyn LlmProvider>) -> &mut Self {
        let name = provider.name().to_string();
        self.register(name, move || Ok(provider.clone()))
    }

    /// Builder-style [`register_instance`](Self::register_instance).
    pub fn with_instance(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.register_instance(provider);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(|k| k.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn build(&self, name: &str) -> Result<Arc<dyn LlmProvider>, ConfigError> {
        let constructor = self.constructors.get(name).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "unknown LLM provider '{name}' (registered: {})",
                self.names().collect::<Vec<_>>().join(", ")
            ))
        })?;
        constructor()
    }

    /// Instantiate providers in fallback order. Duplicate names are ignored
    /// after their first occurrence.
    pub fn build_fallback_chain(
        &self,
        names: &[String],
    ) -> Result<Vec<Arc<dyn LlmProvider>>, ConfigError> {
        if names.is_empty() {
            return Err(ConfigError::Missing("llm.providers".into()));
        }
        let mut chain: Vec<Arc<dyn LlmProvider>> = Vec::with_capacity(names.len());
        for name in names {
            if chain.iter().any(|p| p.name() == name) {
                continue;
            }
            chain.push(self.build(name)?);
        }
        debug!(chain = ?names, "Built provider fallback chain");
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvider;

    #[test]
    fn test_chain_preserves_configured_order() {
        let factory = ProviderFactory::new()
            .with_instance(Arc::new(MockProvider::new("x")))
            .with_instance(Arc::new(MockProvider::new("y")));

        let chain = factory
            .build_fallback_chain(&["y".to_string(), "x".to_string(), "y".to_string()])
            .unwrap();
        let names: Vec<_> = chain.iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, ["y", "x"]);
    }

    #[test]
    fn test_unknown_provider_is_config_error() {
        let factory = ProviderFactory::new().with_instance(Arc::new(MockProvider::new("x")));
        let err = factory.build_fallback_chain(&["z".to_string()]).err().unwrap();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("'z'") && msg.contains("x")));
    }

    #[test]
    fn test_empty_chain_is_rejected() {
        let err = ProviderFactory::new().build_fallback_chain(&[]).err().unwrap();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test]
    fn test_constructor_errors_propagate() {
        let mut factory = ProviderFactory::new();
        factory.register("needs-key", || Err(ConfigError::Missing("API key".into())));
        assert!(factory.build("needs-key").is_err());
    }
}
