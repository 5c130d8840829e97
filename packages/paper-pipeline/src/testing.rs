//! Testing utilities including mock implementations.
//!
//! These let applications (and this crate's own tests) exercise the pipeline
//! without real LLM calls, downloads or PDF conversion.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::error::{CollaboratorError, FatalKind, ProviderError, ProviderResult};
use crate::traits::clock::Clock;
use crate::traits::provider::{LlmProvider, LlmRequest, LlmResponse, ProviderStatus, TokenPricing};
use crate::traits::stages::DocumentStages;
use crate::types::document::DocumentRecord;
use crate::types::extraction::TokenUsage;
use crate::types::registry::RegistryEntry;

/// A scriptable LLM provider.
///
/// Scripted replies (`with_response`, `with_error`) are consumed in order;
/// once they run out every call gets the default reply.
pub struct MockProvider {
    name: String,
    model: String,
    scripted: Mutex<VecDeque<ProviderResult<String>>>,
    default: Option<ProviderResult<String>>,
    pricing: TokenPricing,
    latency: Option<Duration>,
    health: ProviderStatus,

    /// Call tracking for assertions
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockProvider {
    /// A provider with no replies configured. Calls fail fatally until one
    /// is added.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            model: format!("{name}-mock"),
            name,
            scripted: Mutex::new(VecDeque::new()),
            default: None,
            pricing: TokenPricing::new(Decimal::ONE, Decimal::TWO),
            latency: None,
            health: ProviderStatus::Healthy,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue one successful reply.
    pub fn with_response(self, content: impl Into<String>) -> Self {
        self.scripted.lock().push_back(Ok(content.into()));
        self
    }

    /// Queue one failure.
    pub fn with_error(self, error: ProviderError) -> Self {
        self.scripted.lock().push_back(Err(error));
        self
    }

    /// Reply with `content` once scripted replies are exhausted.
    pub fn with_default_response(mut self, content: impl Into<String>) -> Self {
        self.default = Some(Ok(content.into()));
        self
    }

    /// Fail every unscripted call with `error`.
    pub fn failing_with(mut self, error: ProviderError) -> Self {
        self.default = Some(Err(error));
        self
    }

    /// Per-million-token prices.
    pub fn with_pricing(mut self, input_per_million: Decimal, output_per_million: Decimal) -> Self {
        self.pricing = TokenPricing::new(input_per_million, output_per_million);
        self
    }

    /// Delay every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_health(mut self, health: ProviderStatus) -> Self {
        self.health = health;
        self
    }

    /// Number of calls made, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every prompt received, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    fn next_reply(&self) -> ProviderResult<String> {
        if let Some(reply) = self.scripted.lock().pop_front() {
            return reply;
        }
        match &self.default {
            Some(reply) => reply.clone(),
            None => Err(ProviderError::fatal(
                FatalKind::Other,
                format!("no reply configured for mock provider '{}'", self.name),
            )),
        }
    }
}

fn approx_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4).max(1)
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn extract(&self, request: &LlmRequest) -> ProviderResult<LlmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(request.prompt.clone());

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let content = self.next_reply()?;
        let usage = TokenUsage::new(approx_tokens(&request.prompt), approx_tokens(&content));
        Ok(LlmResponse::new(content, self.model.clone(), usage))
    }

    fn cost(&self, usage: &TokenUsage) -> Decimal {
        self.pricing.cost(usage)
    }

    async fn health(&self) -> ProviderStatus {
        self.health.clone()
    }
}

/// Decrements an in-flight counter even when the call is cancelled.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Stage collaborators with scriptable latency and failures.
///
/// Documents are matched by title or by any identifier value.
#[derive(Default)]
pub struct MockStages {
    acquire_latency: HashMap<String, Duration>,
    default_acquire_latency: Option<Duration>,
    acquire_failures: Mutex<HashMap<String, (u32, CollaboratorError)>>,
    convert_failures: HashMap<String, CollaboratorError>,
    stored: HashMap<String, String>,

    acquired: Mutex<Vec<String>>,
    converted: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

fn matches(record: &DocumentRecord, key: &str) -> bool {
    record.title == key || record.identifiers.values().any(|v| v == key)
}

impl MockStages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay acquisition of one document.
    pub fn with_acquire_latency(mut self, key: impl Into<String>, latency: Duration) -> Self {
        self.acquire_latency.insert(key.into(), latency);
        self
    }

    /// Delay every acquisition.
    pub fn with_default_acquire_latency(mut self, latency: Duration) -> Self {
        self.default_acquire_latency = Some(latency);
        self
    }

    /// Fail the first `times` acquisitions of one document.
    pub fn with_acquire_failures(self, key: impl Into<String>, times: u32, error: CollaboratorError) -> Self {
        self.acquire_failures.lock().insert(key.into(), (times, error));
        self
    }

    /// Fail every conversion of one document.
    pub fn with_convert_failure(mut self, key: impl Into<String>, error: CollaboratorError) -> Self {
        self.convert_failures.insert(key.into(), error);
        self
    }

    /// Text returned by `stored_text` for a registered paper.
    pub fn with_stored_text(mut self, key: impl Into<String>, text: impl Into<String>) -> Self {
        self.stored.insert(key.into(), text.into());
        self
    }

    pub fn acquire_calls(&self) -> usize {
        self.acquired.lock().len()
    }

    pub fn convert_calls(&self) -> usize {
        self.converted.lock().len()
    }

    /// Titles passed to `acquire`, in call order.
    pub fn acquired(&self) -> Vec<String> {
        self.acquired.lock().clone()
    }

    /// Titles passed to `convert`, in call order.
    pub fn converted(&self) -> Vec<String> {
        self.converted.lock().clone()
    }

    /// Highest number of acquisitions observed running at once.
    pub fn peak_concurrent_acquisitions(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn latency_for(&self, record: &DocumentRecord) -> Option<Duration> {
        self.acquire_latency
            .iter()
            .find(|(key, _)| matches(record, key))
            .map(|(_, latency)| *latency)
            .or(self.default_acquire_latency)
    }

    fn scripted_failure(&self, record: &DocumentRecord) -> Option<CollaboratorError> {
        let mut failures = self.acquire_failures.lock();
        let (_, (remaining, error)) = failures
            .iter_mut()
            .find(|(key, (remaining, _))| *remaining > 0 && matches(record, key))?;
        *remaining -= 1;
        Some(error.clone())
    }
}

#[async_trait]
impl DocumentStages for MockStages {
    async fn acquire(&self, record: &DocumentRecord) -> Result<Bytes, CollaboratorError> {
        self.acquired.lock().push(record.title.clone());
        let _guard = InFlight::enter(&self.in_flight, &self.peak_in_flight);

        if let Some(latency) = self.latency_for(record) {
            tokio::time::sleep(latency).await;
        }
        if let Some(error) = self.scripted_failure(record) {
            return Err(error);
        }
        Ok(Bytes::from(format!("%PDF-1.7 {}", record.title)))
    }

    async fn convert(&self, record: &DocumentRecord, content: Bytes) -> Result<String, CollaboratorError> {
        self.converted.lock().push(record.title.clone());
        if let Some((_, error)) = self.convert_failures.iter().find(|(key, _)| matches(record, key)) {
            return Err(error.clone());
        }
        Ok(format!("Full text of {}", String::from_utf8_lossy(&content)))
    }

    async fn stored_text(&self, entry: &RegistryEntry) -> Result<Option<String>, CollaboratorError> {
        Ok(self
            .stored
            .iter()
            .find(|(key, _)| matches(&entry.metadata, key))
            .map(|(_, text)| text.clone()))
    }
}

/// A clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        *self.now.lock() += by;
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }
}

impl Default for ManualClock {
    /// 2024-01-01T00:00:00Z
    fn default() -> Self {
        Self::at(DateTime::from_timestamp(1_704_067_200, 0).unwrap_or_default())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Record and topic builders for tests.
pub mod fixtures {
    use crate::types::document::DocumentRecord;
    use crate::types::requirement::{ExtractionRequirement, ExtractionTarget, Topic};

    /// A paper with a DOI, an author and an abstract.
    pub fn paper(doi: &str, title: &str) -> DocumentRecord {
        DocumentRecord::new(title)
            .with_doi(doi)
            .with_authors(["A. Researcher"])
            .with_abstract(format!("Abstract of {title}."))
            .with_source("mock")
    }

    /// A paper known only by a provider-scoped id such as `arxiv:2401.00001`.
    pub fn preprint(scoped_id: &str, title: &str) -> DocumentRecord {
        DocumentRecord::new(title)
            .with_scoped_id(scoped_id)
            .with_abstract(format!("Abstract of {title}."))
            .with_source("mock")
    }

    pub fn requirements(targets: &[&str]) -> ExtractionRequirement {
        ExtractionRequirement::new(
            targets
                .iter()
                .map(|name| ExtractionTarget::new(*name, format!("The paper's {name}"))),
        )
    }

    pub fn topic(id: &str, targets: &[&str]) -> Topic {
        Topic::new(id, requirements(targets))
    }
}
