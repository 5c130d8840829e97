//! Worker pool orchestrator.
//!
//! A run classifies every discovered document, then drives it through
//! exactly the stages its action needs:
//!
//! ```text
//!  discovery ──> dispatcher ──FULL_PROCESS──> [acquisition] ──> [conversion] ──┐
//!                   │  │                                                        v
//!                   │  └──BACKFILL─────────────────────────────────────> [extraction] ──> registry
//!                   └─────MAP_ONLY ──> registry            SKIP ──> outcome only
//! ```
//!
//! Each stage has its own bounded queue and worker pool. A completed
//! document is committed to the registry immediately, so a crashed run is
//! resumed simply by running again: committed documents re-classify as
//! SKIP or MAP_ONLY.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::queue::{stage_queue, QueueReceiver, QueueSender};
use crate::backfill::determine_action;
use crate::cache::CacheLayer;
use crate::error::{LlmError, PipelineError, RegistryError, StageError};
use crate::identity::{IdentityResolver, Resolution};
use crate::llm::{extract_prompt_hash, format_extract_prompt, BudgetTracker, ResilientExtractor};
use crate::registry::RegistryStore;
use crate::traits::stages::DocumentStages;
use crate::types::config::{PipelineConfig, StageLimits};
use crate::types::document::{normalize_kind, DocumentRecord};
use crate::types::extraction::ExtractionResult;
use crate::types::outcome::{
    DocumentOutcome, DocumentStatus, FailureKind, FailureReason, ProcessingAction, RunReport,
    Stage,
};
use crate::types::registry::{RegistryDelta, RegistryEntry};
use crate::types::requirement::{Topic, TopicId};

/// A document reported by discovery for one topic.
#[derive(Debug, Clone)]
pub struct DiscoveredDocument {
    pub record: DocumentRecord,
    pub topic: TopicId,
}

impl DiscoveredDocument {
    pub fn new(record: DocumentRecord, topic: impl Into<TopicId>) -> Self {
        Self {
            record,
            topic: topic.into(),
        }
    }
}

/// One document moving through the stage queues.
struct WorkItem {
    record: DocumentRecord,
    topic: Arc<Topic>,
    action: ProcessingAction,
    /// Registry entry the record resolved to (backfills)
    entry: Option<RegistryEntry>,
    /// False when resolution saw conflicting identifiers; the commit then
    /// leaves identifier ownership alone
    merge_identifiers: bool,
    content: Option<Bytes>,
    text: Option<String>,
}

impl WorkItem {
    fn cancelled(self) -> DocumentOutcome {
        DocumentOutcome::failed(
            self.record,
            self.topic.id().clone(),
            Some(self.action),
            FailureReason::new(FailureKind::Cancelled, None, "run cancelled"),
        )
    }
}

/// Per-run shared state.
struct RunState {
    cancel: CancellationToken,
    /// Set once when LLM work must stop for the rest of the run
    llm_halt: OnceLock<String>,
    fatal: Mutex<Option<RegistryError>>,
    outcomes: Mutex<Vec<DocumentOutcome>>,
    listener: Option<mpsc::UnboundedSender<DocumentOutcome>>,
}

impl RunState {
    fn emit(&self, outcome: DocumentOutcome) {
        match &outcome.failure {
            Some(reason) => warn!(
                title = %outcome.record.title,
                topic = %outcome.topic,
                kind = ?reason.kind,
                stage = ?reason.stage,
                reason = %reason.message,
                "Document failed"
            ),
            None => debug!(
                title = %outcome.record.title,
                topic = %outcome.topic,
                status = ?outcome.status,
                "Document done"
            ),
        }
        if let Some(listener) = &self.listener {
            let _ = listener.send(outcome.clone());
        }
        self.outcomes.lock().push(outcome);
    }

    fn halt_llm(&self, reason: String) {
        if self.llm_halt.set(reason.clone()).is_ok() {
            warn!(reason = %reason, "Halting LLM work for the rest of the run");
        }
    }

    /// Record a registry failure and stop the run.
    fn fail_run(&self, err: RegistryError) {
        error!(error = %err, "Registry write failed, cancelling run");
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(err);
        }
        self.cancel.cancel();
    }
}

struct Inner<S> {
    config: PipelineConfig,
    registry: Arc<RegistryStore>,
    resolver: IdentityResolver,
    extractor: Arc<ResilientExtractor>,
    budget: Arc<BudgetTracker>,
    cache: Arc<CacheLayer>,
    stages: S,
    prompt_hash: String,
}

/// Drives discovered documents through identity resolution, backfill
/// decisions and the stage pools.
pub struct Orchestrator<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Orchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: DocumentStages + 'static> Orchestrator<S> {
    /// The resolver ranks identifiers by the registry's primary kind, so a
    /// differing `config.resolver.primary_identifier` is overridden.
    pub fn new(
        mut config: PipelineConfig,
        registry: Arc<RegistryStore>,
        extractor: Arc<ResilientExtractor>,
        budget: Arc<BudgetTracker>,
        stages: S,
    ) -> Self {
        if normalize_kind(&config.resolver.primary_identifier) != registry.primary_kind() {
            warn!(
                configured = %config.resolver.primary_identifier,
                registry = %registry.primary_kind(),
                "Resolver primary identifier differs from the registry's, using the registry's"
            );
            config.resolver.primary_identifier = registry.primary_kind().to_string();
        }
        let cache = Arc::new(CacheLayer::new(&config.cache));
        Self {
            inner: Arc::new(Inner {
                resolver: IdentityResolver::new(config.resolver.clone()),
                config,
                registry,
                extractor,
                budget,
                cache,
                stages,
                prompt_hash: extract_prompt_hash(),
            }),
        }
    }

    /// Share a cache layer across orchestrators (or runs).
    ///
    /// Must be called before the orchestrator is cloned.
    pub fn with_cache(mut self, cache: Arc<CacheLayer>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.cache = cache,
            None => warn!("Orchestrator already shared, cache not replaced"),
        }
        self
    }

    pub fn registry(&self) -> &Arc<RegistryStore> {
        &self.inner.registry
    }

    pub fn extractor(&self) -> &Arc<ResilientExtractor> {
        &self.inner.extractor
    }

    pub fn budget(&self) -> &Arc<BudgetTracker> {
        &self.inner.budget
    }

    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.inner.cache
    }

    pub fn stages(&self) -> &S {
        &self.inner.stages
    }

    /// Run a fixed batch of documents.
    pub async fn run_batch(
        &self,
        topics: impl IntoIterator<Item = Topic>,
        documents: Vec<DiscoveredDocument>,
        cancel: CancellationToken,
    ) -> Result<RunReport, PipelineError> {
        self.run(topics, stream::iter(documents), cancel).await
    }

    /// Process every document from `documents` until the stream ends or
    /// `cancel` fires.
    ///
    /// Per-document failures are reported in the [`RunReport`]. Only a
    /// registry write failure fails the run; everything committed before it
    /// stays committed.
    pub async fn run<D>(
        &self,
        topics: impl IntoIterator<Item = Topic>,
        documents: D,
        cancel: CancellationToken,
    ) -> Result<RunReport, PipelineError>
    where
        D: Stream<Item = DiscoveredDocument> + Send + Unpin,
    {
        self.execute(topics, documents, cancel, None).await
    }

    /// Like [`run`](Self::run), also sending every outcome on `listener` as
    /// soon as it is known.
    pub async fn run_streaming<D>(
        &self,
        topics: impl IntoIterator<Item = Topic>,
        documents: D,
        cancel: CancellationToken,
        listener: mpsc::UnboundedSender<DocumentOutcome>,
    ) -> Result<RunReport, PipelineError>
    where
        D: Stream<Item = DiscoveredDocument> + Send + Unpin,
    {
        self.execute(topics, documents, cancel, Some(listener)).await
    }

    async fn execute<D>(
        &self,
        topics: impl IntoIterator<Item = Topic>,
        documents: D,
        cancel: CancellationToken,
        listener: Option<mpsc::UnboundedSender<DocumentOutcome>>,
    ) -> Result<RunReport, PipelineError>
    where
        D: Stream<Item = DiscoveredDocument> + Send + Unpin,
    {
        let started_at = Utc::now();
        let topics: HashMap<TopicId, Arc<Topic>> = topics
            .into_iter()
            .map(|t| (t.id().clone(), Arc::new(t)))
            .collect();
        info!(
            topics = topics.len(),
            registry_entries = self.inner.registry.snapshot().len(),
            providers = ?self.inner.extractor.provider_names(),
            "Starting pipeline run"
        );

        let run = Arc::new(RunState {
            cancel: cancel.child_token(),
            llm_halt: OnceLock::new(),
            fatal: Mutex::new(None),
            outcomes: Mutex::new(Vec::new()),
            listener,
        });

        let queue = &self.inner.config.queue;
        let (acq_tx, acq_rx) = stage_queue(queue.capacity, queue.backpressure_threshold);
        let (conv_tx, conv_rx) = stage_queue(queue.capacity, queue.backpressure_threshold);
        let (ext_tx, ext_rx) = stage_queue(queue.capacity, queue.backpressure_threshold);

        let pools = [
            tokio::spawn(self.inner.clone().pool(Stage::Acquisition, acq_rx, Some(conv_tx), run.clone())),
            tokio::spawn(self.inner.clone().pool(Stage::Conversion, conv_rx, Some(ext_tx.clone()), run.clone())),
            tokio::spawn(self.inner.clone().pool(Stage::Extraction, ext_rx, None, run.clone())),
        ];

        self.inner.dispatch(&topics, documents, acq_tx, ext_tx, &run).await;

        for pool in pools {
            if let Err(e) = pool.await {
                error!(error = %e, "Stage pool panicked");
            }
        }

        if let Some(err) = run.fatal.lock().take() {
            return Err(err.into());
        }

        let report = RunReport {
            started_at,
            finished_at: Utc::now(),
            outcomes: std::mem::take(&mut *run.outcomes.lock()),
            llm_halted: run.llm_halt.get().cloned(),
            cancelled: cancel.is_cancelled(),
        };
        info!(
            documents = report.outcomes.len(),
            new = report.count(DocumentStatus::New),
            backfilled = report.count(DocumentStatus::Backfilled),
            mapped = report.count(DocumentStatus::Mapped),
            skipped = report.count(DocumentStatus::Skipped),
            failed = report.count(DocumentStatus::Failed),
            llm_halted = report.llm_halted.is_some(),
            cancelled = report.cancelled,
            budget_remaining_daily = ?self.inner.budget.remaining_daily(),
            budget_remaining_total = ?self.inner.budget.remaining_total(),
            "Pipeline run finished"
        );
        Ok(report)
    }
}

impl<S: DocumentStages + 'static> Inner<S> {
    /// Classify discovered documents and route them to the stage queues.
    async fn dispatch<D>(
        &self,
        topics: &HashMap<TopicId, Arc<Topic>>,
        mut documents: D,
        acquisition: QueueSender<WorkItem>,
        extraction: QueueSender<WorkItem>,
        run: &RunState,
    ) where
        D: Stream<Item = DiscoveredDocument> + Send + Unpin,
    {
        loop {
            let doc = tokio::select! {
                biased;
                _ = run.cancel.cancelled() => break,
                doc = documents.next() => match doc {
                    Some(doc) => doc,
                    None => break,
                },
            };

            let Some(topic) = topics.get(&doc.topic).cloned() else {
                run.emit(DocumentOutcome::failed(
                    doc.record,
                    doc.topic.clone(),
                    None,
                    FailureReason::new(
                        FailureKind::UnknownTopic,
                        None,
                        format!("topic '{}' is not part of this run", doc.topic),
                    ),
                ));
                continue;
            };

            let resolution = self.resolver.resolve(&doc.record, &self.registry.snapshot());
            let action = determine_action(&doc.record, &topic, &resolution);
            debug!(
                title = %doc.record.title,
                topic = %topic.id(),
                action = ?action,
                basis = ?resolution.basis,
                "Classified document"
            );

            if action.runs_extraction() {
                let queue = if action.runs_acquisition() {
                    &acquisition
                } else {
                    &extraction
                };
                let item = WorkItem {
                    record: doc.record,
                    topic,
                    action,
                    merge_identifiers: resolution.conflict.is_none(),
                    entry: resolution.entry,
                    content: None,
                    text: None,
                };
                if let Err(item) = submit(queue, item, &run.cancel).await {
                    run.emit(item.cancelled());
                }
            } else if action.writes_registry() {
                self.map_only(doc.record, &topic, resolution, run).await;
            } else {
                run.emit(DocumentOutcome::succeeded(
                    doc.record,
                    topic.id().clone(),
                    action,
                    resolution.entry,
                    None,
                ));
            }
        }
    }

    async fn map_only(
        &self,
        record: DocumentRecord,
        topic: &Topic,
        resolution: Resolution,
        run: &RunState,
    ) {
        let Some(entry) = resolution.entry else {
            return;
        };
        let mut delta = RegistryDelta::affiliation(entry.paper_id, topic.id());
        if resolution.conflict.is_none() {
            delta.identifiers = record.normalized_identifiers().collect();
        }

        match self.registry.upsert(delta).await {
            Ok(entry) => run.emit(DocumentOutcome::succeeded(
                record,
                topic.id().clone(),
                ProcessingAction::MapOnly,
                Some(entry),
                None,
            )),
            Err(err) => {
                run.emit(registry_failure(record, topic.id(), ProcessingAction::MapOnly, &err));
                run.fail_run(err);
            }
        }
    }

    /// Worker pool for one stage.
    async fn pool(
        self: Arc<Self>,
        stage: Stage,
        mut rx: QueueReceiver<WorkItem>,
        next: Option<QueueSender<WorkItem>>,
        run: Arc<RunState>,
    ) {
        let concurrency = self.config.stages.limits(stage).concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut workers = JoinSet::new();

        loop {
            // Take a slot first so queued items stay queued (and producers
            // feel backpressure) while every worker is busy.
            let permit = tokio::select! {
                biased;
                _ = run.cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let item = tokio::select! {
                biased;
                _ = run.cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let this = self.clone();
            let run = run.clone();
            let next = next.clone();
            workers.spawn(async move {
                let _permit = permit;
                this.work(stage, item, next.as_ref(), &run).await;
            });

            while let Some(joined) = workers.try_join_next() {
                if let Err(e) = joined {
                    error!(stage = %stage, error = %e, "Stage worker panicked");
                }
            }
        }

        if run.cancel.is_cancelled() {
            rx.close();
            while let Some(item) = rx.try_recv() {
                run.emit(item.cancelled());
            }
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(stage = %stage, error = %e, "Stage worker panicked");
            }
        }
        debug!(stage = %stage, "Stage pool drained");
    }

    async fn work(
        &self,
        stage: Stage,
        mut item: WorkItem,
        next: Option<&QueueSender<WorkItem>>,
        run: &RunState,
    ) {
        let result = match stage {
            Stage::Acquisition => self.acquire(&item, run).await.map(|content| {
                item.content = Some(content);
            }),
            Stage::Conversion => self.convert(&mut item, run).await,
            Stage::Extraction => {
                self.extract_and_commit(item, run).await;
                return;
            }
        };

        match (result, next) {
            (Ok(()), Some(next)) => {
                if let Err(item) = submit(next, item, &run.cancel).await {
                    run.emit(item.cancelled());
                }
            }
            (Ok(()), None) => {}
            (Err(err), _) => run.emit(stage_failure(item, stage, &err)),
        }
    }

    async fn acquire(&self, item: &WorkItem, run: &RunState) -> Result<Bytes, StageError> {
        let key = item.record.cache_key(&self.config.resolver.primary_identifier);
        if let Some(content) = self.cache.content.get(&key) {
            debug!(key = %key, "Content cache hit");
            return Ok(content);
        }

        let stages = &self.stages;
        let record = &item.record;
        let content = run_stage(
            Stage::Acquisition,
            self.config.stages.limits(Stage::Acquisition),
            &run.cancel,
            move || async move {
                stages
                    .acquire(record)
                    .await
                    .map_err(|source| StageError::Failed {
                        stage: Stage::Acquisition,
                        source,
                    })
            },
        )
        .await?;

        self.cache.content.insert(key, content.clone());
        Ok(content)
    }

    async fn convert(&self, item: &mut WorkItem, run: &RunState) -> Result<(), StageError> {
        let content = item.content.take().unwrap_or_default();
        let stages = &self.stages;
        let record = &item.record;
        let text = run_stage(
            Stage::Conversion,
            self.config.stages.limits(Stage::Conversion),
            &run.cancel,
            move || {
                let content = content.clone();
                async move {
                    stages
                        .convert(record, content)
                        .await
                        .map_err(|source| StageError::Failed {
                            stage: Stage::Conversion,
                            source,
                        })
                }
            },
        )
        .await?;
        item.text = Some(text);
        Ok(())
    }

    async fn extract_and_commit(&self, item: WorkItem, run: &RunState) {
        let extraction = match self.extract(&item, run).await {
            Ok(extraction) => extraction,
            Err(err) => {
                run.emit(stage_failure(item, Stage::Extraction, &err));
                return;
            }
        };

        let mut delta = RegistryDelta::extracted(
            item.entry.as_ref().map(|e| e.paper_id),
            &item.record,
            item.topic.id(),
            &extraction.requirement_hash,
            Utc::now(),
        );
        if !item.merge_identifiers {
            delta.identifiers.clear();
        }

        match self.registry.upsert(delta).await {
            Ok(entry) => {
                info!(
                    paper_id = %entry.paper_id,
                    topic = %item.topic.id(),
                    action = ?item.action,
                    provider = %extraction.provider,
                    "Committed extraction"
                );
                run.emit(DocumentOutcome::succeeded(
                    item.record,
                    item.topic.id().clone(),
                    item.action,
                    Some(entry),
                    Some(extraction),
                ));
            }
            Err(err) => {
                run.emit(registry_failure(item.record, item.topic.id(), item.action, &err));
                run.fail_run(err);
            }
        }
    }

    async fn extract(&self, item: &WorkItem, run: &RunState) -> Result<ExtractionResult, StageError> {
        let requirements = item.topic.requirements();
        let record_key = item.record.cache_key(&self.config.resolver.primary_identifier);
        let cache_key = CacheLayer::extraction_key(
            &record_key,
            item.topic.requirement_hash().as_str(),
            &self.prompt_hash,
        );
        if let Some(hit) = self.cache.extractions.get(&cache_key) {
            debug!(key = %cache_key, "Extraction cache hit");
            return Ok(hit);
        }

        if let Some(reason) = run.llm_halt.get() {
            return Err(StageError::Halted {
                reason: reason.clone(),
            });
        }

        let text = self.extraction_text(item).await;
        let prompt = format_extract_prompt(&item.record, &text, requirements);
        let extractor = &self.extractor;
        let budget = &self.budget;
        let prompt = &prompt;

        let result = run_stage(
            Stage::Extraction,
            self.config.stages.limits(Stage::Extraction),
            &run.cancel,
            move || async move {
                extractor
                    .extract(prompt, requirements, budget)
                    .await
                    .map_err(StageError::from)
            },
        )
        .await;

        match &result {
            Ok(extraction) => self.cache.extractions.insert(cache_key, extraction.clone()),
            Err(StageError::Llm(err @ LlmError::CostLimitExceeded { .. })) => {
                run.halt_llm(err.to_string());
            }
            Err(StageError::Llm(err @ LlmError::NoProviders)) => run.halt_llm(err.to_string()),
            Err(StageError::Llm(err @ LlmError::AllProvidersUnavailable { .. }))
                if self.extractor.all_circuits_open() =>
            {
                run.halt_llm(err.to_string());
            }
            Err(_) => {}
        }
        result
    }

    /// Text to extract from: freshly converted text, else the stored
    /// conversion, else the abstract, else the title.
    async fn extraction_text(&self, item: &WorkItem) -> String {
        if let Some(text) = &item.text {
            return text.clone();
        }
        if let Some(entry) = &item.entry {
            match self.stages.stored_text(entry).await {
                Ok(Some(text)) => return text,
                Ok(None) => {}
                Err(e) => warn!(paper_id = %entry.paper_id, error = %e, "Stored text unavailable"),
            }
        }
        item.record
            .abstract_text
            .clone()
            .or_else(|| item.entry.as_ref().and_then(|e| e.metadata.abstract_text.clone()))
            .unwrap_or_else(|| item.record.title.clone())
    }
}

/// Push an item downstream unless the run is cancelled first. Gives the item
/// back when it could not be queued.
async fn submit(
    queue: &QueueSender<WorkItem>,
    item: WorkItem,
    cancel: &CancellationToken,
) -> Result<(), WorkItem> {
    if cancel.is_cancelled() {
        return Err(item);
    }
    let send = queue.send(item);
    tokio::pin!(send);
    tokio::select! {
        biased;
        result = &mut send => result,
        // The send future owns the item. Downstream pools close their queues
        // on cancel, which hands it back.
        _ = cancel.cancelled() => send.await,
    }
}

/// Run one stage operation under its timeout, retrying retryable failures.
async fn run_stage<T, F, Fut>(
    stage: Stage,
    limits: &StageLimits,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, StageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StageError>>,
{
    let timeout = limits.timeout();
    let mut retry = 0u32;
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StageError::Cancelled),
            result = tokio::time::timeout(timeout, op()) => match result {
                Ok(result) => result,
                Err(_) => Err(StageError::Timeout { stage, after: timeout }),
            },
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && retry < limits.max_retries => {
                retry += 1;
                let delay = limits.backoff(retry);
                warn!(
                    stage = %stage,
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Stage failed, retrying"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(StageError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }
}

fn stage_failure(item: WorkItem, stage: Stage, err: &StageError) -> DocumentOutcome {
    DocumentOutcome::failed(
        item.record,
        item.topic.id().clone(),
        Some(item.action),
        FailureReason::from_stage_error(stage, err),
    )
}

fn registry_failure(
    record: DocumentRecord,
    topic: &TopicId,
    action: ProcessingAction,
    err: &RegistryError,
) -> DocumentOutcome {
    DocumentOutcome::failed(
        record,
        topic.clone(),
        Some(action),
        FailureReason::new(FailureKind::Registry, None, err.to_string()),
    )
}
