//! End-to-end ingestion scenarios.
//!
//! Each test drives the orchestrator through one or more runs against a
//! registry file on disk, reloading the registry between runs the way a
//! scheduled job would.

mod common;

use std::sync::Arc;

use paper_pipeline::error::{FatalKind, ProviderError, TransientKind};
use paper_pipeline::testing::{fixtures, MockProvider, MockStages};
use paper_pipeline::types::outcome::FailureKind;
use paper_pipeline::{
    DiscoveredDocument, DocumentStatus, ProcessingAction, RegistryDelta, RegistryStore, TopicId,
};
use tokio_util::sync::CancellationToken;

use common::{json_provider, orchestrator, registry_path, test_config};

fn alpha_beta(targets: &[&str]) -> [paper_pipeline::Topic; 2] {
    [fixtures::topic("alpha", targets), fixtures::topic("beta", targets)]
}

#[tokio::test]
async fn test_known_paper_under_new_topic_is_mapped_without_extraction() {
    let dir = tempfile::tempdir().unwrap();
    let path = registry_path(dir.path());
    let provider = json_provider("x");
    let d1 = fixtures::paper("10.1000/d1", "Sparse Attention at Scale");

    // Run 1: unknown paper under alpha.
    let stages = Arc::new(MockStages::new());
    let orch = orchestrator(&path, test_config(), stages.clone(), &[provider.clone()]).await;
    let report = orch
        .run_batch(
            alpha_beta(&["method", "datasets"]),
            vec![DiscoveredDocument::new(d1.clone(), "alpha")],
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(report.outcomes[0].action, Some(ProcessingAction::FullProcess));
    assert_eq!(report.outcomes[0].status, DocumentStatus::New);
    assert_eq!(provider.calls(), 1);

    // Run 2: same DOI from a different provider, under beta.
    let stages = Arc::new(MockStages::new());
    let orch = orchestrator(&path, test_config(), stages.clone(), &[provider.clone()]).await;
    let from_other_provider = fixtures::paper("https://doi.org/10.1000/D1", "Sparse attention at scale")
        .with_source("other");
    let report = orch
        .run_batch(
            alpha_beta(&["method", "datasets"]),
            vec![DiscoveredDocument::new(from_other_provider, "beta")],
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let outcome = &report.outcomes[0];
    assert_eq!(outcome.action, Some(ProcessingAction::MapOnly));
    assert_eq!(outcome.status, DocumentStatus::Mapped);
    assert_eq!(provider.calls(), 1, "MAP_ONLY must not call the LLM");
    assert_eq!(stages.acquire_calls(), 0);

    let registry = RegistryStore::load(&path, "doi").await.unwrap();
    let snapshot = registry.snapshot();
    assert_eq!(snapshot.len(), 1);
    let entry = snapshot.find_by_identifier("doi", "10.1000/d1").unwrap();
    let topics: Vec<_> = entry.topic_affiliations.iter().map(TopicId::as_str).collect();
    assert_eq!(topics, ["alpha", "beta"]);
}

#[tokio::test]
async fn test_changed_requirements_trigger_backfill_without_reacquisition() {
    let dir = tempfile::tempdir().unwrap();
    let path = registry_path(dir.path());
    let provider = json_provider("x");
    let d1 = fixtures::paper("10.1000/d1", "Sparse Attention at Scale");

    let stages = Arc::new(MockStages::new());
    let orch = orchestrator(&path, test_config(), stages, &[provider.clone()]).await;
    orch.run_batch(
        [fixtures::topic("alpha", &["method"])],
        vec![DiscoveredDocument::new(d1.clone(), "alpha")],
        CancellationToken::new(),
    )
    .await
    .unwrap();

    // Alpha gains a target.
    let alpha = fixtures::topic("alpha", &["method", "limitations"]);
    let new_hash = alpha.requirement_hash().clone();
    let stages = Arc::new(
        MockStages::new().with_stored_text("10.1000/d1", "Stored full text of the paper"),
    );
    let orch = orchestrator(&path, test_config(), stages.clone(), &[provider.clone()]).await;
    let report = orch
        .run_batch([alpha], vec![DiscoveredDocument::new(d1, "alpha")], CancellationToken::new())
        .await
        .unwrap();

    let outcome = &report.outcomes[0];
    assert_eq!(outcome.action, Some(ProcessingAction::Backfill));
    assert_eq!(outcome.status, DocumentStatus::Backfilled);
    assert_eq!(stages.acquire_calls(), 0);
    assert_eq!(stages.convert_calls(), 0);

    // Exactly one extraction, against the whole updated requirement set.
    assert_eq!(provider.calls(), 2);
    let prompt = provider.prompts().pop().unwrap();
    assert!(prompt.contains("- method [text]"));
    assert!(prompt.contains("- limitations [text]"));
    assert!(prompt.contains("Stored full text of the paper"));

    let registry = RegistryStore::load(&path, "doi").await.unwrap();
    let entry = registry.snapshot().find_by_identifier("doi", "10.1000/d1").cloned().unwrap();
    assert_eq!(entry.extraction_target_hash, Some(new_hash));
}

#[tokio::test]
async fn test_open_breaker_routes_to_fallback_provider() {
    let dir = tempfile::tempdir().unwrap();
    let path = registry_path(dir.path());
    let mut config = test_config();
    config.retry.max_attempts = 5;
    config.stages.extraction.concurrency = 1;

    let x = Arc::new(
        MockProvider::new("x").failing_with(ProviderError::transient(TransientKind::ServerError, "503")),
    );
    let y = json_provider("y");
    let orch = orchestrator(&path, config, Arc::new(MockStages::new()), &[x.clone(), y.clone()]).await;

    let report = orch
        .run_batch(
            [fixtures::topic("alpha", &["method"])],
            vec![
                DiscoveredDocument::new(fixtures::paper("10.1/a", "First Paper"), "alpha"),
                DiscoveredDocument::new(fixtures::paper("10.1/b", "Second Paper"), "alpha"),
            ],
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.count(DocumentStatus::New), 2);
    for outcome in &report.outcomes {
        assert_eq!(outcome.extraction.as_ref().unwrap().provider, "y");
    }
    // Five failures opened x; the second document never reached it.
    assert_eq!(x.calls(), 5);
    assert_eq!(y.calls(), 2);

    let health = orch.extractor().health_report().await;
    assert_eq!(health[0].provider, "x");
    assert_eq!(health[0].breaker.state, paper_pipeline::CircuitState::Open);
}

#[tokio::test]
async fn test_concurrent_upserts_of_one_paper_merge_affiliations() {
    let dir = tempfile::tempdir().unwrap();
    let path = registry_path(dir.path());
    let store = Arc::new(RegistryStore::load(&path, "doi").await.unwrap());
    let seeded = store
        .upsert(RegistryDelta::default().with_identifier("doi", "10.1/d").with_topic("seed"))
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        store.upsert(RegistryDelta::affiliation(seeded.paper_id, &TopicId::from("alpha"))),
        store.upsert(RegistryDelta::affiliation(seeded.paper_id, &TopicId::from("beta"))),
    );
    assert_eq!(a.unwrap().paper_id, seeded.paper_id);
    assert_eq!(b.unwrap().paper_id, seeded.paper_id);

    let reloaded = RegistryStore::load(&path, "doi").await.unwrap();
    let snapshot = reloaded.snapshot();
    assert_eq!(snapshot.len(), 1);
    let entry = snapshot.get(&seeded.paper_id).unwrap();
    assert_eq!(entry.topic_affiliations.len(), 3);
}

#[tokio::test]
async fn test_same_paper_under_two_topics_in_one_run_is_one_entry() {
    let dir = tempfile::tempdir().unwrap();
    let path = registry_path(dir.path());
    let provider = json_provider("x");
    let orch = orchestrator(&path, test_config(), Arc::new(MockStages::new()), &[provider]).await;
    let paper = fixtures::paper("10.1/shared", "Shared Paper");

    let report = orch
        .run_batch(
            alpha_beta(&["method"]),
            vec![
                DiscoveredDocument::new(paper.clone(), "alpha"),
                DiscoveredDocument::new(paper, "beta"),
            ],
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(report.is_success());

    let registry = RegistryStore::load(&path, "doi").await.unwrap();
    let snapshot = registry.snapshot();
    assert_eq!(snapshot.len(), 1);
    let entry = snapshot.entries().next().unwrap();
    assert!(entry.is_affiliated(&TopicId::from("alpha")));
    assert!(entry.is_affiliated(&TopicId::from("beta")));
}

#[tokio::test]
async fn test_only_full_process_touches_acquisition_and_conversion() {
    let dir = tempfile::tempdir().unwrap();
    let path = registry_path(dir.path());
    let provider = json_provider("x");
    let papers = [
        fixtures::paper("10.1/skip", "Skip Me"),
        fixtures::paper("10.1/map", "Map Me"),
        fixtures::paper("10.1/backfill", "Backfill Me"),
    ];

    let orch = orchestrator(&path, test_config(), Arc::new(MockStages::new()), &[provider.clone()]).await;
    orch.run_batch(
        [fixtures::topic("alpha", &["method"])],
        papers
            .iter()
            .map(|p| DiscoveredDocument::new(p.clone(), "alpha"))
            .collect(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let stages = Arc::new(MockStages::new());
    let orch = orchestrator(&path, test_config(), stages.clone(), &[provider]).await;
    let report = orch
        .run_batch(
            [
                fixtures::topic("alpha", &["method"]),
                fixtures::topic("beta", &["method"]),
                fixtures::topic("gamma", &["method", "results"]),
            ],
            vec![
                DiscoveredDocument::new(papers[0].clone(), "alpha"),
                DiscoveredDocument::new(papers[1].clone(), "beta"),
                DiscoveredDocument::new(papers[2].clone(), "gamma"),
            ],
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let mut actions: Vec<_> = report
        .outcomes
        .iter()
        .map(|o| (o.record.title.clone(), o.action))
        .collect();
    actions.sort();
    assert_eq!(
        actions,
        [
            ("Backfill Me".to_string(), Some(ProcessingAction::Backfill)),
            ("Map Me".to_string(), Some(ProcessingAction::MapOnly)),
            ("Skip Me".to_string(), Some(ProcessingAction::Skip)),
        ]
    );
    assert!(stages.acquired().is_empty());
    assert!(stages.converted().is_empty());
}

#[tokio::test]
async fn test_failed_documents_are_retried_by_the_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = registry_path(dir.path());
    let provider = json_provider("x");
    let broken = fixtures::paper("10.1/broken", "Scanned Paper");
    let fine = fixtures::paper("10.1/fine", "Born Digital Paper");
    let docs = vec![
        DiscoveredDocument::new(broken.clone(), "alpha"),
        DiscoveredDocument::new(fine, "alpha"),
    ];
    let topic = || [fixtures::topic("alpha", &["method"])];

    let stages = Arc::new(MockStages::new().with_convert_failure(
        "10.1/broken",
        paper_pipeline::CollaboratorError::permanent("no text layer"),
    ));
    let orch = orchestrator(&path, test_config(), stages, &[provider.clone()]).await;
    let report = orch.run_batch(topic(), docs.clone(), CancellationToken::new()).await.unwrap();

    assert_eq!(report.count(DocumentStatus::New), 1);
    let failed: Vec<_> = report.failed().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].record.title, broken.title);
    assert_eq!(failed[0].failure.as_ref().unwrap().kind, FailureKind::Stage);
    assert_eq!(report.succeeded().count(), 1);

    let orch = orchestrator(&path, test_config(), Arc::new(MockStages::new()), &[provider]).await;
    let report = orch.run_batch(topic(), docs, CancellationToken::new()).await.unwrap();
    assert_eq!(report.count(DocumentStatus::New), 1);
    assert_eq!(report.count(DocumentStatus::Skipped), 1);
}

#[tokio::test]
async fn test_fatal_provider_errors_fail_the_document_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = registry_path(dir.path());
    let x = Arc::new(
        MockProvider::new("x")
            .with_error(ProviderError::fatal(FatalKind::MalformedRequest, "context too long"))
            .with_default_response("{}"),
    );
    let mut config = test_config().with_providers(["x"]);
    config.stages.extraction.concurrency = 1;
    let orch = orchestrator(&path, config, Arc::new(MockStages::new()), &[x.clone()]).await;

    let report = orch
        .run_batch(
            [fixtures::topic("alpha", &["method"])],
            vec![
                DiscoveredDocument::new(fixtures::paper("10.1/a", "Huge Paper"), "alpha"),
                DiscoveredDocument::new(fixtures::paper("10.1/b", "Normal Paper"), "alpha"),
            ],
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.count(DocumentStatus::Failed), 1);
    assert_eq!(report.count(DocumentStatus::New), 1);
    assert_eq!(
        report.failed().next().unwrap().failure.as_ref().unwrap().kind,
        FailureKind::ProvidersUnavailable
    );
    assert!(report.llm_halted.is_none());
}

/// Seed two entries under alpha: one known by DOI, one by an arXiv id only.
async fn seed_doi_and_arxiv_entries(
    path: &std::path::Path,
    provider: &Arc<MockProvider>,
    targets: &[&str],
) {
    let orch = orchestrator(path, test_config(), Arc::new(MockStages::new()), &[provider.clone()]).await;
    let report = orch
        .run_batch(
            alpha_beta(targets),
            vec![
                DiscoveredDocument::new(fixtures::paper("10.1/a", "Sparse Attention at Scale"), "alpha"),
                DiscoveredDocument::new(fixtures::preprint("arxiv:7", "Graph Kernels Revisited"), "alpha"),
            ],
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(report.count(DocumentStatus::New), 2);
}

#[tokio::test]
async fn test_conflicting_identifiers_stay_with_their_owner_on_map_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = registry_path(dir.path());
    let provider = json_provider("x");
    seed_doi_and_arxiv_entries(&path, &provider, &["method"]).await;

    // A listing that glues both papers' identifiers together, under beta.
    let glued = fixtures::paper("10.1/a", "Sparse Attention at Scale").with_scoped_id("arxiv:7");
    let orch = orchestrator(&path, test_config(), Arc::new(MockStages::new()), &[provider.clone()]).await;
    let report = orch
        .run_batch(
            alpha_beta(&["method"]),
            vec![DiscoveredDocument::new(glued, "beta")],
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let outcome = &report.outcomes[0];
    assert_eq!(outcome.action, Some(ProcessingAction::MapOnly));
    assert_eq!(outcome.status, DocumentStatus::Mapped);

    let registry = RegistryStore::load(&path, "doi").await.unwrap();
    let snapshot = registry.snapshot();
    assert_eq!(snapshot.len(), 2);
    let by_doi = snapshot.find_by_identifier("doi", "10.1/a").unwrap();
    let by_arxiv = snapshot.find_by_identifier("arxiv", "7").unwrap();
    assert_ne!(by_doi.paper_id, by_arxiv.paper_id);
    assert!(!by_doi.identifiers.contains_key("arxiv"));
    assert_eq!(by_arxiv.identifiers.get("arxiv").map(String::as_str), Some("7"));
    assert!(by_doi.is_affiliated(&TopicId::from("beta")));
    assert!(!by_arxiv.is_affiliated(&TopicId::from("beta")));
}

#[tokio::test]
async fn test_conflicting_identifiers_stay_with_their_owner_on_backfill() {
    let dir = tempfile::tempdir().unwrap();
    let path = registry_path(dir.path());
    let provider = json_provider("x");
    seed_doi_and_arxiv_entries(&path, &provider, &["method"]).await;
    let before = RegistryStore::load(&path, "doi").await.unwrap().snapshot();
    let arxiv_hash = before
        .find_by_identifier("arxiv", "7")
        .unwrap()
        .extraction_target_hash
        .clone();

    // Alpha gains a target, and the paper comes back carrying both ids.
    let alpha = fixtures::topic("alpha", &["method", "limitations"]);
    let new_hash = alpha.requirement_hash().clone();
    let glued = fixtures::paper("10.1/a", "Sparse Attention at Scale").with_scoped_id("arxiv:7");
    let stages = Arc::new(MockStages::new().with_stored_text("10.1/a", "Stored full text"));
    let orch = orchestrator(&path, test_config(), stages, &[provider.clone()]).await;
    let report = orch
        .run_batch([alpha], vec![DiscoveredDocument::new(glued, "alpha")], CancellationToken::new())
        .await
        .unwrap();

    let outcome = &report.outcomes[0];
    assert_eq!(outcome.action, Some(ProcessingAction::Backfill));
    assert_eq!(outcome.status, DocumentStatus::Backfilled);

    let registry = RegistryStore::load(&path, "doi").await.unwrap();
    let snapshot = registry.snapshot();
    assert_eq!(snapshot.len(), 2);
    let by_doi = snapshot.find_by_identifier("doi", "10.1/a").unwrap();
    let by_arxiv = snapshot.find_by_identifier("arxiv", "7").unwrap();
    assert_ne!(by_doi.paper_id, by_arxiv.paper_id);
    assert!(!by_doi.identifiers.contains_key("arxiv"));
    assert_eq!(by_doi.extraction_target_hash, Some(new_hash));
    assert_eq!(by_arxiv.extraction_target_hash, arxiv_hash);
}

#[tokio::test]
async fn test_secondary_identifiers_owned_by_two_entries_are_not_moved() {
    let dir = tempfile::tempdir().unwrap();
    let path = registry_path(dir.path());
    let provider = json_provider("x");

    let orch = orchestrator(&path, test_config(), Arc::new(MockStages::new()), &[provider.clone()]).await;
    orch.run_batch(
        alpha_beta(&["method"]),
        vec![
            DiscoveredDocument::new(fixtures::preprint("arxiv:1", "Contrastive Pretraining for Code"), "alpha"),
            DiscoveredDocument::new(fixtures::preprint("openalex:W2", "Protein Folding with Diffusion"), "alpha"),
        ],
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let glued = fixtures::preprint("arxiv:1", "Contrastive Pretraining for Code")
        .with_scoped_id("openalex:W2");
    let orch = orchestrator(&path, test_config(), Arc::new(MockStages::new()), &[provider.clone()]).await;
    let report = orch
        .run_batch(
            alpha_beta(&["method"]),
            vec![DiscoveredDocument::new(glued, "beta")],
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(report.outcomes[0].action, Some(ProcessingAction::MapOnly));

    let registry = RegistryStore::load(&path, "doi").await.unwrap();
    let snapshot = registry.snapshot();
    let first = snapshot.find_by_identifier("arxiv", "1").unwrap();
    let second = snapshot.find_by_identifier("openalex", "W2").unwrap();
    assert_ne!(first.paper_id, second.paper_id);
    assert!(!first.identifiers.contains_key("openalex"));
    assert!(first.is_affiliated(&TopicId::from("beta")));
    assert!(!second.is_affiliated(&TopicId::from("beta")));
}
