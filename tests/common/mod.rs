// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Shared test harness: a full engine wired to in-memory mocks.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use pixie_context_engine::ingestion::Reconciler;
use pixie_context_engine::router::BreakerConfig;
use pixie_context_engine::*;

pub const DIM: usize = 64;

pub struct TestEngine {
    pub orchestrator: Arc<RetrievalOrchestrator>,
    pub pipeline: Arc<IngestionPipeline>,
    pub source: Arc<InMemoryDocumentSource>,
    pub reconciler: Arc<Reconciler>,
    pub embedder: Arc<EmbeddingClient>,
    pub embedding_provider: Arc<MockEmbeddingProvider>,
    pub index: Arc<VectorIndex>,
    pub cache: Arc<SemanticResponseCache>,
    pub cheap: Arc<MockModelProvider>,
    pub medium: Arc<MockModelProvider>,
    pub premium: Arc<MockModelProvider>,
    pub metrics: Arc<EngineMetrics>,
}

/// Engine-wide defaults for tests: small vectors, no real backoff waits.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.embedding.dimension = DIM;
    config.index.dimension = DIM;
    config.router.max_retries_per_tier = 1;
    config.router.base_backoff_ms = 1;
    config.router.max_backoff_ms = 2;
    config.router.breaker = BreakerConfig {
        cooldown: Duration::from_millis(50),
        ..Default::default()
    };
    config.orchestrator.search_min_score = 0.1;
    config
}

pub fn build_engine() -> TestEngine {
    build_engine_from(test_config(), Duration::ZERO)
}

pub fn build_engine_with(orchestrator_config: OrchestratorConfig) -> TestEngine {
    let mut config = test_config();
    config.orchestrator = orchestrator_config;
    build_engine_from(config, Duration::ZERO)
}

pub fn build_engine_full(
    orchestrator_config: OrchestratorConfig,
    model_latency: Duration,
) -> TestEngine {
    let mut config = test_config();
    config.orchestrator = orchestrator_config;
    build_engine_from(config, model_latency)
}

pub fn build_engine_from(config: EngineConfig, model_latency: Duration) -> TestEngine {
    config.validate().expect("test engine config must be valid");

    let embedding_provider = Arc::new(MockEmbeddingProvider::new(config.embedding.dimension));
    let embedder = Arc::new(EmbeddingClient::new(
        config.embedding.clone(),
        embedding_provider.clone(),
    ));

    let index = Arc::new(VectorIndex::new(config.index.clone()));
    let cache = Arc::new(SemanticResponseCache::new(config.semantic_cache.clone()));

    let cheap = Arc::new(MockModelProvider::new(ModelTier::Cheap).with_latency(model_latency));
    let medium = Arc::new(MockModelProvider::new(ModelTier::Medium).with_latency(model_latency));
    let premium = Arc::new(MockModelProvider::new(ModelTier::Premium).with_latency(model_latency));

    let cost_tracker = Arc::new(CostTracker::new(
        config.cost_ceiling_microdollars,
        config.cost_window(),
    ));
    let router = Arc::new(ModelRouter::new(
        config.router.clone(),
        vec![cheap.clone(), medium.clone(), premium.clone()],
        cost_tracker,
    ));

    let assembler = ContextAssembler::new(config.assembler.clone());
    let metrics = Arc::new(EngineMetrics::new());

    let orchestrator = Arc::new(RetrievalOrchestrator::new(
        config.orchestrator.clone(),
        embedder.clone(),
        index.clone(),
        cache.clone(),
        assembler,
        router,
        metrics.clone(),
    ));

    let pipeline = Arc::new(IngestionPipeline::new(embedder.clone(), index.clone()));
    let source = Arc::new(InMemoryDocumentSource::new());
    let reconciler = Arc::new(Reconciler::new(source.clone(), pipeline.clone()));

    TestEngine {
        orchestrator,
        pipeline,
        source,
        reconciler,
        embedder,
        embedding_provider,
        index,
        cache,
        cheap,
        medium,
        premium,
        metrics,
    }
}

pub fn task_doc(owner: &str, id: &str, content: &str) -> SourceDocument {
    SourceDocument {
        owner_id: owner.to_string(),
        document_id: id.to_string(),
        kind: DocumentKind::Task,
        content: content.to_string(),
        metadata: serde_json::json!({
            "title": content,
            "status": "open",
            "priority": "medium",
        }),
        version: 1,
    }
}
