// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod cache;
pub mod config;
pub mod context;
pub mod embeddings;
pub mod index;
pub mod ingestion;
pub mod monitoring;
pub mod orchestrator;
pub mod router;

// Re-export main types from the embedding layer
pub use embeddings::{
    Embedding, EmbeddingClient, EmbeddingConfig, EmbeddingError, EmbeddingProvider,
    HttpEmbeddingProvider, MockEmbeddingProvider,
};

// Re-export index types
pub use index::{
    Document, DocumentKind, IndexConfig, IndexError, IndexStats, ScoredDocument, SearchFilter,
    UpsertOutcome, VectorIndex,
};

// Re-export ingestion types
pub use ingestion::{
    BatchIngestReport, DocumentSource, IngestError, IngestionPipeline, InMemoryDocumentSource,
    ReconcileScope, ReconciliationRecord, ReconciliationReport, Reconciler, SourceDocument,
    SourceError,
};

// Re-export semantic cache types
pub use cache::{
    CacheStats, QueryIntent, QuerySensitivity, SemanticCacheConfig, SemanticCacheError,
    SemanticResponseCache,
};

// Re-export context assembly types
pub use context::{AssemblerConfig, ContextAssembler, ContextPayload, QueryType};

// Re-export router types
pub use router::{
    BudgetState, CircuitBreaker, CostTracker, MockModelProvider, ModelError, ModelProvider,
    ModelResponse, ModelTier, ModelRouter, RouterConfig, RouterError, RoutingDecision,
    RoutingTelemetry, StreamChunk, ToolCall, ToolSpec,
};

// Re-export orchestrator types
pub use orchestrator::{
    ChatRole, ChatTurn, OrchestratorConfig, QueryError, QueryRequest, QueryResponse,
    ResponseSource, RetrievalOrchestrator,
};

pub use config::EngineConfig;
pub use monitoring::{EngineMetrics, MetricsSnapshot};
