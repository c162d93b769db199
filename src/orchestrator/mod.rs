// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Retrieval orchestration
//!
//! Top-level coordinator for the query path: embed the query, check the
//! semantic cache, search the index, assemble a budgeted context, invoke the
//! router, then write the cache. Stages within one query are sequential;
//! independent queries share nothing but the caches, index and counters.
//!
//! Failure never cascades raw to the caller: retrieval trouble degrades to
//! "context unavailable", a total provider outage falls back to the semantic
//! cache at a relaxed threshold and then to a static response, and the
//! query-level deadline turns a hang into a degraded answer.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{QueryIntent, QuerySensitivity, SemanticResponseCache};
use crate::context::{classify_query, ContextAssembler, ContextPayload, QueryType};
use crate::embeddings::{Embedding, EmbeddingClient};
use crate::index::{IndexError, ScoredDocument, SearchFilter, VectorIndex};
use crate::monitoring::EngineMetrics;
use crate::router::{
    ModelError, ModelResponse, ModelRouter, RouterError, StreamChunk, ToolCall, ToolSpec,
};

pub use crate::context::{ChatRole, ChatTurn};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Overall per-query deadline; expiry yields a degraded response.
    pub query_deadline_ms: u64,
    /// Top-k documents fetched from the index.
    pub search_k: usize,
    /// Similarity floor for retrieved documents.
    pub search_min_score: f32,
    /// Token budget handed to the context assembler.
    pub token_budget: usize,
    /// Tools offered to the model on every generation.
    pub tools: Vec<ToolSpec>,
    /// Last-resort response when every provider path is down.
    pub static_fallback_text: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            query_deadline_ms: 10_000,
            search_k: 8,
            search_min_score: 0.15,
            token_budget: 2048,
            tools: Vec::new(),
            static_fallback_text:
                "I can't reach the assistant service right now. Please try again in a moment."
                    .to_string(),
        }
    }
}

/// A query as handed over by the chat/transport layer.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub owner_id: String,
    pub query_text: String,
    pub conversation_history: Vec<ChatTurn>,
    pub query_type_hint: Option<QueryType>,
    /// Caller-supplied read/write classification; write-intent responses are
    /// never cached.
    pub intent: QueryIntent,
    /// Caller-supplied freshness classification; time-sensitive answers get
    /// the short cache TTL.
    pub sensitivity: QuerySensitivity,
}

impl QueryRequest {
    /// A plain read query with no history.
    pub fn read(owner_id: &str, query_text: &str) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            query_text: query_text.to_string(),
            conversation_history: Vec::new(),
            query_type_hint: None,
            intent: QueryIntent::Read,
            sensitivity: QuerySensitivity::Normal,
        }
    }
}

/// Where the response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseSource {
    Cache,
    Generated,
    /// Degraded static answer produced without a model call.
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub response_text: String,
    pub tool_calls: Vec<ToolCall>,
    pub source: ResponseSource,
    /// True when context had to be truncated to fit the token budget.
    pub truncated: bool,
}

/// User-visible query failure: bounded message plus machine-readable kind.
/// Internal errors and stack traces never cross this boundary.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error("{message}")]
    InvalidRequest { message: String },

    #[error("The request was rejected. Please rephrase and try again.")]
    ProviderRejected,
}

impl QueryError {
    pub fn kind(&self) -> &'static str {
        match self {
            QueryError::InvalidRequest { .. } => "invalid_request",
            QueryError::ProviderRejected => "provider_rejected",
        }
    }
}

/// Coordinates one query through every stage of the engine.
pub struct RetrievalOrchestrator {
    config: OrchestratorConfig,
    embedder: Arc<EmbeddingClient>,
    index: Arc<VectorIndex>,
    cache: Arc<SemanticResponseCache>,
    assembler: ContextAssembler,
    router: Arc<ModelRouter>,
    metrics: Arc<EngineMetrics>,
}

impl RetrievalOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        embedder: Arc<EmbeddingClient>,
        index: Arc<VectorIndex>,
        cache: Arc<SemanticResponseCache>,
        assembler: ContextAssembler,
        router: Arc<ModelRouter>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            config,
            embedder,
            index,
            cache,
            assembler,
            router,
            metrics,
        }
    }

    /// Serve one query end to end, under the overall deadline.
    pub async fn handle_query(&self, request: QueryRequest) -> Result<QueryResponse, QueryError> {
        self.validate(&request)?;
        self.metrics.record_query();

        let deadline = Duration::from_millis(self.config.query_deadline_ms);
        match tokio::time::timeout(deadline, self.process(&request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    owner_id = %request.owner_id,
                    deadline_ms = self.config.query_deadline_ms,
                    "query deadline expired, returning degraded response"
                );
                self.metrics.record_degraded();
                Ok(self.static_fallback())
            }
        }
    }

    /// Run the pipeline detached and deliver over a oneshot channel.
    ///
    /// If the caller disconnects and drops the receiver, the pipeline still
    /// runs to completion so provider results populate the caches; the
    /// failed send is ignored rather than delivered to a closed channel.
    pub fn spawn_query(
        self: &Arc<Self>,
        request: QueryRequest,
    ) -> oneshot::Receiver<Result<QueryResponse, QueryError>> {
        let orchestrator = Arc::clone(self);
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = orchestrator.handle_query(request).await;
            if tx.send(result).is_err() {
                debug!("caller disconnected before the response was ready");
            }
        });
        rx
    }

    async fn process(&self, request: &QueryRequest) -> Result<QueryResponse, QueryError> {
        let query_embedding = self.embed_query(request).await;

        if let Some(hit) = self.cache_lookup(request, query_embedding.as_ref(), None).await {
            self.metrics.record_cache_hit();
            return Ok(QueryResponse {
                response_text: hit.text,
                tool_calls: hit.tool_calls,
                source: ResponseSource::Cache,
                truncated: false,
            });
        }
        self.metrics.record_cache_miss();

        let documents = self.retrieve(request, query_embedding.as_ref()).await?;
        let payload = self.assemble(request, &documents);

        match self
            .router
            .route(
                &payload.text,
                &self.config.tools,
                &request.query_text,
                request.conversation_history.len(),
            )
            .await
        {
            Ok(routed) => {
                self.metrics.record_generated();
                self.cache_store(request, query_embedding, &routed.response)
                    .await;
                Ok(QueryResponse {
                    response_text: routed.response.text,
                    tool_calls: routed.response.tool_calls,
                    source: ResponseSource::Generated,
                    truncated: payload.truncated,
                })
            }
            Err(RouterError::Terminal(error)) => {
                warn!(error = %error, "terminal provider error surfaced to caller");
                Err(QueryError::ProviderRejected)
            }
            Err(error) => {
                warn!(error = %error, "all provider paths failed, degrading");
                Ok(self.degraded_response(request, query_embedding.as_ref()).await)
            }
        }
    }

    /// Total-outage ladder: relaxed-threshold cache, then the static answer.
    async fn degraded_response(
        &self,
        request: &QueryRequest,
        query_embedding: Option<&Embedding>,
    ) -> QueryResponse {
        self.metrics.record_degraded();
        self.metrics.record_fallback();

        let relaxed = self.cache.config().relaxed_threshold;
        if let Some(hit) = self
            .cache_lookup(request, query_embedding, Some(relaxed))
            .await
        {
            info!(owner_id = %request.owner_id, "serving relaxed-threshold cached response");
            return QueryResponse {
                response_text: hit.text,
                tool_calls: hit.tool_calls,
                source: ResponseSource::Cache,
                truncated: false,
            };
        }

        self.static_fallback()
    }

    fn static_fallback(&self) -> QueryResponse {
        QueryResponse {
            response_text: self.config.static_fallback_text.clone(),
            tool_calls: Vec::new(),
            source: ResponseSource::Fallback,
            truncated: false,
        }
    }

    /// Embed the query; a provider failure degrades retrieval instead of
    /// failing the query.
    async fn embed_query(&self, request: &QueryRequest) -> Option<Embedding> {
        match self.embedder.embed(&request.query_text).await {
            Ok(embedding) => Some(embedding),
            Err(e) => {
                warn!(error = %e, "query embedding failed, retrieval degraded");
                None
            }
        }
    }

    async fn cache_lookup(
        &self,
        request: &QueryRequest,
        query_embedding: Option<&Embedding>,
        threshold_override: Option<f32>,
    ) -> Option<ModelResponse> {
        if request.intent != QueryIntent::Read {
            return None;
        }
        let embedding = query_embedding?;
        match self
            .cache
            .lookup(&request.owner_id, embedding, threshold_override)
            .await
        {
            Ok(Some(hit)) => {
                debug!(
                    similarity = hit.similarity,
                    query_text_hash = %hit.query_text_hash,
                    "semantic cache answered"
                );
                Some(hit.response)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "semantic cache lookup failed");
                None
            }
        }
    }

    async fn cache_store(
        &self,
        request: &QueryRequest,
        query_embedding: Option<Embedding>,
        response: &ModelResponse,
    ) {
        let Some(embedding) = query_embedding else {
            return;
        };
        if let Err(e) = self
            .cache
            .store(
                &request.owner_id,
                &request.query_text,
                embedding,
                response.clone(),
                request.sensitivity,
                request.intent,
            )
            .await
        {
            warn!(error = %e, "semantic cache store failed");
        }
    }

    /// Vector search; consistency anomalies degrade to "no context".
    async fn retrieve(
        &self,
        request: &QueryRequest,
        query_embedding: Option<&Embedding>,
    ) -> Result<Vec<ScoredDocument>, QueryError> {
        let Some(embedding) = query_embedding else {
            return Ok(Vec::new());
        };

        let filter = SearchFilter {
            kind: None,
            min_score: Some(self.config.search_min_score),
        };
        match self
            .index
            .search(
                &request.owner_id,
                embedding.data(),
                self.config.search_k,
                &filter,
            )
            .await
        {
            Ok(documents) => Ok(documents),
            Err(IndexError::MissingOwnerFilter) => Err(QueryError::InvalidRequest {
                message: "owner_id is required".to_string(),
            }),
            Err(e) => {
                warn!(error = %e, "vector search failed, context unavailable");
                Ok(Vec::new())
            }
        }
    }

    fn assemble(&self, request: &QueryRequest, documents: &[ScoredDocument]) -> ContextPayload {
        let query_type = classify_query(&request.query_text, request.query_type_hint);
        self.assembler.assemble(
            documents,
            &request.conversation_history,
            &request.query_text,
            query_type,
            self.config.token_budget,
        )
    }

    fn validate(&self, request: &QueryRequest) -> Result<(), QueryError> {
        if request.owner_id.trim().is_empty() {
            return Err(QueryError::InvalidRequest {
                message: "owner_id is required".to_string(),
            });
        }
        if request.query_text.trim().is_empty() {
            return Err(QueryError::InvalidRequest {
                message: "query_text is required".to_string(),
            });
        }
        Ok(())
    }

    /// Serve one query as a cancellable chunk stream.
    ///
    /// Cache hits and degraded answers replay as a single final chunk. For
    /// generated answers the full text is cached only after the stream
    /// completes cleanly; cancelling via the token stops delivery without
    /// caching a half answer.
    pub async fn stream_query(
        &self,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> Result<ReceiverStream<Result<StreamChunk, ModelError>>, QueryError> {
        self.validate(&request)?;
        self.metrics.record_query();

        let query_embedding = self.embed_query(&request).await;

        if let Some(hit) = self.cache_lookup(&request, query_embedding.as_ref(), None).await {
            self.metrics.record_cache_hit();
            return Ok(single_chunk_stream(hit.text));
        }
        self.metrics.record_cache_miss();

        let documents = self.retrieve(&request, query_embedding.as_ref()).await?;
        let payload = self.assemble(&request, &documents);

        let routed = self
            .router
            .route_stream(
                &payload.text,
                &self.config.tools,
                &request.query_text,
                request.conversation_history.len(),
            )
            .await;

        let (mut upstream, decision) = match routed {
            Ok(pair) => pair,
            Err(RouterError::Terminal(_)) => return Err(QueryError::ProviderRejected),
            Err(e) => {
                warn!(error = %e, "streaming fallback to degraded response");
                let degraded = self.degraded_response(&request, query_embedding.as_ref()).await;
                return Ok(single_chunk_stream(degraded.response_text));
            }
        };
        self.metrics.record_generated();

        let (tx, rx) = mpsc::channel(16);
        let cache = Arc::clone(&self.cache);
        let chosen_tier = decision.chosen_tier;
        tokio::spawn(async move {
            let mut collected = String::new();
            let mut completed = false;

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("stream cancelled by caller");
                        break;
                    }
                    chunk = upstream.next() => {
                        match chunk {
                            Some(Ok(chunk)) => {
                                collected.push_str(&chunk.delta);
                                completed = chunk.is_final;
                                if tx.send(Ok(chunk)).await.is_err() {
                                    // Receiver dropped; let the upstream
                                    // finish into the void, nothing to cache.
                                    break;
                                }
                                if completed {
                                    break;
                                }
                            }
                            Some(Err(e)) => {
                                let _ = tx.send(Err(e)).await;
                                break;
                            }
                            None => {
                                completed = true;
                                break;
                            }
                        }
                    }
                }
            }

            if completed {
                let Some(embedding) = query_embedding else {
                    return;
                };
                let response = ModelResponse {
                    text: collected,
                    tool_calls: Vec::new(),
                    model: format!("stream-{}", chosen_tier),
                    tier: chosen_tier,
                    cost_microdollars: 0,
                };
                if let Err(e) = cache
                    .store(
                        &request.owner_id,
                        &request.query_text,
                        embedding,
                        response,
                        request.sensitivity,
                        request.intent,
                    )
                    .await
                {
                    warn!(error = %e, "post-stream cache store failed");
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }
}

/// A stream that delivers one final chunk.
fn single_chunk_stream(text: String) -> ReceiverStream<Result<StreamChunk, ModelError>> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let _ = tx
            .send(Ok(StreamChunk {
                delta: text,
                is_final: true,
            }))
            .await;
    });
    ReceiverStream::new(rx)
}
