// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Streaming generation through the orchestrator: chunk delivery, post-stream
//! caching, and cancellation.

mod common;

use std::time::Duration;

use common::{build_engine, build_engine_full};
use futures_util::StreamExt;
use pixie_context_engine::*;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_stream_delivers_full_text_and_caches_it() {
    let engine = build_engine();
    engine.cheap.push_success("streamed answer text");

    let mut stream = engine
        .orchestrator
        .stream_query(
            QueryRequest::read("u1", "what did I plan for friday"),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let mut collected = String::new();
    let mut saw_final = false;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.unwrap();
        collected.push_str(&chunk.delta);
        saw_final = chunk.is_final;
    }
    assert_eq!(collected, "streamed answer text");
    assert!(saw_final);

    // The completed stream was written back to the semantic cache.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let embedding = engine
        .embedder
        .embed("what did I plan for friday")
        .await
        .unwrap();
    let hit = engine.cache.lookup("u1", &embedding, None).await.unwrap();
    assert_eq!(hit.unwrap().response.text, "streamed answer text");
}

#[tokio::test]
async fn test_cached_answer_streams_as_single_chunk() {
    let engine = build_engine();

    engine
        .orchestrator
        .handle_query(QueryRequest::read("u1", "upcoming deadlines"))
        .await
        .unwrap();
    let model_calls = engine.cheap.call_count();

    let mut stream = engine
        .orchestrator
        .stream_query(
            QueryRequest::read("u1", "upcoming deadlines"),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let chunk = stream.next().await.unwrap().unwrap();
    assert!(chunk.is_final);
    assert_eq!(chunk.delta, "response from cheap");
    assert!(stream.next().await.is_none());
    // Served from cache, no new model call
    assert_eq!(engine.cheap.call_count(), model_calls);
}

#[tokio::test]
async fn test_cancelled_stream_does_not_cache_partial_answer() {
    let engine = build_engine_full(OrchestratorConfig::default(), Duration::from_millis(300));

    let cancel = CancellationToken::new();
    let mut stream = engine
        .orchestrator
        .stream_query(QueryRequest::read("u1", "summarize my week"), cancel.clone())
        .await
        .unwrap();

    // Cancel while the slow provider is still generating.
    cancel.cancel();
    let mut chunks = 0;
    while let Some(chunk) = stream.next().await {
        chunk.unwrap();
        chunks += 1;
    }
    assert_eq!(chunks, 0);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(engine.cache.is_empty().await, "cancelled stream was cached");
}

#[tokio::test]
async fn test_stream_degrades_to_static_answer_on_total_outage() {
    let engine = build_engine();
    let outage = ModelError::Unavailable {
        reason: "outage".to_string(),
    };
    // route_stream takes one attempt per tier
    engine.cheap.push_failures(2, outage.clone());
    engine.medium.push_failures(2, outage.clone());
    engine.premium.push_failures(2, outage);

    let mut stream = engine
        .orchestrator
        .stream_query(
            QueryRequest::read("u1", "anything else today"),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let chunk = stream.next().await.unwrap().unwrap();
    assert!(chunk.is_final);
    assert!(!chunk.delta.is_empty());
    assert_eq!(engine.metrics.snapshot().degraded_responses, 1);
}
