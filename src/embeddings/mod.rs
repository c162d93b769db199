// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Embedding generation with content-addressed memoization
//!
//! Wraps an external embedding provider behind [`EmbeddingProvider`] and
//! memoizes results by a content hash of the normalized input text, so
//! identical text never pays for a second provider round trip. The cache is
//! shared across tenants: for a fixed provider/model version the text→vector
//! mapping is deterministic, so embeddings carry no per-user state.

pub mod cache;
pub mod client;
pub mod provider;
pub mod types;

pub use cache::EmbeddingCache;
pub use client::EmbeddingClient;
pub use provider::{EmbeddingProvider, HttpEmbeddingProvider, MockEmbeddingProvider};
pub use types::{Embedding, EmbeddingConfig, EmbeddingError};
