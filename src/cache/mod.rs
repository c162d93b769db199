// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Semantic response cache
//!
//! Stores prior (query embedding, response) pairs per owner and serves a
//! cached response when a new query lands semantically close enough. Entries
//! are never served across owners. The similarity threshold is the
//! precision/recall dial: raising it trades cache hits for fewer
//! false-positive answers, so it is configuration, not a constant.

pub mod semantic;

pub use semantic::{
    CacheHit, CacheStats, QueryIntent, QuerySensitivity, SemanticCacheConfig, SemanticCacheError,
    SemanticResponseCache,
};
