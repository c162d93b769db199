// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Query complexity scoring
//!
//! Deterministic 0–10 score over query text and conversation length. The
//! signals are crude on purpose: the score only has to pick a tier, and a
//! wrong pick is corrected by the fallback chain, not by a smarter scorer.

/// Keywords that mark a query as needing real reasoning.
const COMPLEX_INTENT_KEYWORDS: [&str; 12] = [
    "analyze",
    "analyse",
    "compare",
    "draft",
    "organize",
    "plan",
    "prioritize",
    "recommend",
    "reschedule",
    "summarize",
    "summarise",
    "why",
];

/// Score a query from 0 (trivial) to 10 (hardest).
///
/// Inputs: intent keywords, conversation-history length, question-mark
/// count, and text length. Same inputs always give the same score.
pub fn score(query: &str, history_len: usize) -> u8 {
    let lower = query.to_lowercase();

    let keyword_hits = COMPLEX_INTENT_KEYWORDS
        .iter()
        .filter(|k| lower.contains(*k))
        .count();
    let keyword_score = (keyword_hits * 2).min(4);

    let question_score = query.matches('?').count().min(2);

    let length_score = (query.chars().count() / 80).min(2);

    let history_score = (history_len / 4).min(2);

    (keyword_score + question_score + length_score + history_score).min(10) as u8
}
