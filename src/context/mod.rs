// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Token-budgeted context assembly
//!
//! Takes retrieved documents plus conversation history and shapes the
//! smallest payload that still answers the query. Field projection is keyed
//! by a query-type classification; a per-kind minimum field set survives
//! every projection so aggressive filtering can never drop what a coherent
//! answer needs. Output is deterministic for identical inputs.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::index::{DocumentKind, ScoredDocument};

/// Role of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One turn of conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

/// Query-type classification driving field projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    /// Enumeration queries: keep a minimal field subset per item.
    List,
    /// Single-item queries: keep the full record.
    Detail,
    /// Everything else: strip internal identifiers and timestamps.
    Default,
}

/// Classify a query, preferring the caller's hint.
pub fn classify_query(query: &str, hint: Option<QueryType>) -> QueryType {
    if let Some(hint) = hint {
        return hint;
    }

    let lower = query.to_lowercase();
    const LIST_MARKERS: [&str; 6] = [
        "list", "show all", "show my", "what are", "which of", "how many",
    ];
    const DETAIL_MARKERS: [&str; 5] = ["detail", "tell me about", "describe", "explain", "about the"];

    if LIST_MARKERS.iter().any(|m| lower.contains(m)) {
        QueryType::List
    } else if DETAIL_MARKERS.iter().any(|m| lower.contains(m)) {
        QueryType::Detail
    } else {
        QueryType::Default
    }
}

#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    /// Token budget applied when the caller does not supply one.
    pub default_token_budget: usize,
    /// Hard ceiling on items before recency truncation kicks in.
    pub max_items: usize,
    /// Conversation turns folded in, most recent first.
    pub max_history_turns: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            default_token_budget: 2048,
            max_items: 10,
            max_history_turns: 6,
        }
    }
}

/// Assembled context ready for the model prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPayload {
    pub text: String,
    /// True when the payload had to drop items (or history) to fit.
    pub truncated: bool,
    pub token_estimate: usize,
    pub item_count: usize,
}

impl ContextPayload {
    pub fn is_no_context(&self) -> bool {
        self.item_count == 0
    }
}

const NO_CONTEXT: &str = "No relevant items were found for this query.";

/// Metadata keys that never reach the model under `Default` projection.
const INTERNAL_KEYS: [&str; 6] = [
    "id",
    "document_id",
    "owner_id",
    "source_version",
    "created_at",
    "updated_at",
];

pub struct ContextAssembler {
    config: AssemblerConfig,
}

impl ContextAssembler {
    pub fn new(config: AssemblerConfig) -> Self {
        Self { config }
    }

    /// Shape retrieved documents + history into a budgeted context payload.
    ///
    /// Never returns a payload whose token estimate exceeds `token_budget`.
    /// When the unfiltered data would exceed it, items are truncated to the
    /// most recent N and `truncated` is set so the caller can warn the user.
    pub fn assemble(
        &self,
        documents: &[ScoredDocument],
        history: &[ChatTurn],
        query: &str,
        query_type: QueryType,
        token_budget: usize,
    ) -> ContextPayload {
        let mut items: Vec<(Value, i64)> = documents
            .iter()
            .map(|doc| (self.project(doc, query_type), recency_key(doc)))
            .collect();

        // Most recent first; retrieval rank breaks ties because the sort is
        // stable and `documents` arrives ranked.
        items.sort_by_key(|(_, recency)| std::cmp::Reverse(*recency));

        let mut truncated = items.len() > self.config.max_items;
        items.truncate(self.config.max_items);

        let mut history_turns: Vec<&ChatTurn> = history
            .iter()
            .rev()
            .take(self.config.max_history_turns)
            .collect();
        history_turns.reverse();
        if history.len() > history_turns.len() {
            truncated = true;
        }

        let mut item_count = items.len();
        let mut text = render(&items, &history_turns, query);
        let mut estimate = estimate_tokens(&text);

        // Shed load until the budget holds: items first (least recent
        // first), then history (oldest first).
        while estimate > token_budget {
            truncated = true;
            if !items.is_empty() {
                items.pop();
                item_count = items.len();
            } else if !history_turns.is_empty() {
                history_turns.remove(0);
            } else {
                text = clamp_to_budget(&text, token_budget);
                estimate = estimate_tokens(&text);
                break;
            }
            text = render(&items, &history_turns, query);
            estimate = estimate_tokens(&text);
        }

        ContextPayload {
            text,
            truncated,
            token_estimate: estimate,
            item_count,
        }
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.config
    }

    /// Project one document's payload according to the query type.
    fn project(&self, doc: &ScoredDocument, query_type: QueryType) -> Value {
        let empty = Map::new();
        let source = doc.metadata.as_object().unwrap_or(&empty);

        let mut fields = Map::new();
        match query_type {
            QueryType::List => {
                for key in minimal_fields(doc.kind) {
                    if let Some(value) = source.get(*key) {
                        fields.insert((*key).to_string(), value.clone());
                    }
                }
            }
            QueryType::Detail => {
                fields = source.clone();
                fields.insert("content".to_string(), json!(doc.content));
            }
            QueryType::Default => {
                for (key, value) in source {
                    if !INTERNAL_KEYS.contains(&key.as_str()) {
                        fields.insert(key.clone(), value.clone());
                    }
                }
                fields.insert("content".to_string(), json!(doc.content));
            }
        }

        // Minimum-field invariant: a projection may never drop the fields a
        // coherent answer requires for this kind.
        for key in required_fields(doc.kind) {
            if !fields.contains_key(*key) {
                if let Some(value) = source.get(*key) {
                    fields.insert((*key).to_string(), value.clone());
                }
            }
        }

        fields.insert("kind".to_string(), json!(doc.kind));
        Value::Object(fields)
    }
}

/// Minimal projection per kind for `List` queries.
fn minimal_fields(kind: DocumentKind) -> &'static [&'static str] {
    match kind {
        DocumentKind::Task => &["title", "status", "priority"],
        DocumentKind::Event => &["title", "start_time", "location"],
        DocumentKind::Note => &["title", "tags"],
    }
}

/// Fields that must survive every projection.
fn required_fields(kind: DocumentKind) -> &'static [&'static str] {
    match kind {
        DocumentKind::Task => &["title", "status"],
        DocumentKind::Event => &["title", "start_time"],
        DocumentKind::Note => &["title"],
    }
}

/// Recency key from payload timestamps; unix epoch seconds, 0 when absent so
/// timestamp-less documents sort behind dated ones at equal rank.
fn recency_key(doc: &ScoredDocument) -> i64 {
    for key in ["updated_at", "created_at"] {
        if let Some(value) = doc.metadata.get(key) {
            if let Some(ts) = value.as_i64() {
                return ts;
            }
            if let Some(text) = value.as_str() {
                if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(text) {
                    return parsed.timestamp();
                }
            }
        }
    }
    0
}

fn render(items: &[(Value, i64)], history: &[&ChatTurn], query: &str) -> String {
    let mut out = String::new();

    out.push_str("### Relevant items\n");
    if items.is_empty() {
        out.push_str(NO_CONTEXT);
        out.push('\n');
    } else {
        for (i, (item, _)) in items.iter().enumerate() {
            // serde_json's map is BTree-backed, so keys serialize sorted and
            // the rendering is deterministic.
            out.push_str(&format!("{}. {}\n", i + 1, item));
        }
    }

    if !history.is_empty() {
        out.push_str("\n### Conversation\n");
        for turn in history {
            let role = match turn.role {
                ChatRole::User => "User",
                ChatRole::Assistant => "Assistant",
            };
            out.push_str(&format!("{}: {}\n", role, turn.content));
        }
    }

    out.push_str("\n### Question\n");
    out.push_str(query);
    out
}

/// Rough token estimate: four characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Last-resort clamp when even the empty shell exceeds the budget.
fn clamp_to_budget(text: &str, token_budget: usize) -> String {
    let max_chars = token_budget.saturating_mul(4);
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scored(id: &str, kind: DocumentKind, metadata: Value, content: &str) -> ScoredDocument {
        ScoredDocument {
            document_id: id.to_string(),
            score: 0.9,
            kind,
            content: content.to_string(),
            metadata,
            version: 1,
        }
    }

    fn task(id: &str, title: &str, updated_at: i64) -> ScoredDocument {
        scored(
            id,
            DocumentKind::Task,
            json!({
                "title": title,
                "status": "open",
                "priority": "high",
                "owner_id": "u1",
                "document_id": id,
                "updated_at": updated_at,
            }),
            "task body text",
        )
    }

    #[test]
    fn test_classify_hint_wins() {
        assert_eq!(
            classify_query("list everything", Some(QueryType::Detail)),
            QueryType::Detail
        );
    }

    #[test]
    fn test_classify_keywords() {
        assert_eq!(classify_query("show all my tasks", None), QueryType::List);
        assert_eq!(
            classify_query("tell me about the launch event", None),
            QueryType::Detail
        );
        assert_eq!(classify_query("auth bug status", None), QueryType::Default);
    }

    #[test]
    fn test_list_projection_keeps_minimal_fields_only() {
        let assembler = ContextAssembler::new(AssemblerConfig::default());
        let payload = assembler.assemble(
            &[task("t1", "Fix auth bug", 100)],
            &[],
            "list my tasks",
            QueryType::List,
            2048,
        );

        assert!(payload.text.contains("Fix auth bug"));
        assert!(payload.text.contains("open"));
        // Internal identifiers never reach the model
        assert!(!payload.text.contains("owner_id"));
        assert!(!payload.text.contains("task body text"));
    }

    #[test]
    fn test_default_projection_strips_internal_keys_keeps_content() {
        let assembler = ContextAssembler::new(AssemblerConfig::default());
        let payload = assembler.assemble(
            &[task("t1", "Fix auth bug", 100)],
            &[],
            "auth bug status",
            QueryType::Default,
            2048,
        );

        assert!(payload.text.contains("task body text"));
        assert!(!payload.text.contains("owner_id"));
        assert!(!payload.text.contains("updated_at"));
    }

    #[test]
    fn test_minimum_fields_survive_every_projection() {
        let assembler = ContextAssembler::new(AssemblerConfig::default());
        for query_type in [QueryType::List, QueryType::Detail, QueryType::Default] {
            let payload = assembler.assemble(
                &[task("t1", "Fix auth bug", 100)],
                &[],
                "q",
                query_type,
                2048,
            );
            assert!(payload.text.contains("Fix auth bug"), "{:?}", query_type);
            assert!(payload.text.contains("open"), "{:?}", query_type);
        }
    }

    #[test]
    fn test_budget_never_exceeded_and_truncation_flagged() {
        let assembler = ContextAssembler::new(AssemblerConfig::default());
        let documents: Vec<ScoredDocument> = (0..20)
            .map(|i| task(&format!("t{}", i), &format!("Task number {}", i), i))
            .collect();

        let budget = 60;
        let payload = assembler.assemble(&documents, &[], "list my tasks", QueryType::List, budget);

        assert!(payload.token_estimate <= budget);
        assert!(payload.truncated);
    }

    #[test]
    fn test_truncation_keeps_most_recent() {
        let assembler = ContextAssembler::new(AssemblerConfig {
            max_items: 2,
            ..Default::default()
        });
        let documents = vec![
            task("t1", "Oldest", 10),
            task("t2", "Newest", 300),
            task("t3", "Middle", 200),
        ];

        let payload = assembler.assemble(&documents, &[], "q", QueryType::List, 2048);
        assert!(payload.truncated);
        assert_eq!(payload.item_count, 2);
        assert!(payload.text.contains("Newest"));
        assert!(payload.text.contains("Middle"));
        assert!(!payload.text.contains("Oldest"));
    }

    #[test]
    fn test_empty_result_returns_no_context_sentence() {
        let assembler = ContextAssembler::new(AssemblerConfig::default());
        let payload = assembler.assemble(&[], &[], "anything", QueryType::Default, 2048);

        assert!(payload.is_no_context());
        assert!(payload.text.contains(NO_CONTEXT));
        assert!(!payload.truncated);
        // No empty structural shell
        assert!(!payload.text.contains("{}"));
    }

    #[test]
    fn test_deterministic_output() {
        let assembler = ContextAssembler::new(AssemblerConfig::default());
        let documents = vec![task("t1", "A", 2), task("t2", "B", 1)];
        let history = vec![ChatTurn {
            role: ChatRole::User,
            content: "earlier question".to_string(),
        }];

        let a = assembler.assemble(&documents, &history, "q", QueryType::Default, 2048);
        let b = assembler.assemble(&documents, &history, "q", QueryType::Default, 2048);
        assert_eq!(a.text, b.text);
        assert_eq!(a.token_estimate, b.token_estimate);
    }

    #[test]
    fn test_history_bounded_most_recent_first() {
        let assembler = ContextAssembler::new(AssemblerConfig {
            max_history_turns: 2,
            ..Default::default()
        });
        let history: Vec<ChatTurn> = (0..5)
            .map(|i| ChatTurn {
                role: ChatRole::User,
                content: format!("turn {}", i),
            })
            .collect();

        let payload = assembler.assemble(&[], &history, "q", QueryType::Default, 2048);
        assert!(payload.text.contains("turn 3"));
        assert!(payload.text.contains("turn 4"));
        assert!(!payload.text.contains("turn 1"));
        assert!(payload.truncated);
    }
}
