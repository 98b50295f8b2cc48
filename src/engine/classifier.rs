// Intent classification
// Keyword and priority matching over a registry snapshot

//! # Intent Classifier
//!
//! Picks zero or one [`Intent`] for a request:
//!
//! 1. An active intent with a positive priority matches when at least one of
//!    its keywords matches the request text. Matching is case-insensitive and word-based; a multi-word
//!    keyword matches when every one of its words occurs in the request.
//! 2. Matches whose `context_needs` are not all present (non-null, dotted paths
//!    allowed) in the request context are dropped.
//! 3. The highest priority wins. Equal priorities go to the intent created first.
//!
//! Classification is a pure function of `(snapshot, text, context)`; calling it
//! twice with the same inputs always picks the same intent.

use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::debug;

use super::context;
use super::registry::RegistrySnapshot;
use crate::models::Intent;

#[derive(Debug, Clone, Copy, Default)]
pub struct IntentClassifier;

impl IntentClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify<'a>(
        &self,
        snapshot: &'a RegistrySnapshot,
        text: &str,
        context: &Map<String, Value>,
    ) -> Option<&'a Intent> {
        let words = tokenize(text);
        let mut best: Option<&Intent> = None;

        for intent in snapshot
            .intents()
            .iter()
            .filter(|intent| intent.active && intent.priority > 0)
        {
            if !intent.keywords.iter().any(|keyword| keyword_matches(keyword, &words)) {
                continue;
            }
            if !context::all_present(context, &intent.context_needs) {
                debug!(intent = %intent.key, "Intent matched but context needs are missing");
                continue;
            }
            // Strictly greater keeps the earliest-created intent on ties
            if best.map_or(true, |current| intent.priority > current.priority) {
                best = Some(intent);
            }
        }

        debug!(
            intent = best.map(|intent| intent.key.as_str()).unwrap_or("<none>"),
            "Classified request"
        );
        best
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|word| !word.is_empty())
        .map(|word| word.to_lowercase())
        .collect()
}

fn keyword_matches(keyword: &str, words: &HashSet<String>) -> bool {
    let required = tokenize(keyword);
    !required.is_empty() && required.iter().all(|word| words.contains(word))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::registry::RegistryDocument;
    use serde_json::json;

    fn snapshot(intents: Vec<Intent>) -> RegistrySnapshot {
        RegistrySnapshot::build(
            RegistryDocument {
                intents,
                ..Default::default()
            },
            1,
        )
        .unwrap()
    }

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_multi_word_keyword_needs_every_word() {
        let snapshot = snapshot(vec![Intent::new("deploy", 1).with_keywords(["ship release"])]);
        let classifier = IntentClassifier::new();

        assert!(classifier
            .classify(&snapshot, "Please SHIP the new release", &Map::new())
            .is_some());
        assert!(classifier
            .classify(&snapshot, "ship it", &Map::new())
            .is_none());
    }

    #[test]
    fn test_priority_then_creation_order() {
        let snapshot = snapshot(vec![
            Intent::new("first", 3).with_keywords(["report"]),
            Intent::new("second", 3).with_keywords(["report"]),
            Intent::new("low", 1).with_keywords(["report"]),
        ]);

        let chosen = IntentClassifier::new()
            .classify(&snapshot, "weekly report", &Map::new())
            .unwrap();
        assert_eq!(chosen.key, "first");
    }

    #[test]
    fn test_context_needs_filter_matches() {
        let snapshot = snapshot(vec![
            Intent::new("workspace_summary", 9)
                .with_keywords(["summary"])
                .needing("workspace.id"),
            Intent::new("summary", 1).with_keywords(["summary"]),
        ]);
        let classifier = IntentClassifier::new();

        let without = classifier.classify(&snapshot, "summary please", &Map::new());
        assert_eq!(without.unwrap().key, "summary");

        let context = object(json!({ "workspace": { "id": "w1" } }));
        let with = classifier.classify(&snapshot, "summary please", &context);
        assert_eq!(with.unwrap().key, "workspace_summary");
    }

    #[test]
    fn test_inactive_intents_are_ignored() {
        let mut intent = Intent::new("archive", 5).with_keywords(["archive"]);
        intent.active = false;
        let snapshot = snapshot(vec![intent]);

        assert!(IntentClassifier::new()
            .classify(&snapshot, "archive this", &Map::new())
            .is_none());
    }

    #[test]
    fn test_non_positive_priority_never_wins() {
        let snapshot = snapshot(vec![
            Intent::new("muted", 0).with_keywords(["status"]),
            Intent::new("negative", -4).with_keywords(["status"]),
        ]);

        assert!(IntentClassifier::new()
            .classify(&snapshot, "project status", &Map::new())
            .is_none());
    }

    #[test]
    fn test_classification_is_idempotent() {
        let snapshot = snapshot(vec![
            Intent::new("a", 2).with_keywords(["alpha"]),
            Intent::new("b", 2).with_keywords(["beta"]),
        ]);
        let classifier = IntentClassifier::new();
        let context = object(json!({ "x": 1 }));

        let first = classifier.classify(&snapshot, "alpha beta", &context).map(|i| i.key.clone());
        let second = classifier.classify(&snapshot, "alpha beta", &context).map(|i| i.key.clone());
        assert_eq!(first, second);
        assert_eq!(first.as_deref(), Some("a"));
    }
}
