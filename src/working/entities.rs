// src/working/entities.rs
// Deterministic rule-based entity extraction for turns.
//
// No model calls here: file-like and symbol-like tokens are pulled out with
// fixed regexes so the same text always yields the same entity set.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

/// Max entities harvested from a single turn.
const MAX_ENTITIES_PER_TURN: usize = 64;

static FILE_LIKE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        \b[\w./-]*\w
        \.(rs|py|ts|tsx|js|jsx|go|java|rb|c|h|cpp|hpp|md|toml|json|yaml|yml|sql|sh|lock|txt)\b",
    )
    .expect("file regex is static")
});

// snake_case with at least one underscore, e.g. append_turn, retry_buffer
static SNAKE_CASE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[a-z][a-z0-9]*(?:_[a-z0-9]+)+\b").expect("snake regex is static"));

// CamelCase with at least two humps, e.g. KnowledgeGraph, DatabasePool
static CAMEL_CASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Z][a-z0-9]+(?:[A-Z][a-z0-9]+)+\b").expect("camel regex is static")
});

// Call-shaped identifiers, e.g. close_conversation(), recall()
static CALL_LIKE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*(?:::[A-Za-z_][A-Za-z0-9_]*)*)\s*\(")
        .expect("call regex is static")
});

/// Extract file-like and symbol-like entities from turn text.
///
/// Returns a sorted, deduplicated list capped at `MAX_ENTITIES_PER_TURN`
/// (BTreeSet keeps the output order stable across runs).
pub fn extract_entities(text: &str) -> Vec<String> {
    let mut found = BTreeSet::new();

    for m in FILE_LIKE.find_iter(text) {
        found.insert(m.as_str().to_string());
    }
    for m in SNAKE_CASE.find_iter(text) {
        found.insert(m.as_str().to_string());
    }
    for m in CAMEL_CASE.find_iter(text) {
        found.insert(m.as_str().to_string());
    }
    for cap in CALL_LIKE.captures_iter(text) {
        if let Some(name) = cap.get(1) {
            found.insert(name.as_str().to_string());
        }
    }

    found.into_iter().take(MAX_ENTITIES_PER_TURN).collect()
}

/// Merge freshly extracted entities into an existing set, preserving
/// deterministic ordering.
pub fn merge_entities(existing: &[String], fresh: &[String]) -> Vec<String> {
    let mut set: BTreeSet<String> = existing.iter().cloned().collect();
    set.extend(fresh.iter().cloned());
    set.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_file_paths() {
        let entities = extract_entities("the bug is in src/db/pool.rs near the retry loop");
        assert!(entities.contains(&"src/db/pool.rs".to_string()));
    }

    #[test]
    fn test_extracts_snake_case_symbols() {
        let entities = extract_entities("append_turn should call close_conversation first");
        assert!(entities.contains(&"append_turn".to_string()));
        assert!(entities.contains(&"close_conversation".to_string()));
    }

    #[test]
    fn test_extracts_camel_case_types() {
        let entities = extract_entities("wrap it in a DatabasePool and hand it to KnowledgeGraph");
        assert!(entities.contains(&"DatabasePool".to_string()));
        assert!(entities.contains(&"KnowledgeGraph".to_string()));
    }

    #[test]
    fn test_extracts_call_shapes() {
        let entities = extract_entities("then invoke recall() with the query");
        assert!(entities.contains(&"recall".to_string()));
    }

    #[test]
    fn test_deterministic_and_deduplicated() {
        let a = extract_entities("fix pool.rs pool.rs append_turn append_turn");
        let b = extract_entities("fix pool.rs pool.rs append_turn append_turn");
        assert_eq!(a, b);
        assert_eq!(
            a.iter().filter(|e| e.as_str() == "append_turn").count(),
            1
        );
    }

    #[test]
    fn test_plain_prose_yields_nothing() {
        let entities = extract_entities("please make it faster somehow");
        assert!(entities.is_empty());
    }

    #[test]
    fn test_merge_unions_and_sorts() {
        let merged = merge_entities(
            &["b_sym".to_string(), "a.rs".to_string()],
            &["c_sym".to_string(), "a.rs".to_string()],
        );
        assert_eq!(merged, vec!["a.rs", "b_sym", "c_sym"]);
    }
}
