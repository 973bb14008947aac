// tests/knowledge_graph.rs

use engram::knowledge::confidence::{self, ConfidenceInputs};
use engram::{EngineConfig, EngramError, MemoryEngine, PatternEvidence};

async fn engine() -> MemoryEngine {
    MemoryEngine::open_in_memory(EngineConfig::default())
        .await
        .expect("in-memory engine")
}

#[tokio::test]
async fn test_upsert_creates_pattern_seeded_from_evidence() {
    let engine = engine().await;

    let id = engine
        .upsert_pattern(
            "run the full test suite before committing",
            "workflow",
            PatternEvidence::new(0.9, true).with_tags(vec!["testing".into()]),
        )
        .await
        .unwrap();

    let pattern = engine.get_pattern(&id).await.unwrap().expect("stored");
    assert_eq!(pattern.usage_count, 1);
    assert_eq!(pattern.success_count, 1);
    assert_eq!(pattern.category, "workflow");
    assert!(pattern.tags.contains(&"testing".to_string()));
    assert!(pattern.is_live());
}

#[tokio::test]
async fn test_upsert_folds_evidence_into_similar_signature() {
    let engine = engine().await;

    let first = engine
        .upsert_pattern(
            "retry flaky integration tests with backoff",
            "testing",
            PatternEvidence::new(0.8, true),
        )
        .await
        .unwrap();
    let second = engine
        .upsert_pattern(
            "retry flaky integration test with backoff",
            "testing",
            PatternEvidence::new(0.6, false),
        )
        .await
        .unwrap();

    assert_eq!(first, second, "near-duplicate signature folds in");
    let pattern = engine.get_pattern(&first).await.unwrap().unwrap();
    assert_eq!(pattern.usage_count, 2);
    assert_eq!(pattern.success_count, 1);
    // Running average of 0.8 and 0.6
    assert!((pattern.match_quality - 0.7).abs() < 1e-9);
}

#[tokio::test]
async fn test_upsert_same_signature_different_category_stays_separate() {
    let engine = engine().await;

    let a = engine
        .upsert_pattern("prefer explicit error types", "style", PatternEvidence::new(0.8, true))
        .await
        .unwrap();
    let b = engine
        .upsert_pattern("prefer explicit error types", "review", PatternEvidence::new(0.8, true))
        .await
        .unwrap();
    assert_ne!(a, b);
}

#[tokio::test]
async fn test_invalid_evidence_rejected_before_any_write() {
    let engine = engine().await;

    for bad in [-0.1, 1.5] {
        let err = engine
            .upsert_pattern("sig", "general", PatternEvidence::new(bad, true))
            .await
            .unwrap_err();
        assert!(matches!(err, EngramError::Validation(_)));
    }

    let err = engine
        .upsert_pattern("   ", "general", PatternEvidence::new(0.5, true))
        .await
        .unwrap_err();
    assert!(matches!(err, EngramError::Validation(_)));

    let outcome = engine.search("", 0.0, 10).await.unwrap();
    assert!(outcome.hits.is_empty(), "no partial writes on validation errors");
}

#[tokio::test]
async fn test_stored_confidence_matches_scorer_recomputation() {
    let engine = engine().await;
    let config = EngineConfig::default();

    let id = engine
        .upsert_pattern(
            "document public apis in lib.rs",
            "style",
            PatternEvidence::new(0.75, true),
        )
        .await
        .unwrap();
    engine
        .upsert_pattern(
            "document public apis in lib.rs",
            "style",
            PatternEvidence::new(0.95, false),
        )
        .await
        .unwrap();

    let pattern = engine.get_pattern(&id).await.unwrap().unwrap();
    // The row was just written, so its age at write time was 0 days.
    let recomputed = confidence::score(
        ConfidenceInputs {
            match_quality: pattern.match_quality,
            usage_count: pattern.usage_count,
            success_count: pattern.success_count,
            age_days: 0.0,
        },
        &config.scoring,
    );
    assert!(
        (pattern.confidence - recomputed).abs() < 1e-9,
        "stored {} vs recomputed {recomputed}",
        pattern.confidence
    );
}

#[tokio::test]
async fn test_search_ranks_text_matches_first() {
    let engine = engine().await;

    engine
        .upsert_pattern(
            "retry flaky integration tests with backoff",
            "testing",
            PatternEvidence::new(0.9, true),
        )
        .await
        .unwrap();
    engine
        .upsert_pattern(
            "pin transitive dependency versions",
            "build",
            PatternEvidence::new(0.9, true),
        )
        .await
        .unwrap();

    let outcome = engine.search("flaky tests", 0.0, 10).await.unwrap();
    assert!(!outcome.partial);
    assert!(!outcome.hits.is_empty());
    assert!(outcome.hits[0].pattern.signature.contains("flaky"));
    assert!(outcome.hits[0].relevance > 0.0);
}

#[tokio::test]
async fn test_search_min_confidence_filters() {
    let engine = engine().await;

    engine
        .upsert_pattern(
            "barely observed behavior",
            "general",
            PatternEvidence::new(0.1, false),
        )
        .await
        .unwrap();

    let all = engine.search("barely observed", 0.0, 10).await.unwrap();
    assert_eq!(all.hits.len(), 1);

    let strict = engine.search("barely observed", 0.9, 10).await.unwrap();
    assert!(strict.hits.is_empty());
}

#[tokio::test]
async fn test_search_is_deterministic() {
    let engine = engine().await;
    for i in 0..5 {
        engine
            .upsert_pattern(
                &format!("shared prefix variant number {i}"),
                "general",
                PatternEvidence::new(0.5, true),
            )
            .await
            .unwrap();
    }

    let first = engine.search("shared prefix", 0.0, 10).await.unwrap();
    let second = engine.search("shared prefix", 0.0, 10).await.unwrap();
    let ids_first: Vec<&str> = first.hits.iter().map(|h| h.pattern.id.as_str()).collect();
    let ids_second: Vec<&str> = second.hits.iter().map(|h| h.pattern.id.as_str()).collect();
    assert_eq!(ids_first, ids_second);
}

#[tokio::test]
async fn test_empty_query_browses_by_confidence() {
    let engine = engine().await;

    engine
        .upsert_pattern("weak signal", "general", PatternEvidence::new(0.1, false))
        .await
        .unwrap();
    engine
        .upsert_pattern("strong signal", "general", PatternEvidence::new(0.95, true))
        .await
        .unwrap();

    let outcome = engine.search("", 0.0, 10).await.unwrap();
    assert_eq!(outcome.hits.len(), 2);
    assert_eq!(outcome.hits[0].pattern.signature, "strong signal");
    assert!(outcome.hits[0].score >= outcome.hits[1].score);
}

#[tokio::test]
async fn test_search_rejects_bad_min_confidence() {
    let engine = engine().await;
    let err = engine.search("anything", 1.5, 10).await.unwrap_err();
    assert!(matches!(err, EngramError::Validation(_)));
}

#[tokio::test]
async fn test_merge_sums_counters_and_forwards_loser() {
    let engine = engine().await;

    let a = engine
        .upsert_pattern(
            "always run clippy before pushing",
            "workflow",
            PatternEvidence::new(0.9, true),
        )
        .await
        .unwrap();
    engine
        .upsert_pattern(
            "always run clippy before pushing",
            "workflow",
            PatternEvidence::new(0.9, true),
        )
        .await
        .unwrap();
    let b = engine
        .upsert_pattern(
            "format the tree with rustfmt on save",
            "workflow",
            PatternEvidence::new(0.4, false),
        )
        .await
        .unwrap();

    let usage_a = engine.get_pattern(&a).await.unwrap().unwrap().usage_count;
    let usage_b = engine.get_pattern(&b).await.unwrap().unwrap().usage_count;

    let canonical = engine.merge_patterns(&a, &b).await.unwrap();
    assert_eq!(canonical, a, "higher-confidence pattern is canonical");

    // Lookup of the losing id resolves via forwarding
    let via_loser = engine.get_pattern(&b).await.unwrap().unwrap();
    assert_eq!(via_loser.id, canonical);
    assert_eq!(via_loser.usage_count, usage_a + usage_b);

    // The loser is no longer a live search result
    let outcome = engine.search("rustfmt", 0.0, 10).await.unwrap();
    assert!(outcome.hits.iter().all(|h| h.pattern.id != b));
}

#[tokio::test]
async fn test_merge_rejects_unknown_or_identical_ids() {
    let engine = engine().await;
    let a = engine
        .upsert_pattern("some pattern", "general", PatternEvidence::new(0.5, true))
        .await
        .unwrap();

    assert!(matches!(
        engine.merge_patterns(&a, &a).await.unwrap_err(),
        EngramError::Validation(_)
    ));
    assert!(matches!(
        engine.merge_patterns(&a, "ghost").await.unwrap_err(),
        EngramError::Validation(_)
    ));
}

#[tokio::test]
async fn test_relationship_strength_is_capped() {
    let engine = engine().await;

    let a = engine
        .upsert_pattern("pattern alpha", "general", PatternEvidence::new(0.5, true))
        .await
        .unwrap();
    let b = engine
        .upsert_pattern("pattern bravo", "general", PatternEvidence::new(0.5, true))
        .await
        .unwrap();

    for _ in 0..12 {
        engine.record_relationship(&a, &b, "co-occurs").await.unwrap();
    }

    let edges = engine.knowledge().relationships().await.unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].occurrence_count, 12);
    assert!(edges[0].strength <= 10.0);
    assert!((edges[0].strength - 10.0).abs() < 1e-9, "strength saturates at the cap");
}

#[tokio::test]
async fn test_relationship_requires_resolvable_endpoints() {
    let engine = engine().await;
    let a = engine
        .upsert_pattern("pattern alpha", "general", PatternEvidence::new(0.5, true))
        .await
        .unwrap();

    let err = engine
        .record_relationship(&a, "missing", "related")
        .await
        .unwrap_err();
    assert!(matches!(err, EngramError::Validation(_)));
}

#[tokio::test]
async fn test_merge_rewrites_relationship_edges_to_canonical() {
    let engine = engine().await;

    let a = engine
        .upsert_pattern("cache expensive lookups", "perf", PatternEvidence::new(0.9, true))
        .await
        .unwrap();
    let b = engine
        .upsert_pattern("memoize repeated queries", "perf", PatternEvidence::new(0.4, true))
        .await
        .unwrap();
    let c = engine
        .upsert_pattern("profile before optimizing", "perf", PatternEvidence::new(0.7, true))
        .await
        .unwrap();

    engine.record_relationship(&b, &c, "related").await.unwrap();

    let canonical = engine.merge_patterns(&a, &b).await.unwrap();
    assert_eq!(canonical, a);

    let edges = engine.knowledge().relationships().await.unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].from_id, a, "edge endpoint rewritten to canonical");
    assert_eq!(edges[0].to_id, c);

    // An edge recorded against the old id lands on the canonical pattern
    engine.record_relationship(&b, &c, "related").await.unwrap();
    let edges = engine.knowledge().relationships().await.unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].occurrence_count, 2);
}
