// tests/transfer.rs

use engram::{EngineConfig, EngramError, MemoryEngine, NewTurn, PatternEvidence};

async fn engine() -> MemoryEngine {
    MemoryEngine::open_in_memory(EngineConfig::default())
        .await
        .expect("in-memory engine")
}

/// Populate an engine with a little of everything.
async fn populate(engine: &MemoryEngine) -> (Vec<String>, Vec<String>) {
    let mut conversations = Vec::new();
    let c1 = engine
        .append_turn(None, NewTurn::user("how do we handle retries in pool.rs?"))
        .await
        .unwrap();
    engine
        .append_turn(Some(&c1), NewTurn::assistant("bounded backoff, then the buffer"))
        .await
        .unwrap();
    engine.close_conversation(&c1).await.unwrap();
    conversations.push(c1);
    let c2 = engine
        .append_turn(None, NewTurn::user("what about merge forwarding?"))
        .await
        .unwrap();
    conversations.push(c2);

    let mut patterns = Vec::new();
    for (signature, quality, ok) in [
        ("retry transient failures with backoff", 0.9, true),
        ("leave forwarding pointers after merges", 0.7, true),
        ("archive before any hard delete", 0.6, false),
    ] {
        patterns.push(
            engine
                .upsert_pattern(signature, "workflow", PatternEvidence::new(quality, ok))
                .await
                .unwrap(),
        );
    }
    engine
        .record_relationship(&patterns[0], &patterns[1], "co-occurs")
        .await
        .unwrap();

    (conversations, patterns)
}

#[tokio::test]
async fn test_export_import_round_trip_reproduces_counts_and_confidence() {
    let source = engine().await;
    let (_, pattern_ids) = populate(&source).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("export.json");
    let exported = source.export(&path).await.unwrap();
    assert_eq!(exported.conversations, 2);
    assert_eq!(exported.turns, 3);
    assert_eq!(exported.patterns, 3);
    assert_eq!(exported.relationships, 1);

    let target = engine().await;
    let imported = target.import(&path).await.unwrap();
    assert_eq!(imported.conversations, exported.conversations);
    assert_eq!(imported.patterns, exported.patterns);

    let source_stats = source.stats().await.unwrap();
    let target_stats = target.stats().await.unwrap();
    assert_eq!(source_stats.conversations_open, target_stats.conversations_open);
    assert_eq!(source_stats.conversations_closed, target_stats.conversations_closed);
    assert_eq!(source_stats.turns, target_stats.turns);
    assert_eq!(source_stats.patterns_live, target_stats.patterns_live);
    assert_eq!(source_stats.relationships, target_stats.relationships);

    // Confidence values survive the trip exactly (within float tolerance)
    for id in &pattern_ids {
        let original = source.get_pattern(id).await.unwrap().unwrap();
        let round_tripped = target.get_pattern(id).await.unwrap().unwrap();
        assert!(
            (original.confidence - round_tripped.confidence).abs() < 1e-9,
            "confidence drifted for {id}"
        );
        assert_eq!(original.signature, round_tripped.signature);
        assert_eq!(original.usage_count, round_tripped.usage_count);
    }
}

#[tokio::test]
async fn test_imported_store_is_searchable() {
    let source = engine().await;
    populate(&source).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("export.json");
    source.export(&path).await.unwrap();

    let target = engine().await;
    target.import(&path).await.unwrap();

    let outcome = target.search("forwarding merges", 0.0, 10).await.unwrap();
    assert!(!outcome.hits.is_empty(), "FTS index must be rebuilt on import");
    assert!(outcome.hits[0].pattern.signature.contains("forwarding"));
}

#[tokio::test]
async fn test_import_requires_empty_stores() {
    let source = engine().await;
    populate(&source).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("export.json");
    source.export(&path).await.unwrap();

    // A target with any existing data refuses the import
    let busy = engine().await;
    busy.append_turn(None, NewTurn::user("already in use")).await.unwrap();
    let err = busy.import(&path).await.unwrap_err();
    assert!(matches!(err, EngramError::Validation(_)));

    let busy_knowledge = engine().await;
    busy_knowledge
        .upsert_pattern("existing", "general", PatternEvidence::new(0.5, true))
        .await
        .unwrap();
    let err = busy_knowledge.import(&path).await.unwrap_err();
    assert!(matches!(err, EngramError::Validation(_)));
}

#[tokio::test]
async fn test_import_rejects_missing_file() {
    let target = engine().await;
    let err = target
        .import(std::path::Path::new("/nonexistent/export.json"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngramError::Io(_)));
}
