// tests/housekeeping.rs

use engram::housekeeping::RunStatus;
use engram::{EngineConfig, EngineStats, MemoryEngine, NewTurn, PatternEvidence};

async fn engine() -> MemoryEngine {
    MemoryEngine::open_in_memory(EngineConfig::default())
        .await
        .expect("in-memory engine")
}

/// Seed `n` weak patterns and backdate their last use far past the
/// staleness window.
async fn seed_stale_patterns(engine: &MemoryEngine, n: usize) -> Vec<String> {
    let signatures = [
        "obscure workaround for legacy toolchains",
        "special casing inside packaging scripts",
        "manual cache invalidation ritual",
        "rare fallback when proxies misbehave",
        "one off migration shim from old configs",
        "seldom used debug tracing recipe",
    ];
    let mut ids = Vec::new();
    for signature in signatures.iter().take(n) {
        let id = engine
            .upsert_pattern(signature, "general", PatternEvidence::new(0.1, false))
            .await
            .unwrap();
        ids.push(id);
    }
    // 120 days without use, well past the 90 day window
    engine
        .knowledge()
        .pool()
        .interact_raw(|conn| {
            conn.execute(
                "UPDATE patterns
                 SET last_used_at = strftime('%Y-%m-%d %H:%M:%S', 'now', '-120 days')",
                [],
            )
        })
        .await
        .unwrap();
    ids
}

async fn live_pattern_count(engine: &MemoryEngine) -> i64 {
    engine.stats().await.map(|s: EngineStats| s.patterns_live).unwrap()
}

#[tokio::test]
async fn test_dry_run_reports_five_delete_candidates_and_deletes_nothing() {
    let engine = engine().await;
    seed_stale_patterns(&engine, 5).await;

    let report = engine.run_housekeeping(true, false).await.unwrap();

    assert_eq!(report.status, RunStatus::DryRun);
    assert_eq!(report.preview.pattern_delete_candidates(), 5);
    assert_eq!(report.patterns_deleted, 0);
    assert_eq!(report.patterns_archived, 0);
    assert_eq!(live_pattern_count(&engine).await, 5, "store unchanged by dry run");

    let rendered = report.render();
    assert!(rendered.contains("Dry run"));
    assert!(rendered.contains("below floor"));
}

#[tokio::test]
async fn test_stale_patterns_are_archived_then_purged_after_grace() {
    let engine = engine().await;
    seed_stale_patterns(&engine, 3).await;

    // Stage one: archive
    let report = engine.run_housekeeping(false, false).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.patterns_archived, 3);
    assert_eq!(report.patterns_deleted, 0, "grace period defers the purge");
    assert_eq!(live_pattern_count(&engine).await, 0);

    // No intervening activity: the next preview is empty (idempotence)
    let second = engine.run_housekeeping(true, false).await.unwrap();
    assert!(second.preview.is_empty(), "second preview must be empty: {:?}", second.preview.actions);

    // Let the grace period elapse, then stage two purges
    engine
        .knowledge()
        .pool()
        .interact_raw(|conn| {
            conn.execute(
                "UPDATE patterns
                 SET archived_at = strftime('%Y-%m-%d %H:%M:%S', 'now', '-30 days')
                 WHERE archived_at IS NOT NULL",
                [],
            )
        })
        .await
        .unwrap();

    let purge = engine.run_housekeeping(false, false).await.unwrap();
    assert_eq!(purge.status, RunStatus::Completed);
    assert_eq!(purge.patterns_deleted, 3);

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.patterns_live + stats.patterns_archived, 0);
}

#[tokio::test]
async fn test_force_collapses_archive_and_purge_into_one_run() {
    let engine = engine().await;
    seed_stale_patterns(&engine, 4).await;

    let report = engine.run_housekeeping(false, true).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.patterns_archived, 4);
    assert_eq!(report.patterns_deleted, 4);

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.patterns_live, 0);
    assert_eq!(stats.patterns_archived, 0);
}

#[tokio::test]
async fn test_near_duplicate_live_patterns_get_merged() {
    let engine = engine().await;

    // Insert two near-duplicates directly so the upsert fold-in cannot
    // collapse them first.
    engine
        .knowledge()
        .pool()
        .interact_raw(|conn| {
            conn.execute_batch(
                "INSERT INTO patterns (id, signature, category, confidence, usage_count, success_count)
                     VALUES ('dup-a', 'retry flaky integration tests with backoff', 'testing', 0.8, 6, 5);
                 INSERT INTO patterns (id, signature, category, confidence, usage_count, success_count)
                     VALUES ('dup-b', 'retry flaky integration test with backoff', 'testing', 0.5, 2, 1);",
            )
        })
        .await
        .unwrap();

    let preview = engine.run_housekeeping(true, false).await.unwrap();
    assert_eq!(preview.preview.pattern_merge_candidates(), 1);

    let report = engine.run_housekeeping(false, false).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.patterns_merged, 1);

    // Loser forwards to the higher-confidence winner with summed counters
    let resolved = engine.get_pattern("dup-b").await.unwrap().unwrap();
    assert_eq!(resolved.id, "dup-a");
    assert_eq!(resolved.usage_count, 8);
    assert_eq!(resolved.success_count, 6);
}

#[tokio::test]
async fn test_working_memory_retention_deletes_only_after_archival() {
    let mut config = EngineConfig::default();
    config.working.capacity = 2;
    let engine = MemoryEngine::open_in_memory(config).await.unwrap();

    // Three closed conversations: the oldest gets archived by eviction
    for i in 0..3 {
        let id = engine
            .append_turn(None, NewTurn::user(format!("conversation {i}")))
            .await
            .unwrap();
        engine.close_conversation(&id).await.unwrap();
    }
    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.conversations_archived, 1);

    // Fresh archive: retention has not elapsed, delete must not trigger
    let report = engine.run_housekeeping(false, false).await.unwrap();
    assert_eq!(report.conversations_deleted, 0);

    // Age the tombstone past retention
    engine
        .working()
        .pool()
        .interact_raw(|conn| {
            conn.execute(
                "UPDATE conversations
                 SET archived_at = strftime('%Y-%m-%d %H:%M:%S', 'now', '-60 days')
                 WHERE status = 'archived'",
                [],
            )
        })
        .await
        .unwrap();

    let report = engine.run_housekeeping(false, false).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.conversations_deleted, 1);

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.conversations_archived, 0);
    assert_eq!(stats.conversations_open + stats.conversations_closed, 2);
}

#[tokio::test]
async fn test_verification_failure_rolls_both_stores_back() {
    let engine = engine().await;
    let stale_ids = seed_stale_patterns(&engine, 2).await;

    // Plant a corrupt archived row the Executing phase will not touch:
    // confidence outside [0, 1] trips Verifying.
    engine
        .knowledge()
        .pool()
        .interact_raw(|conn| {
            conn.execute(
                "INSERT INTO patterns (id, signature, category, confidence, archived_at)
                 VALUES ('corrupt', 'poisoned row', 'general', 1.5,
                         strftime('%Y-%m-%d %H:%M:%S', 'now'))",
                [],
            )
        })
        .await
        .unwrap();

    let report = engine.run_housekeeping(false, false).await.unwrap();
    assert_eq!(report.status, RunStatus::RolledBack);
    assert!(!report.verification_errors.is_empty());
    assert!(report
        .verification_errors
        .iter()
        .any(|v| v.contains("confidence")));

    let rendered = report.render();
    assert!(rendered.contains("restored from the pre-run snapshot"));

    // Rollback restored the stale patterns to their pre-run (live) state
    for id in &stale_ids {
        let pattern = engine.get_pattern(id).await.unwrap().unwrap();
        assert!(pattern.archived_at.is_none(), "archive was rolled back");
    }
    assert_eq!(live_pattern_count(&engine).await, 2);
}

#[tokio::test]
async fn test_runs_are_recorded() {
    let engine = engine().await;
    seed_stale_patterns(&engine, 1).await;

    engine.run_housekeeping(true, false).await.unwrap();
    let stats = engine.stats().await.unwrap();
    let last = stats.last_run.expect("dry run recorded");
    assert!(last.dry_run);
    assert_eq!(last.status, "dry_run");

    engine.run_housekeeping(false, false).await.unwrap();
    let stats = engine.stats().await.unwrap();
    let last = stats.last_run.expect("real run recorded");
    assert!(!last.dry_run);
    assert_eq!(last.status, "completed");
}

#[tokio::test]
async fn test_empty_stores_yield_empty_preview() {
    let engine = engine().await;
    let report = engine.run_housekeeping(true, false).await.unwrap();
    assert!(report.preview.is_empty());
    assert!(report.render().contains("Nothing to do"));
}
