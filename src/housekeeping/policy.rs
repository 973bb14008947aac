// src/housekeeping/policy.rs
// Analyzing phase: classify every record into keep / archive / delete /
// merge per tier policy. Read-only: mutations happen in the Executing
// phase against this plan.

use super::preview::{ActionKind, PlannedAction, StoreTier};
use crate::config::{EngineConfig, HousekeepingConfig};
use crate::db::{age_days, log_and_discard};
use crate::knowledge::confidence::{self, ConfidenceInputs};
use crate::knowledge::similarity::signature_similarity;
use crate::knowledge::store as knowledge_store;
use crate::knowledge::types::Pattern;
use chrono::NaiveDateTime;
use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet};

/// Per-category cap on patterns considered for pairwise merge scanning.
/// Categories larger than this are truncated (most recently used first) and
/// the preview says so.
const MERGE_SCAN_CAP: usize = 200;

/// Fixed per-row overhead assumed when estimating reclaimable bytes.
const ROW_OVERHEAD_BYTES: i64 = 64;

/// Classify working-store records.
///
/// Over-capacity conversations (oldest closed first) become archive
/// candidates; archived conversations past the retention window become
/// delete candidates.
pub fn analyze_working_sync(
    conn: &Connection,
    capacity: usize,
    retention_days: u32,
    now_naive: NaiveDateTime,
) -> rusqlite::Result<Vec<PlannedAction>> {
    let mut actions = Vec::new();

    let active: i64 = conn.query_row(
        "SELECT COUNT(*) FROM conversations WHERE status IN ('open', 'closed')",
        [],
        |row| row.get(0),
    )?;
    let over = (active - capacity as i64).max(0);

    if over > 0 {
        let mut stmt = conn.prepare(
            "SELECT id FROM conversations WHERE status = 'closed'
             ORDER BY created_at ASC, id ASC LIMIT ?1",
        )?;
        let ids: Vec<String> = stmt
            .query_map([over], |row| row.get(0))?
            .filter_map(log_and_discard)
            .collect();
        for id in ids {
            actions.push(PlannedAction {
                tier: StoreTier::WorkingMemory,
                kind: ActionKind::Archive,
                record_id: id,
                merge_into: None,
                rationale: format!(
                    "working memory holds {active} conversations, capacity is {capacity}; oldest closed goes first"
                ),
                reclaim_bytes: 0,
            });
        }
    }

    let mut stmt = conn.prepare(
        "SELECT c.id, c.archived_at,
                (SELECT COALESCE(SUM(LENGTH(t.content)), 0) FROM turns t
                  WHERE t.conversation_id = c.id) AS content_bytes
         FROM conversations c
         WHERE c.status = 'archived' AND c.archived_at IS NOT NULL
         ORDER BY c.archived_at ASC, c.id ASC",
    )?;
    let archived: Vec<(String, String, i64)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .filter_map(log_and_discard)
        .collect();

    for (id, archived_at, content_bytes) in archived {
        let age = age_days(&archived_at, now_naive);
        if age > retention_days as f64 {
            actions.push(PlannedAction {
                tier: StoreTier::WorkingMemory,
                kind: ActionKind::Delete,
                record_id: id,
                merge_into: None,
                rationale: format!(
                    "archived {age:.0} days ago, retention window is {retention_days} days"
                ),
                reclaim_bytes: content_bytes + ROW_OVERHEAD_BYTES,
            });
        }
    }

    Ok(actions)
}

/// Classify knowledge-store records. Returns the plan plus whether the
/// merge scan was truncated by its cap.
pub fn analyze_knowledge_sync(
    conn: &Connection,
    config: &EngineConfig,
    now_naive: NaiveDateTime,
) -> rusqlite::Result<(Vec<PlannedAction>, bool)> {
    let mut actions = Vec::new();
    let hk = &config.housekeeping;

    let live = knowledge_store::list_live_patterns_sync(conn)?;

    // Stage-one delete candidates: live, decayed below the floor, unused
    // past the staleness window. Executing archives them; the purge comes a
    // grace period later (or immediately under --force).
    let mut delete_set: BTreeSet<String> = BTreeSet::new();
    for pattern in &live {
        let age = age_days(&pattern.last_used_at, now_naive);
        let effective = confidence::score(
            ConfidenceInputs {
                match_quality: pattern.match_quality,
                usage_count: pattern.usage_count,
                success_count: pattern.success_count,
                age_days: age,
            },
            &config.scoring,
        );
        if effective < hk.confidence_floor && age > hk.stale_after_days as f64 {
            delete_set.insert(pattern.id.clone());
            actions.push(PlannedAction {
                tier: StoreTier::KnowledgeGraph,
                kind: ActionKind::Delete,
                record_id: pattern.id.clone(),
                merge_into: None,
                rationale: format!(
                    "confidence {effective:.2} below floor {:.2}, unused for {age:.0} days (window {} days); archive now, purge after {} day grace",
                    hk.confidence_floor, hk.stale_after_days, hk.grace_days
                ),
                reclaim_bytes: estimate_pattern_bytes(pattern),
            });
        }
    }

    // Stage-two delete candidates: archived past the grace period.
    // Forwarding tombstones are kept; they are what stops old ids from
    // dangling.
    let mut stmt = conn.prepare(
        "SELECT id, signature, archived_at FROM patterns
         WHERE archived_at IS NOT NULL AND forwarding_id IS NULL
         ORDER BY archived_at ASC, id ASC",
    )?;
    let archived: Vec<(String, String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .filter_map(log_and_discard)
        .collect();
    for (id, signature, archived_at) in archived {
        let age = age_days(&archived_at, now_naive);
        if age > hk.grace_days as f64 {
            delete_set.insert(id.clone());
            actions.push(PlannedAction {
                tier: StoreTier::KnowledgeGraph,
                kind: ActionKind::Delete,
                record_id: id,
                merge_into: None,
                rationale: format!(
                    "archived {age:.0} days ago, grace period of {} days has elapsed; purge",
                    hk.grace_days
                ),
                reclaim_bytes: signature.len() as i64 + ROW_OVERHEAD_BYTES,
            });
        }
    }

    // Merge candidates: near-duplicate live signatures within a category.
    let truncated = collect_merge_candidates(
        &live,
        &delete_set,
        config.knowledge.merge_similarity,
        &mut actions,
    );

    Ok((actions, truncated))
}

/// Pairwise near-duplicate scan, greedy so each pattern joins at most one
/// merge pair. Returns true when any category exceeded the scan cap.
fn collect_merge_candidates(
    live: &[Pattern],
    delete_set: &BTreeSet<String>,
    merge_similarity: f64,
    actions: &mut Vec<PlannedAction>,
) -> bool {
    let mut by_category: BTreeMap<&str, Vec<&Pattern>> = BTreeMap::new();
    for pattern in live {
        if !delete_set.contains(&pattern.id) {
            by_category
                .entry(pattern.category.as_str())
                .or_default()
                .push(pattern);
        }
    }

    let mut truncated = false;
    let mut claimed: BTreeSet<&str> = BTreeSet::new();

    for (_, mut patterns) in by_category {
        // Most recently used first, stable within the timestamp
        patterns.sort_by(|a, b| {
            b.last_used_at
                .cmp(&a.last_used_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        if patterns.len() > MERGE_SCAN_CAP {
            truncated = true;
            patterns.truncate(MERGE_SCAN_CAP);
        }

        for i in 0..patterns.len() {
            if claimed.contains(patterns[i].id.as_str()) {
                continue;
            }
            for j in (i + 1)..patterns.len() {
                if claimed.contains(patterns[j].id.as_str()) {
                    continue;
                }
                let similarity =
                    signature_similarity(&patterns[i].signature, &patterns[j].signature);
                if similarity >= merge_similarity {
                    // Higher confidence survives; ties fall back to the
                    // deterministic precedence chain.
                    let (winner, loser) = if patterns[j].confidence > patterns[i].confidence {
                        (patterns[j], patterns[i])
                    } else if patterns[i].confidence > patterns[j].confidence {
                        (patterns[i], patterns[j])
                    } else {
                        match knowledge_store::pattern_precedence(patterns[i], patterns[j]) {
                            std::cmp::Ordering::Greater => (patterns[j], patterns[i]),
                            _ => (patterns[i], patterns[j]),
                        }
                    };
                    claimed.insert(winner.id.as_str());
                    claimed.insert(loser.id.as_str());
                    actions.push(PlannedAction {
                        tier: StoreTier::KnowledgeGraph,
                        kind: ActionKind::Merge,
                        record_id: loser.id.clone(),
                        merge_into: Some(winner.id.clone()),
                        rationale: format!(
                            "signature similarity {similarity:.2} meets the {merge_similarity:.2} merge threshold"
                        ),
                        reclaim_bytes: estimate_pattern_bytes(loser),
                    });
                    break;
                }
            }
        }
    }
    truncated
}

fn estimate_pattern_bytes(pattern: &Pattern) -> i64 {
    let tag_bytes: usize = pattern.tags.iter().map(String::len).sum();
    (pattern.signature.len() + tag_bytes) as i64 + ROW_OVERHEAD_BYTES
}

/// Threshold trigger input: live pattern count against the configured cap.
pub fn over_pattern_threshold_sync(
    conn: &Connection,
    config: &HousekeepingConfig,
) -> rusqlite::Result<bool> {
    let live = knowledge_store::live_pattern_count_sync(conn)?;
    Ok(live >= config.trigger_pattern_count)
}
