// src/housekeeping/execute.rs
// Executing and Verifying phases: apply a plan inside one transaction per
// store, then re-read post-state and check invariants.

use super::preview::{ActionKind, PlannedAction, StoreTier};
use crate::config::ScoringConfig;
use crate::db::log_and_discard;
use crate::knowledge::store as knowledge_store;
use crate::working::store as working_store;
use chrono::NaiveDateTime;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, warn};

/// What one store's execution actually did.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutedCounts {
    pub conversations_archived: i64,
    pub conversations_deleted: i64,
    pub patterns_archived: i64,
    pub patterns_deleted: i64,
    pub patterns_merged: i64,
}

/// Evidence for the archive-before-delete invariant, collected while
/// deleting so Verifying can check ordering that post-state alone cannot
/// show.
#[derive(Debug, Clone)]
pub struct DeleteTrace {
    pub record_id: String,
    pub had_prior_archive: bool,
}

/// Apply the working-store slice of the plan in one transaction.
pub fn execute_working_sync(
    conn: &Connection,
    actions: &[PlannedAction],
    now: &str,
) -> rusqlite::Result<(ExecutedCounts, Vec<DeleteTrace>)> {
    let tx = conn.unchecked_transaction()?;
    let mut counts = ExecutedCounts::default();
    let mut traces = Vec::new();

    for action in actions.iter().filter(|a| a.tier == StoreTier::WorkingMemory) {
        match action.kind {
            ActionKind::Archive => {
                working_store::archive_conversation_sync(&tx, &action.record_id, now)?;
                counts.conversations_archived += 1;
            }
            ActionKind::Delete => {
                let archived_at: Option<Option<String>> = tx
                    .query_row(
                        "SELECT archived_at FROM conversations WHERE id = ?1",
                        [action.record_id.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(archived_at) = archived_at else {
                    debug!("Conversation {} already gone, skipping", action.record_id);
                    continue;
                };
                traces.push(DeleteTrace {
                    record_id: action.record_id.clone(),
                    had_prior_archive: archived_at.is_some(),
                });
                if working_store::delete_conversation_sync(&tx, &action.record_id)? {
                    counts.conversations_deleted += 1;
                }
            }
            ActionKind::Merge => {
                warn!("Merge action is not defined for working memory, skipping");
            }
        }
    }

    tx.commit()?;
    Ok((counts, traces))
}

/// Apply the knowledge-store slice of the plan in one transaction:
/// merges first, then archivals/deletes, then a rescore of the surviving
/// live patterns so stored confidence tracks the scorer.
///
/// A first-stage delete candidate (still live) is archived here; its hard
/// delete waits for the grace period unless `force` collapses the stages.
#[allow(clippy::too_many_arguments)]
pub fn execute_knowledge_sync(
    conn: &Connection,
    actions: &[PlannedAction],
    scoring: &ScoringConfig,
    strength_cap: f64,
    force: bool,
    now: &str,
    now_naive: NaiveDateTime,
) -> rusqlite::Result<(ExecutedCounts, Vec<DeleteTrace>)> {
    let tx = conn.unchecked_transaction()?;
    let mut counts = ExecutedCounts::default();
    let mut traces = Vec::new();

    for action in actions
        .iter()
        .filter(|a| a.tier == StoreTier::KnowledgeGraph && a.kind == ActionKind::Merge)
    {
        let Some(into) = &action.merge_into else {
            warn!("Merge action without target for {}, skipping", action.record_id);
            continue;
        };
        match knowledge_store::merge_patterns_sync(
            &tx,
            &action.record_id,
            into,
            scoring,
            strength_cap,
            now,
            now_naive,
        )? {
            knowledge_store::MergeOutcome::Merged { .. } => counts.patterns_merged += 1,
            knowledge_store::MergeOutcome::Rejected(reason) => {
                debug!(
                    "Planned merge of {} skipped: {reason}",
                    action.record_id
                );
            }
        }
    }

    for action in actions
        .iter()
        .filter(|a| a.tier == StoreTier::KnowledgeGraph && a.kind == ActionKind::Delete)
    {
        let Some(pattern) = knowledge_store::get_pattern_sync(&tx, &action.record_id)? else {
            debug!("Pattern {} already gone, skipping", action.record_id);
            continue;
        };

        if pattern.archived_at.is_none() {
            // Stage one: archival is this run's destructive step.
            knowledge_store::archive_pattern_sync(&tx, &pattern.id, now)?;
            counts.patterns_archived += 1;
            if force {
                traces.push(DeleteTrace {
                    record_id: pattern.id.clone(),
                    had_prior_archive: true,
                });
                if knowledge_store::delete_pattern_sync(&tx, &pattern.id)? {
                    counts.patterns_deleted += 1;
                }
            }
        } else {
            // Stage two: the grace period elapsed before this run.
            traces.push(DeleteTrace {
                record_id: pattern.id.clone(),
                had_prior_archive: true,
            });
            if knowledge_store::delete_pattern_sync(&tx, &pattern.id)? {
                counts.patterns_deleted += 1;
            }
        }
    }

    let rescored = knowledge_store::rescore_live_patterns_sync(&tx, scoring, now_naive)?;
    if rescored > 0 {
        debug!("Rescored {rescored} live pattern(s)");
    }

    tx.commit()?;
    Ok((counts, traces))
}

/// Working-store invariants after execution.
pub fn verify_working_sync(
    conn: &Connection,
    capacity: usize,
    traces: &[DeleteTrace],
) -> rusqlite::Result<Vec<String>> {
    let mut violations = Vec::new();

    let (open, closed, _, _) = working_store::working_counts_sync(conn)?;
    if open + closed > capacity as i64 {
        violations.push(format!(
            "working memory holds {} conversations after flush, capacity is {capacity}",
            open + closed
        ));
    }
    if open > 1 {
        violations.push(format!("{open} conversations are open; at most one may be"));
    }

    for trace in traces {
        if !trace.had_prior_archive {
            violations.push(format!(
                "conversation {} was deleted without prior archival",
                trace.record_id
            ));
        }
        let still_there: Option<String> = conn
            .query_row(
                "SELECT id FROM conversations WHERE id = ?1",
                [trace.record_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if still_there.is_some() {
            violations.push(format!(
                "conversation {} survived its planned delete",
                trace.record_id
            ));
        }
    }

    Ok(violations)
}

/// Knowledge-store invariants after execution.
pub fn verify_knowledge_sync(
    conn: &Connection,
    strength_cap: f64,
    traces: &[DeleteTrace],
    force: bool,
) -> rusqlite::Result<Vec<String>> {
    let mut violations = Vec::new();

    let mut stmt = conn.prepare(
        "SELECT id FROM patterns
         WHERE forwarding_id IS NOT NULL
           AND forwarding_id NOT IN (SELECT id FROM patterns)",
    )?;
    let dangling_forwards: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .filter_map(log_and_discard)
        .collect();
    for id in dangling_forwards {
        violations.push(format!("pattern {id} has a dangling forwarding id"));
    }

    let mut stmt = conn.prepare(
        "SELECT id FROM relationships
         WHERE from_id NOT IN (SELECT id FROM patterns)
            OR to_id NOT IN (SELECT id FROM patterns)",
    )?;
    let dangling_edges: Vec<i64> = stmt
        .query_map([], |row| row.get(0))?
        .filter_map(log_and_discard)
        .collect();
    for id in dangling_edges {
        violations.push(format!("relationship {id} references a missing pattern"));
    }

    let bad_confidence: i64 = conn.query_row(
        "SELECT COUNT(*) FROM patterns WHERE confidence < 0.0 OR confidence > 1.0",
        [],
        |row| row.get(0),
    )?;
    if bad_confidence > 0 {
        violations.push(format!(
            "{bad_confidence} pattern(s) have confidence outside [0, 1]"
        ));
    }

    let over_strength: i64 = conn.query_row(
        "SELECT COUNT(*) FROM relationships WHERE strength > ?1",
        [strength_cap],
        |row| row.get(0),
    )?;
    if over_strength > 0 {
        violations.push(format!(
            "{over_strength} relationship(s) exceed the strength cap of {strength_cap}"
        ));
    }

    for trace in traces {
        if !trace.had_prior_archive && !force {
            violations.push(format!(
                "pattern {} was deleted without prior archival",
                trace.record_id
            ));
        }
        if knowledge_store::get_pattern_sync(conn, &trace.record_id)?.is_some() {
            violations.push(format!(
                "pattern {} survived its planned delete",
                trace.record_id
            ));
        }
    }

    Ok(violations)
}
