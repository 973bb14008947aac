// src/knowledge/store.rs
// Sync SQL operations for the knowledge store (run inside pool.interact()).
//
// Functions that mutate multiple rows (merge, delete) do NOT open their own
// transaction; callers wrap them so housekeeping can batch a whole run into
// one all-or-nothing transaction per store.

use super::confidence::{self, ConfidenceInputs};
use super::similarity::signature_similarity;
use super::types::{Pattern, PatternEvidence, Relationship};
use crate::config::ScoringConfig;
use crate::db::{age_days, log_and_discard};
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Max forwarding hops followed before a chain counts as corrupt.
const MAX_FORWARD_HOPS: usize = 8;

/// Outcome of a merge attempt, decided against live data.
#[derive(Debug)]
pub enum MergeOutcome {
    Merged { canonical: String, forwarded: String },
    Rejected(String),
}

/// Outcome of recording a relationship edge.
#[derive(Debug)]
pub enum EdgeOutcome {
    Recorded,
    Rejected(String),
}

pub fn parse_pattern_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Pattern> {
    let tags_json: Option<String> = row.get("tags")?;
    let sources_json: Option<String> = row.get("source_conversations")?;
    Ok(Pattern {
        id: row.get("id")?,
        signature: row.get("signature")?,
        category: row.get("category")?,
        confidence: row.get("confidence")?,
        match_quality: row.get("match_quality")?,
        usage_count: row.get("usage_count")?,
        success_count: row.get("success_count")?,
        tags: tags_json
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default(),
        source_conversations: sources_json
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default(),
        forwarding_id: row.get("forwarding_id")?,
        archived_at: row.get("archived_at")?,
        last_used_at: row.get("last_used_at")?,
        created_at: row.get("created_at")?,
    })
}

const PATTERN_COLUMNS: &str = "id, signature, category, confidence, match_quality, usage_count, \
     success_count, tags, source_conversations, forwarding_id, archived_at, last_used_at, created_at";

// FTS joins need qualified names: patterns_fts exposes signature/category/tags
// too, and unqualified references would be ambiguous.
const PATTERN_COLUMNS_QUALIFIED: &str = "patterns.id, patterns.signature, patterns.category, \
     patterns.confidence, patterns.match_quality, patterns.usage_count, patterns.success_count, \
     patterns.tags, patterns.source_conversations, patterns.forwarding_id, patterns.archived_at, \
     patterns.last_used_at, patterns.created_at";

/// Deterministic precedence used for ranking tie-breaks and merge winner
/// selection: higher usage_count, then more recent last_used_at, then
/// lexicographic id.
pub fn pattern_precedence(a: &Pattern, b: &Pattern) -> Ordering {
    b.usage_count
        .cmp(&a.usage_count)
        .then_with(|| b.last_used_at.cmp(&a.last_used_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Build an OR-of-quoted-tokens FTS5 query from free text.
/// Returns None when the text has no usable tokens (browse mode).
pub fn fts_query_from_text(text: &str) -> Option<String> {
    let tokens: BTreeSet<String> = text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| format!("\"{t}\""))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(
            tokens
                .into_iter()
                .take(16)
                .collect::<Vec<_>>()
                .join(" OR "),
        )
    }
}

pub fn insert_pattern_sync(conn: &Connection, pattern: &Pattern) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO patterns (id, signature, category, confidence, match_quality, usage_count,
             success_count, tags, source_conversations, forwarding_id, archived_at, last_used_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            pattern.id,
            pattern.signature,
            pattern.category,
            pattern.confidence,
            pattern.match_quality,
            pattern.usage_count,
            pattern.success_count,
            serde_json::to_string(&pattern.tags).unwrap_or_else(|_| "[]".into()),
            serde_json::to_string(&pattern.source_conversations).unwrap_or_else(|_| "[]".into()),
            pattern.forwarding_id,
            pattern.archived_at,
            pattern.last_used_at,
            pattern.created_at,
        ],
    )?;
    Ok(())
}

pub fn get_pattern_sync(conn: &Connection, id: &str) -> rusqlite::Result<Option<Pattern>> {
    conn.query_row(
        &format!("SELECT {PATTERN_COLUMNS} FROM patterns WHERE id = ?1"),
        [id],
        parse_pattern_row,
    )
    .optional()
}

/// Look up a pattern, following forwarding pointers left by merges so old
/// ids keep resolving. Chains longer than `MAX_FORWARD_HOPS` (or cyclic
/// ones) return None with a warning.
pub fn resolve_pattern_sync(conn: &Connection, id: &str) -> rusqlite::Result<Option<Pattern>> {
    let mut current = id.to_string();
    let mut visited = BTreeSet::new();

    for _ in 0..MAX_FORWARD_HOPS {
        if !visited.insert(current.clone()) {
            tracing::warn!("Forwarding cycle detected at pattern {current}");
            return Ok(None);
        }
        match get_pattern_sync(conn, &current)? {
            None => return Ok(None),
            Some(pattern) => match pattern.forwarding_id.clone() {
                Some(next) => current = next,
                None => return Ok(Some(pattern)),
            },
        }
    }
    tracing::warn!("Forwarding chain from pattern {id} exceeds {MAX_FORWARD_HOPS} hops");
    Ok(None)
}

/// Find the live same-category pattern most similar to `signature`, if any
/// reaches `threshold`. Candidates come from the FTS index (capped) so a
/// 50k-pattern catalog is never scanned row by row.
pub fn find_merge_target_sync(
    conn: &Connection,
    signature: &str,
    category: &str,
    threshold: f64,
    candidate_limit: usize,
) -> rusqlite::Result<Option<(String, f64)>> {
    let Some(fts_query) = fts_query_from_text(signature) else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(&format!(
        "SELECT {PATTERN_COLUMNS_QUALIFIED}
         FROM patterns_fts
         JOIN patterns ON patterns.rowid = patterns_fts.rowid
         WHERE patterns_fts MATCH ?1
           AND patterns.category = ?2
           AND patterns.archived_at IS NULL
           AND patterns.forwarding_id IS NULL
         ORDER BY bm25(patterns_fts)
         LIMIT ?3"
    ))?;

    let candidates: Vec<Pattern> = stmt
        .query_map(
            params![fts_query, category, candidate_limit as i64],
            parse_pattern_row,
        )?
        .filter_map(log_and_discard)
        .collect();

    let mut best: Option<(String, f64)> = None;
    for candidate in candidates {
        let similarity = signature_similarity(signature, &candidate.signature);
        if similarity >= threshold {
            match &best {
                Some((_, current)) if *current >= similarity => {}
                _ => best = Some((candidate.id, similarity)),
            }
        }
    }
    Ok(best)
}

/// Fold one piece of evidence into an existing pattern: counters bump,
/// match quality moves as a running average, tags union, and confidence is
/// recomputed from the row's own counters (age 0 at this write).
pub fn apply_evidence_sync(
    conn: &Connection,
    id: &str,
    evidence: &PatternEvidence,
    scoring: &ScoringConfig,
    now: &str,
) -> rusqlite::Result<()> {
    let Some(pattern) = get_pattern_sync(conn, id)? else {
        return Err(rusqlite::Error::QueryReturnedNoRows);
    };

    let usage_count = pattern.usage_count + 1;
    let success_count = pattern.success_count + i64::from(evidence.succeeded);
    let match_quality =
        pattern.match_quality + (evidence.match_quality - pattern.match_quality) / usage_count as f64;

    let mut tags: BTreeSet<String> = pattern.tags.into_iter().collect();
    tags.extend(evidence.tags.iter().cloned());
    let mut sources: BTreeSet<String> = pattern.source_conversations.into_iter().collect();
    if let Some(src) = &evidence.source_conversation {
        sources.insert(src.clone());
    }

    let confidence = confidence::score(
        ConfidenceInputs {
            match_quality,
            usage_count,
            success_count,
            age_days: 0.0,
        },
        scoring,
    );

    conn.execute(
        "UPDATE patterns
         SET confidence = ?1, match_quality = ?2, usage_count = ?3, success_count = ?4,
             tags = ?5, source_conversations = ?6, last_used_at = ?7
         WHERE id = ?8",
        params![
            confidence,
            match_quality,
            usage_count,
            success_count,
            serde_json::to_string(&tags.into_iter().collect::<Vec<_>>())
                .unwrap_or_else(|_| "[]".into()),
            serde_json::to_string(&sources.into_iter().collect::<Vec<_>>())
                .unwrap_or_else(|_| "[]".into()),
            now,
            id,
        ],
    )?;
    Ok(())
}

/// FTS candidates for a search query with their raw BM25 rank
/// (lower/more negative = better).
pub fn search_candidates_sync(
    conn: &Connection,
    fts_query: &str,
    candidate_limit: usize,
) -> rusqlite::Result<Vec<(Pattern, f64)>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PATTERN_COLUMNS_QUALIFIED}, bm25(patterns_fts) AS rank
         FROM patterns_fts
         JOIN patterns ON patterns.rowid = patterns_fts.rowid
         WHERE patterns_fts MATCH ?1
           AND patterns.archived_at IS NULL
           AND patterns.forwarding_id IS NULL
         ORDER BY rank
         LIMIT ?2"
    ))?;

    let rows = stmt
        .query_map(params![fts_query, candidate_limit as i64], |row| {
            let pattern = parse_pattern_row(row)?;
            let rank: f64 = row.get("rank")?;
            Ok((pattern, rank))
        })?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Cheap prefilter: live patterns by stored confidence. Serves as the
/// browse path for empty queries and the partial result when the FTS stage
/// times out.
pub fn top_by_confidence_sync(
    conn: &Connection,
    min_confidence: f64,
    limit: usize,
) -> rusqlite::Result<Vec<Pattern>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PATTERN_COLUMNS}
         FROM patterns
         WHERE archived_at IS NULL AND forwarding_id IS NULL AND confidence >= ?1
         ORDER BY confidence DESC, usage_count DESC, last_used_at DESC, id ASC
         LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![min_confidence, limit as i64], parse_pattern_row)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Merge pattern `b_id` into `a_id` (or vice versa; the higher-confidence
/// row wins). Must be called inside a transaction.
///
/// The loser keeps a forwarding pointer and is archived; its relationship
/// edges are rewritten onto the canonical id, folding parallel edges and
/// dropping self-edges.
pub fn merge_patterns_sync(
    conn: &Connection,
    a_id: &str,
    b_id: &str,
    scoring: &ScoringConfig,
    strength_cap: f64,
    now: &str,
    now_naive: NaiveDateTime,
) -> rusqlite::Result<MergeOutcome> {
    if a_id == b_id {
        return Ok(MergeOutcome::Rejected(
            "cannot merge a pattern with itself".into(),
        ));
    }
    let (Some(a), Some(b)) = (get_pattern_sync(conn, a_id)?, get_pattern_sync(conn, b_id)?) else {
        return Ok(MergeOutcome::Rejected(format!(
            "merge requires two existing patterns ({a_id}, {b_id})"
        )));
    };
    if !a.is_live() || !b.is_live() {
        return Ok(MergeOutcome::Rejected(
            "merge requires two live patterns".into(),
        ));
    }

    // Higher confidence wins; the deterministic precedence chain breaks ties.
    let (winner, loser) = match a
        .confidence
        .partial_cmp(&b.confidence)
        .unwrap_or(Ordering::Equal)
    {
        Ordering::Greater => (a, b),
        Ordering::Less => (b, a),
        Ordering::Equal => match pattern_precedence(&a, &b) {
            Ordering::Greater => (b, a),
            _ => (a, b),
        },
    };

    let usage_count = winner.usage_count + loser.usage_count;
    let success_count = winner.success_count + loser.success_count;
    let match_quality = if usage_count > 0 {
        (winner.match_quality * winner.usage_count as f64
            + loser.match_quality * loser.usage_count as f64)
            / usage_count as f64
    } else {
        winner.match_quality
    };

    let mut tags: BTreeSet<String> = winner.tags.iter().cloned().collect();
    tags.extend(loser.tags.iter().cloned());
    let mut sources: BTreeSet<String> = winner.source_conversations.iter().cloned().collect();
    sources.extend(loser.source_conversations.iter().cloned());

    let last_used_at = winner.last_used_at.clone().max(loser.last_used_at.clone());
    let confidence = confidence::score(
        ConfidenceInputs {
            match_quality,
            usage_count,
            success_count,
            age_days: age_days(&last_used_at, now_naive),
        },
        scoring,
    );

    conn.execute(
        "UPDATE patterns
         SET confidence = ?1, match_quality = ?2, usage_count = ?3, success_count = ?4,
             tags = ?5, source_conversations = ?6, last_used_at = ?7
         WHERE id = ?8",
        params![
            confidence,
            match_quality,
            usage_count,
            success_count,
            serde_json::to_string(&tags.into_iter().collect::<Vec<_>>())
                .unwrap_or_else(|_| "[]".into()),
            serde_json::to_string(&sources.into_iter().collect::<Vec<_>>())
                .unwrap_or_else(|_| "[]".into()),
            last_used_at,
            winner.id,
        ],
    )?;

    rewrite_edges_sync(conn, &loser.id, &winner.id, strength_cap)?;

    // Forwarding pointer so old references never dangle; the loser leaves
    // the live set.
    conn.execute(
        "UPDATE patterns SET forwarding_id = ?1, archived_at = ?2 WHERE id = ?3",
        params![winner.id, now, loser.id],
    )?;

    Ok(MergeOutcome::Merged {
        canonical: winner.id,
        forwarded: loser.id,
    })
}

/// Move every edge touching `old_id` onto `new_id`, folding duplicates
/// (occurrences sum, strength sums up to the cap) and dropping self-edges.
fn rewrite_edges_sync(
    conn: &Connection,
    old_id: &str,
    new_id: &str,
    strength_cap: f64,
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(
        "SELECT id, from_id, to_id, relation_type, strength, occurrence_count, first_seen, last_seen
         FROM relationships WHERE from_id = ?1 OR to_id = ?1",
    )?;
    let edges: Vec<(i64, String, String, String, f64, i64, String, String)> = stmt
        .query_map([old_id], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
            ))
        })?
        .filter_map(log_and_discard)
        .collect();

    for (edge_id, from_id, to_id, relation_type, strength, occurrences, first_seen, last_seen) in
        edges
    {
        let new_from: &str = if from_id == old_id { new_id } else { from_id.as_str() };
        let new_to: &str = if to_id == old_id { new_id } else { to_id.as_str() };

        if new_from == new_to {
            conn.execute("DELETE FROM relationships WHERE id = ?1", [edge_id])?;
            continue;
        }

        let existing: Option<(i64, f64, i64, String, String)> = conn
            .query_row(
                "SELECT id, strength, occurrence_count, first_seen, last_seen
                 FROM relationships
                 WHERE from_id = ?1 AND to_id = ?2 AND relation_type = ?3 AND id != ?4",
                params![new_from, new_to, relation_type, edge_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;

        match existing {
            Some((other_id, other_strength, other_occurrences, other_first, other_last)) => {
                conn.execute(
                    "UPDATE relationships
                     SET strength = ?1, occurrence_count = ?2, first_seen = ?3, last_seen = ?4
                     WHERE id = ?5",
                    params![
                        (strength + other_strength).min(strength_cap),
                        occurrences + other_occurrences,
                        first_seen.clone().min(other_first),
                        last_seen.clone().max(other_last),
                        other_id,
                    ],
                )?;
                conn.execute("DELETE FROM relationships WHERE id = ?1", [edge_id])?;
            }
            None => {
                conn.execute(
                    "UPDATE relationships SET from_id = ?1, to_id = ?2 WHERE id = ?3",
                    params![new_from, new_to, edge_id],
                )?;
            }
        }
    }
    Ok(())
}

/// Upsert a co-occurrence edge: +1 occurrence, +1.0 strength up to the cap.
/// Endpoints resolve through forwarding pointers first.
pub fn record_relationship_sync(
    conn: &Connection,
    from_id: &str,
    to_id: &str,
    relation_type: &str,
    strength_cap: f64,
    now: &str,
) -> rusqlite::Result<EdgeOutcome> {
    let Some(from) = resolve_pattern_sync(conn, from_id)? else {
        return Ok(EdgeOutcome::Rejected(format!(
            "relationship endpoint {from_id} does not resolve"
        )));
    };
    let Some(to) = resolve_pattern_sync(conn, to_id)? else {
        return Ok(EdgeOutcome::Rejected(format!(
            "relationship endpoint {to_id} does not resolve"
        )));
    };
    if from.id == to.id {
        return Ok(EdgeOutcome::Rejected(
            "relationship endpoints resolve to the same pattern".into(),
        ));
    }

    conn.execute(
        "INSERT INTO relationships (from_id, to_id, relation_type, strength, occurrence_count, first_seen, last_seen)
         VALUES (?1, ?2, ?3, 1.0, 1, ?4, ?4)
         ON CONFLICT(from_id, to_id, relation_type) DO UPDATE SET
             strength = MIN(strength + 1.0, ?5),
             occurrence_count = occurrence_count + 1,
             last_seen = ?4",
        params![from.id, to.id, relation_type, now, strength_cap],
    )?;
    Ok(EdgeOutcome::Recorded)
}

/// All live (searchable) patterns.
pub fn list_live_patterns_sync(conn: &Connection) -> rusqlite::Result<Vec<Pattern>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PATTERN_COLUMNS} FROM patterns
         WHERE archived_at IS NULL AND forwarding_id IS NULL
         ORDER BY last_used_at DESC, id ASC"
    ))?;
    let rows = stmt
        .query_map([], parse_pattern_row)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Every pattern row, tombstones included (snapshot/export).
pub fn list_patterns_sync(conn: &Connection) -> rusqlite::Result<Vec<Pattern>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PATTERN_COLUMNS} FROM patterns ORDER BY created_at ASC, id ASC"
    ))?;
    let rows = stmt
        .query_map([], parse_pattern_row)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

pub fn list_relationships_sync(conn: &Connection) -> rusqlite::Result<Vec<Relationship>> {
    let mut stmt = conn.prepare(
        "SELECT from_id, to_id, relation_type, strength, occurrence_count, first_seen, last_seen
         FROM relationships ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(Relationship {
                from_id: row.get(0)?,
                to_id: row.get(1)?,
                relation_type: row.get(2)?,
                strength: row.get(3)?,
                occurrence_count: row.get(4)?,
                first_seen: row.get(5)?,
                last_seen: row.get(6)?,
            })
        })?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

pub fn insert_relationship_sync(conn: &Connection, edge: &Relationship) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO relationships (from_id, to_id, relation_type, strength, occurrence_count, first_seen, last_seen)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            edge.from_id,
            edge.to_id,
            edge.relation_type,
            edge.strength,
            edge.occurrence_count,
            edge.first_seen,
            edge.last_seen,
        ],
    )?;
    Ok(())
}

pub fn archive_pattern_sync(conn: &Connection, id: &str, now: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE patterns SET archived_at = ?1 WHERE id = ?2",
        params![now, id],
    )?;
    Ok(())
}

/// Hard delete a pattern. Must be called inside a transaction.
///
/// Edges touching the row are removed and any forwarding pointers aimed at
/// it are cleared (those tombstones stay archived and age out through the
/// grace rule).
pub fn delete_pattern_sync(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
    conn.execute(
        "DELETE FROM relationships WHERE from_id = ?1 OR to_id = ?1",
        [id],
    )?;
    conn.execute(
        "UPDATE patterns SET forwarding_id = NULL WHERE forwarding_id = ?1",
        [id],
    )?;
    let deleted = conn.execute("DELETE FROM patterns WHERE id = ?1", [id])? > 0;
    Ok(deleted)
}

/// Refresh stored confidence for every live pattern from its own counters
/// at the current age. Returns the number of rows rescored.
pub fn rescore_live_patterns_sync(
    conn: &Connection,
    scoring: &ScoringConfig,
    now_naive: NaiveDateTime,
) -> rusqlite::Result<usize> {
    let live = list_live_patterns_sync(conn)?;
    let mut rescored = 0;
    for pattern in live {
        let fresh = confidence::score(
            ConfidenceInputs {
                match_quality: pattern.match_quality,
                usage_count: pattern.usage_count,
                success_count: pattern.success_count,
                age_days: age_days(&pattern.last_used_at, now_naive),
            },
            scoring,
        );
        if (fresh - pattern.confidence).abs() > f64::EPSILON {
            conn.execute(
                "UPDATE patterns SET confidence = ?1 WHERE id = ?2",
                params![fresh, pattern.id],
            )?;
            rescored += 1;
        }
    }
    Ok(rescored)
}

/// (live, archived, forwarded, average live confidence) for stats.
pub fn pattern_counts_sync(conn: &Connection) -> rusqlite::Result<(i64, i64, i64, f64)> {
    conn.query_row(
        "SELECT
            (SELECT COUNT(*) FROM patterns WHERE archived_at IS NULL AND forwarding_id IS NULL),
            (SELECT COUNT(*) FROM patterns WHERE archived_at IS NOT NULL),
            (SELECT COUNT(*) FROM patterns WHERE forwarding_id IS NOT NULL),
            (SELECT COALESCE(AVG(confidence), 0.0) FROM patterns
              WHERE archived_at IS NULL AND forwarding_id IS NULL)",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
    )
}

pub fn relationship_count_sync(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM relationships", [], |row| row.get(0))
}

pub fn live_pattern_count_sync(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM patterns WHERE archived_at IS NULL AND forwarding_id IS NULL",
        [],
        |row| row.get(0),
    )
}
