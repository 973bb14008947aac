// src/knowledge/mod.rs
// Knowledge Graph: confidence-scored pattern catalog with relationship
// edges and FTS5 retrieval.

pub mod confidence;
pub mod similarity;
pub mod store;
pub mod types;

pub use confidence::{ConfidenceInputs, ConfidenceLevel};
pub use types::{Pattern, PatternEvidence, Relationship, ScoredPattern, SearchOutcome};

use crate::config::EngineConfig;
use crate::db::{now_ts, DatabasePool};
use crate::error::{EngramError, Result};
use chrono::Utc;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Signatures longer than this are rejected rather than truncated.
const MAX_SIGNATURE_CHARS: usize = 1024;

/// FTS candidate cap when hunting for an upsert merge target.
const UPSERT_CANDIDATE_LIMIT: usize = 64;

/// Knowledge Graph service over `knowledge.db`.
pub struct KnowledgeGraph {
    pool: Arc<DatabasePool>,
    config: Arc<tokio::sync::RwLock<EngineConfig>>,
}

impl KnowledgeGraph {
    pub fn new(pool: Arc<DatabasePool>, config: Arc<tokio::sync::RwLock<EngineConfig>>) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &Arc<DatabasePool> {
        &self.pool
    }

    /// Record a learning signal: fold the evidence into the most similar
    /// live pattern of the category (similarity ≥ merge threshold), or seed
    /// a new pattern from it. Returns the pattern id the evidence landed on.
    pub async fn upsert_pattern(
        &self,
        signature: &str,
        category: &str,
        evidence: PatternEvidence,
    ) -> Result<String> {
        let signature = signature.trim().to_string();
        if signature.is_empty() {
            return Err(EngramError::Validation("pattern signature is empty".into()));
        }
        if signature.chars().count() > MAX_SIGNATURE_CHARS {
            return Err(EngramError::Validation(format!(
                "pattern signature exceeds {MAX_SIGNATURE_CHARS} characters"
            )));
        }
        if !(0.0..=1.0).contains(&evidence.match_quality) {
            return Err(EngramError::Validation(format!(
                "evidence match_quality must be in [0, 1], got {}",
                evidence.match_quality
            )));
        }
        let category = if category.trim().is_empty() {
            "general".to_string()
        } else {
            category.trim().to_string()
        };

        let (threshold, scoring) = {
            let cfg = self.config.read().await;
            (cfg.knowledge.merge_similarity, cfg.scoring.clone())
        };
        let now = now_ts();
        let new_id = uuid::Uuid::new_v4().to_string();

        let id = self
            .pool
            .interact_with_retry(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let target = store::find_merge_target_sync(
                    &tx,
                    &signature,
                    &category,
                    threshold,
                    UPSERT_CANDIDATE_LIMIT,
                )?;

                let id = match target {
                    Some((existing_id, similarity)) => {
                        debug!(
                            "Evidence folded into pattern {existing_id} (similarity {similarity:.3})"
                        );
                        store::apply_evidence_sync(&tx, &existing_id, &evidence, &scoring, &now)?;
                        existing_id
                    }
                    None => {
                        let seeded = seed_pattern(&new_id, &signature, &category, &evidence, &scoring, &now);
                        store::insert_pattern_sync(&tx, &seeded)?;
                        new_id.clone()
                    }
                };
                tx.commit()?;
                Ok(id)
            })
            .await
            .map_err(|e| EngramError::StoreUnavailable(format!("{e:#}")))?;

        Ok(id)
    }

    /// Ranked retrieval: full-text relevance blended with stored confidence.
    ///
    /// The FTS stage runs under the configured deadline while a cheap
    /// confidence-ordered prefilter runs concurrently; when the deadline
    /// expires the prefilter is returned with `partial = true` rather than
    /// hanging the caller.
    pub async fn search(
        &self,
        query: &str,
        min_confidence: f64,
        limit: usize,
    ) -> Result<SearchOutcome> {
        if !(0.0..=1.0).contains(&min_confidence) {
            return Err(EngramError::Validation(format!(
                "min_confidence must be in [0, 1], got {min_confidence}"
            )));
        }
        if limit == 0 {
            return Ok(SearchOutcome {
                hits: Vec::new(),
                partial: false,
            });
        }

        let search_cfg = self.config.read().await.search.clone();
        let fts_query = store::fts_query_from_text(query);

        // Cheap prefilter starts immediately so a timed-out FTS stage still
        // has something ranked to hand back.
        let cheap_pool = self.pool.clone();
        let cheap = tokio::spawn(async move {
            cheap_pool
                .interact_raw(move |conn| {
                    store::top_by_confidence_sync(conn, min_confidence, limit)
                })
                .await
        });

        let Some(fts) = fts_query else {
            // Browse mode: no usable tokens, rank purely by confidence.
            let patterns = cheap
                .await
                .map_err(EngramError::from)?
                .map_err(EngramError::from)?;
            return Ok(SearchOutcome {
                hits: rank_browse(patterns, limit),
                partial: false,
            });
        };

        let candidate_limit = search_cfg.candidate_limit;
        let fts_pool = self.pool.clone();
        let fts_future = fts_pool
            .interact_raw(move |conn| store::search_candidates_sync(conn, &fts, candidate_limit));

        match tokio::time::timeout(Duration::from_millis(search_cfg.timeout_ms), fts_future).await
        {
            Ok(Ok(candidates)) => {
                cheap.abort();
                Ok(SearchOutcome {
                    hits: rank_hits(
                        candidates,
                        min_confidence,
                        limit,
                        search_cfg.relevance_weight,
                    ),
                    partial: false,
                })
            }
            Ok(Err(e)) => {
                cheap.abort();
                Err(EngramError::from(e))
            }
            Err(_elapsed) => {
                warn!(
                    "Search deadline of {}ms hit; returning confidence-ranked partial results",
                    search_cfg.timeout_ms
                );
                // The prefilter started when we did; give it a short grace.
                match tokio::time::timeout(Duration::from_millis(50), cheap).await {
                    Ok(Ok(Ok(patterns))) => Ok(SearchOutcome {
                        hits: rank_browse(patterns, limit),
                        partial: true,
                    }),
                    _ => Ok(SearchOutcome {
                        hits: Vec::new(),
                        partial: true,
                    }),
                }
            }
        }
    }

    /// Merge two patterns. The higher-confidence one becomes canonical; the
    /// loser keeps a forwarding pointer. Returns the canonical id.
    pub async fn merge(&self, a: &str, b: &str) -> Result<String> {
        let (scoring, strength_cap) = {
            let cfg = self.config.read().await;
            (cfg.scoring.clone(), cfg.knowledge.strength_cap)
        };
        let a = a.to_string();
        let b = b.to_string();
        let now = now_ts();
        let now_naive = Utc::now().naive_utc();

        let outcome = self
            .pool
            .interact_with_retry(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let outcome =
                    store::merge_patterns_sync(&tx, &a, &b, &scoring, strength_cap, &now, now_naive)?;
                tx.commit()?;
                Ok(outcome)
            })
            .await
            .map_err(|e| EngramError::StoreUnavailable(format!("{e:#}")))?;

        match outcome {
            store::MergeOutcome::Merged {
                canonical,
                forwarded,
            } => {
                info!("Merged pattern {forwarded} into {canonical}");
                Ok(canonical)
            }
            store::MergeOutcome::Rejected(reason) => Err(EngramError::Validation(reason)),
        }
    }

    /// Record one observed co-occurrence between two patterns.
    pub async fn record_relationship(
        &self,
        from_id: &str,
        to_id: &str,
        relation_type: &str,
    ) -> Result<()> {
        if relation_type.trim().is_empty() {
            return Err(EngramError::Validation("relation_type is empty".into()));
        }
        let strength_cap = self.config.read().await.knowledge.strength_cap;
        let from_id = from_id.to_string();
        let to_id = to_id.to_string();
        let relation_type = relation_type.trim().to_string();
        let now = now_ts();

        let outcome = self
            .pool
            .interact_with_retry(move |conn| {
                store::record_relationship_sync(
                    conn,
                    &from_id,
                    &to_id,
                    &relation_type,
                    strength_cap,
                    &now,
                )
                .map_err(Into::into)
            })
            .await
            .map_err(|e| EngramError::StoreUnavailable(format!("{e:#}")))?;

        match outcome {
            store::EdgeOutcome::Recorded => Ok(()),
            store::EdgeOutcome::Rejected(reason) => Err(EngramError::Validation(reason)),
        }
    }

    /// Fetch a pattern by id, following forwarding pointers left by merges.
    pub async fn get_pattern(&self, id: &str) -> Result<Option<Pattern>> {
        let id = id.to_string();
        self.pool
            .interact_raw(move |conn| store::resolve_pattern_sync(conn, &id))
            .await
            .map_err(Into::into)
    }

    /// All relationship edges (diagnostics and tests).
    pub async fn relationships(&self) -> Result<Vec<Relationship>> {
        self.pool
            .interact_raw(store::list_relationships_sync)
            .await
            .map_err(Into::into)
    }
}

/// Seed a brand-new pattern row from its first piece of evidence.
fn seed_pattern(
    id: &str,
    signature: &str,
    category: &str,
    evidence: &PatternEvidence,
    scoring: &crate::config::ScoringConfig,
    now: &str,
) -> Pattern {
    let usage_count = 1;
    let success_count = i64::from(evidence.succeeded);
    let confidence = confidence::score(
        ConfidenceInputs {
            match_quality: evidence.match_quality,
            usage_count,
            success_count,
            age_days: 0.0,
        },
        scoring,
    );
    let mut tags = evidence.tags.clone();
    tags.sort();
    tags.dedup();

    Pattern {
        id: id.to_string(),
        signature: signature.to_string(),
        category: category.to_string(),
        confidence,
        match_quality: evidence.match_quality,
        usage_count,
        success_count,
        tags,
        source_conversations: evidence
            .source_conversation
            .iter()
            .cloned()
            .collect(),
        forwarding_id: None,
        archived_at: None,
        last_used_at: now.to_string(),
        created_at: now.to_string(),
    }
}

/// BM25 rank (lower/more negative = better) normalized into [0, 1).
fn normalize_rank(bm25: f64) -> f64 {
    let strength = (-bm25).max(0.0);
    strength / (strength + 1.0)
}

/// Blend relevance with stored confidence and apply the deterministic
/// tie-break chain: score, then usage, recency, id.
fn rank_hits(
    candidates: Vec<(Pattern, f64)>,
    min_confidence: f64,
    limit: usize,
    relevance_weight: f64,
) -> Vec<ScoredPattern> {
    let confidence_weight = 1.0 - relevance_weight;
    let mut hits: Vec<ScoredPattern> = candidates
        .into_iter()
        .filter(|(pattern, _)| pattern.confidence >= min_confidence)
        .map(|(pattern, bm25)| {
            let relevance = normalize_rank(bm25);
            let score = relevance_weight * relevance + confidence_weight * pattern.confidence;
            ScoredPattern {
                level: ConfidenceLevel::from_score(pattern.confidence),
                relevance,
                score,
                pattern,
            }
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| store::pattern_precedence(&a.pattern, &b.pattern))
    });
    hits.truncate(limit);
    hits
}

/// Confidence-only ranking for browse mode and partial results.
fn rank_browse(patterns: Vec<Pattern>, limit: usize) -> Vec<ScoredPattern> {
    let mut hits: Vec<ScoredPattern> = patterns
        .into_iter()
        .map(|pattern| ScoredPattern {
            level: ConfidenceLevel::from_score(pattern.confidence),
            relevance: 0.0,
            score: pattern.confidence,
            pattern,
        })
        .collect();
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| store::pattern_precedence(&a.pattern, &b.pattern))
    });
    hits.truncate(limit);
    hits
}
