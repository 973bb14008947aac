// src/knowledge/types.rs

use super::confidence::ConfidenceLevel;
use serde::{Deserialize, Serialize};

/// A generalized, reusable behavior record in the Knowledge Graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub signature: String,
    pub category: String,
    pub confidence: f64,
    /// Running average of evidence match quality (the stored scorer input).
    pub match_quality: f64,
    pub usage_count: i64,
    pub success_count: i64,
    pub tags: Vec<String>,
    /// Conversation ids this pattern was learned from.
    pub source_conversations: Vec<String>,
    /// Set when this pattern was merged into another; lookups follow it.
    pub forwarding_id: Option<String>,
    pub archived_at: Option<String>,
    pub last_used_at: String,
    pub created_at: String,
}

impl Pattern {
    /// Live patterns are searchable; archived or forwarded rows are not.
    pub fn is_live(&self) -> bool {
        self.archived_at.is_none() && self.forwarding_id.is_none()
    }
}

/// One observation of a pattern in the wild, reported by the external
/// learning path.
#[derive(Debug, Clone)]
pub struct PatternEvidence {
    /// How well the observed behavior matched the signature, in [0, 1].
    pub match_quality: f64,
    pub succeeded: bool,
    /// Conversation the evidence came from, if any.
    pub source_conversation: Option<String>,
    pub tags: Vec<String>,
}

impl PatternEvidence {
    pub fn new(match_quality: f64, succeeded: bool) -> Self {
        Self {
            match_quality,
            succeeded,
            source_conversation: None,
            tags: Vec::new(),
        }
    }

    pub fn with_source(mut self, conversation_id: impl Into<String>) -> Self {
        self.source_conversation = Some(conversation_id.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// A co-occurrence edge between two patterns. Independent lifecycle from
/// the patterns themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub from_id: String,
    pub to_id: String,
    pub relation_type: String,
    pub strength: f64,
    pub occurrence_count: i64,
    pub first_seen: String,
    pub last_seen: String,
}

/// A ranked search hit with its confidence metadata.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredPattern {
    pub pattern: Pattern,
    /// Normalized full-text relevance in [0, 1] (0 for browse results).
    pub relevance: f64,
    /// Blended ranking score (relevance and stored confidence).
    pub score: f64,
    pub level: ConfidenceLevel,
}

/// Search result set. `partial` is set when the full-text stage hit its
/// deadline and the cheap confidence prefilter was returned instead.
#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub hits: Vec<ScoredPattern>,
    pub partial: bool,
}
