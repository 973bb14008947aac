// src/knowledge/confidence.rs
// Pure confidence scoring: weighted blend of match quality, usage, success
// rate, and recency. No I/O and no clock: age arrives as an input so identical
// inputs always produce identical output.

use crate::config::ScoringConfig;
use serde::Serialize;

/// Inputs to one confidence computation, all derivable from a stored
/// pattern row plus its age at scoring time.
#[derive(Debug, Clone, Copy)]
pub struct ConfidenceInputs {
    pub match_quality: f64,
    pub usage_count: i64,
    pub success_count: i64,
    /// Days since last use (0 at the moment of a use-driven write).
    pub age_days: f64,
}

/// Display band for a confidence score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConfidenceLevel {
    VeryHigh,
    High,
    Medium,
    Low,
    VeryLow,
}

impl ConfidenceLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.90 {
            ConfidenceLevel::VeryHigh
        } else if score >= 0.75 {
            ConfidenceLevel::High
        } else if score >= 0.50 {
            ConfidenceLevel::Medium
        } else if score >= 0.30 {
            ConfidenceLevel::Low
        } else {
            ConfidenceLevel::VeryLow
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceLevel::VeryHigh => "Very High",
            ConfidenceLevel::High => "High",
            ConfidenceLevel::Medium => "Medium",
            ConfidenceLevel::Low => "Low",
            ConfidenceLevel::VeryLow => "Very Low",
        }
    }
}

impl std::fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log-scaled usage transform, saturating at 1.0 once `saturation` uses are
/// reached.
pub fn usage_score(usage_count: i64, saturation: i64) -> f64 {
    if usage_count <= 0 {
        return 0.0;
    }
    let saturation = saturation.max(1);
    let score = ((1 + usage_count) as f64).ln() / ((1 + saturation) as f64).ln();
    score.min(1.0)
}

/// Fraction of uses that succeeded; 0 when the pattern was never used.
pub fn success_rate(success_count: i64, usage_count: i64) -> f64 {
    if usage_count <= 0 {
        return 0.0;
    }
    (success_count as f64 / usage_count as f64).clamp(0.0, 1.0)
}

/// Stepped recency score over days since last use.
pub fn recency_score(age_days: f64) -> f64 {
    if age_days <= 7.0 {
        1.0
    } else if age_days <= 30.0 {
        0.8
    } else if age_days <= 90.0 {
        0.6
    } else if age_days <= 180.0 {
        0.4
    } else {
        0.2
    }
}

/// Weighted confidence in [0, 1].
pub fn score(inputs: ConfidenceInputs, weights: &ScoringConfig) -> f64 {
    let value = weights.match_weight * inputs.match_quality.clamp(0.0, 1.0)
        + weights.usage_weight * usage_score(inputs.usage_count, weights.usage_saturation)
        + weights.success_weight * success_rate(inputs.success_count, inputs.usage_count)
        + weights.recency_weight * recency_score(inputs.age_days);
    value.clamp(0.0, 1.0)
}
