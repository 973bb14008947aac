// src/config/mod.rs
// Typed engine configuration: defaults for every field, range validation,
// TOML file + environment overrides, hot-swappable at runtime.

pub mod env;
pub mod file;

use crate::error::{EngramError, Result};
use serde::Deserialize;

/// Top-level engine configuration.
///
/// Every field has an explicit default, so an empty config file (or none at
/// all) yields a fully working engine. `validate()` must pass before a
/// config is accepted, both at startup and on hot reload.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub working: WorkingConfig,
    pub knowledge: KnowledgeConfig,
    pub scoring: ScoringConfig,
    pub housekeeping: HousekeepingConfig,
    pub search: SearchConfig,
}

/// Working Memory limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkingConfig {
    /// Max open+closed conversations held before FIFO eviction.
    pub capacity: usize,
    /// Minutes of inactivity before a conversation auto-closes.
    pub idle_timeout_minutes: i64,
    /// Days an archived conversation is retained before hard delete.
    pub retention_days: u32,
    /// Byte ceiling for the in-process retry buffer.
    pub retry_buffer_bytes: usize,
    /// Hard ceiling for a single turn's content.
    pub max_turn_bytes: usize,
}

impl Default for WorkingConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            idle_timeout_minutes: 30,
            retention_days: 30,
            retry_buffer_bytes: 256 * 1024,
            max_turn_bytes: 64 * 1024,
        }
    }
}

/// Knowledge Graph thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KnowledgeConfig {
    /// Signature similarity at or above which two patterns count as the
    /// same behavior (evidence fold-in on upsert, merge candidates in
    /// housekeeping).
    pub merge_similarity: f64,
    /// Ceiling for relationship edge strength.
    pub strength_cap: f64,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            merge_similarity: 0.85,
            strength_cap: 10.0,
        }
    }
}

/// Confidence scorer weights. Must sum to 1.0.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScoringConfig {
    pub match_weight: f64,
    pub usage_weight: f64,
    pub success_weight: f64,
    pub recency_weight: f64,
    /// Usage count at which the log-scaled usage score saturates at 1.0.
    pub usage_saturation: i64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            match_weight: 0.40,
            usage_weight: 0.30,
            success_weight: 0.20,
            recency_weight: 0.10,
            usage_saturation: 30,
        }
    }
}

/// Housekeeping tier policy and triggers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HousekeepingConfig {
    /// Patterns below this effective confidence become delete-candidates
    /// once stale.
    pub confidence_floor: f64,
    /// Days without use before a low-confidence pattern counts as stale.
    pub stale_after_days: u32,
    /// Days between archival and hard delete.
    pub grace_days: u32,
    /// Scheduled cadence for the background scheduler.
    pub interval_secs: u64,
    /// Live pattern count that triggers an early flush.
    pub trigger_pattern_count: i64,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.30,
            stale_after_days: 90,
            grace_days: 14,
            interval_secs: 3600,
            trigger_pattern_count: 10_000,
        }
    }
}

/// Retrieval limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchConfig {
    /// Deadline for the full-text stage; on expiry the cheap prefilter is
    /// returned as a partial result.
    pub timeout_ms: u64,
    /// Max FTS candidates fetched before ranking.
    pub candidate_limit: usize,
    /// Blend weight for text relevance vs stored confidence in the final
    /// ranking score (confidence gets 1.0 - relevance_weight).
    pub relevance_weight: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 200,
            candidate_limit: 256,
            relevance_weight: 0.6,
        }
    }
}

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

impl EngineConfig {
    /// Load config from file, apply environment overrides, validate.
    pub fn load() -> Result<Self> {
        let mut config = file::load_config_file();
        env::apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Check every numeric range the engine depends on.
    pub fn validate(&self) -> Result<()> {
        if self.working.capacity == 0 {
            return Err(EngramError::Config(
                "working.capacity must be at least 1".into(),
            ));
        }
        if self.working.idle_timeout_minutes <= 0 {
            return Err(EngramError::Config(
                "working.idle_timeout_minutes must be positive".into(),
            ));
        }
        if self.working.max_turn_bytes == 0 || self.working.retry_buffer_bytes == 0 {
            return Err(EngramError::Config(
                "working turn/buffer byte ceilings must be positive".into(),
            ));
        }
        if self.working.max_turn_bytes > self.working.retry_buffer_bytes {
            return Err(EngramError::Config(
                "working.max_turn_bytes cannot exceed working.retry_buffer_bytes".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.knowledge.merge_similarity)
            || self.knowledge.merge_similarity == 0.0
        {
            return Err(EngramError::Config(
                "knowledge.merge_similarity must be in (0, 1]".into(),
            ));
        }
        if self.knowledge.strength_cap <= 0.0 {
            return Err(EngramError::Config(
                "knowledge.strength_cap must be positive".into(),
            ));
        }

        let s = &self.scoring;
        for (name, w) in [
            ("match_weight", s.match_weight),
            ("usage_weight", s.usage_weight),
            ("success_weight", s.success_weight),
            ("recency_weight", s.recency_weight),
        ] {
            if !(0.0..=1.0).contains(&w) {
                return Err(EngramError::Config(format!(
                    "scoring.{name} must be in [0, 1], got {w}"
                )));
            }
        }
        let sum = s.match_weight + s.usage_weight + s.success_weight + s.recency_weight;
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(EngramError::Config(format!(
                "scoring weights must sum to 1.0, got {sum}"
            )));
        }
        if s.usage_saturation < 1 {
            return Err(EngramError::Config(
                "scoring.usage_saturation must be at least 1".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.housekeeping.confidence_floor) {
            return Err(EngramError::Config(
                "housekeeping.confidence_floor must be in [0, 1]".into(),
            ));
        }
        if self.housekeeping.stale_after_days == 0 {
            return Err(EngramError::Config(
                "housekeeping.stale_after_days must be at least 1".into(),
            ));
        }

        if self.search.timeout_ms == 0 {
            return Err(EngramError::Config(
                "search.timeout_ms must be positive".into(),
            ));
        }
        if self.search.candidate_limit == 0 {
            return Err(EngramError::Config(
                "search.candidate_limit must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.search.relevance_weight) {
            return Err(EngramError::Config(
                "search.relevance_weight must be in [0, 1]".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        config.validate().expect("defaults must be valid");
        assert_eq!(config.working.capacity, 20);
        assert_eq!(config.housekeeping.stale_after_days, 90);
        assert!((config.knowledge.merge_similarity - 0.85).abs() < f64::EPSILON);
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut config = EngineConfig::default();
        config.scoring.match_weight = 0.9;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sum to 1.0"));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = EngineConfig::default();
        config.working.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_similarity_range_rejected() {
        let mut config = EngineConfig::default();
        config.knowledge.merge_similarity = 1.5;
        assert!(config.validate().is_err());
        config.knowledge.merge_similarity = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml = r#"
[working]
capacity = 5

[housekeeping]
stale_after_days = 120
"#;
        let config: EngineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.working.capacity, 5);
        assert_eq!(config.housekeeping.stale_after_days, 120);
        // Untouched sections keep defaults
        assert_eq!(config.search.timeout_ms, 200);
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let toml = r#"
[working]
capactiy = 5
"#;
        assert!(toml::from_str::<EngineConfig>(toml).is_err());
    }
}
