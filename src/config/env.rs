// src/config/env.rs
// Environment-based overrides - single source of truth for ENGRAM_* vars

use super::EngineConfig;
use std::str::FromStr;
use tracing::warn;

/// Read a typed value from the environment, keeping the current value on
/// absence or parse failure (parse failures are logged, not fatal; the
/// validated defaults stay in effect).
fn env_override<T: FromStr>(key: &str, current: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return;
        }
        match trimmed.parse::<T>() {
            Ok(parsed) => *current = parsed,
            Err(_) => warn!("Ignoring unparseable {key}='{raw}'"),
        }
    }
}

/// Apply every supported ENGRAM_* override onto a loaded config.
pub fn apply_env_overrides(config: &mut EngineConfig) {
    env_override("ENGRAM_WORKING_CAPACITY", &mut config.working.capacity);
    env_override(
        "ENGRAM_IDLE_TIMEOUT_MINUTES",
        &mut config.working.idle_timeout_minutes,
    );
    env_override(
        "ENGRAM_RETENTION_DAYS",
        &mut config.working.retention_days,
    );
    env_override(
        "ENGRAM_RETRY_BUFFER_BYTES",
        &mut config.working.retry_buffer_bytes,
    );
    env_override("ENGRAM_MAX_TURN_BYTES", &mut config.working.max_turn_bytes);

    env_override(
        "ENGRAM_MERGE_SIMILARITY",
        &mut config.knowledge.merge_similarity,
    );
    env_override("ENGRAM_STRENGTH_CAP", &mut config.knowledge.strength_cap);

    env_override(
        "ENGRAM_USAGE_SATURATION",
        &mut config.scoring.usage_saturation,
    );

    env_override(
        "ENGRAM_CONFIDENCE_FLOOR",
        &mut config.housekeeping.confidence_floor,
    );
    env_override(
        "ENGRAM_STALE_AFTER_DAYS",
        &mut config.housekeeping.stale_after_days,
    );
    env_override("ENGRAM_GRACE_DAYS", &mut config.housekeeping.grace_days);
    env_override(
        "ENGRAM_FLUSH_INTERVAL_SECS",
        &mut config.housekeeping.interval_secs,
    );
    env_override(
        "ENGRAM_TRIGGER_PATTERN_COUNT",
        &mut config.housekeeping.trigger_pattern_count,
    );

    env_override("ENGRAM_SEARCH_TIMEOUT_MS", &mut config.search.timeout_ms);
    env_override(
        "ENGRAM_SEARCH_CANDIDATE_LIMIT",
        &mut config.search.candidate_limit,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_override_applies() {
        std::env::set_var("ENGRAM_WORKING_CAPACITY", "7");
        let mut config = EngineConfig::default();
        apply_env_overrides(&mut config);
        assert_eq!(config.working.capacity, 7);
        std::env::remove_var("ENGRAM_WORKING_CAPACITY");
    }

    #[test]
    fn test_bad_value_keeps_default() {
        std::env::set_var("ENGRAM_SEARCH_TIMEOUT_MS", "not-a-number");
        let mut config = EngineConfig::default();
        apply_env_overrides(&mut config);
        assert_eq!(config.search.timeout_ms, 200);
        std::env::remove_var("ENGRAM_SEARCH_TIMEOUT_MS");
    }
}
