// src/db/mod.rs
// Storage layer: pooled SQLite access and per-store schemas

pub mod pool;
pub mod schema;

pub use pool::DatabasePool;

use chrono::{NaiveDateTime, Utc};

/// Timestamp format shared with SQLite's CURRENT_TIMESTAMP.
pub const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current UTC time as a stored-timestamp string.
pub fn now_ts() -> String {
    Utc::now().naive_utc().format(TS_FORMAT).to_string()
}

/// Parse a stored timestamp ("YYYY-MM-DD HH:MM:SS", with ISO `T` separator
/// tolerated for imported data).
pub fn parse_ts(ts: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(ts, TS_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S"))
        .ok()
}

/// Age of a stored timestamp in fractional days relative to `now`.
/// Unparseable timestamps count as infinitely old; future timestamps
/// (clock skew) clamp to zero.
pub fn age_days(ts: &str, now: NaiveDateTime) -> f64 {
    match parse_ts(ts) {
        Some(dt) => ((now - dt).num_seconds() as f64 / 86_400.0).max(0.0),
        None => f64::INFINITY,
    }
}

/// Keep good rows, log and drop rows that fail to parse.
pub(crate) fn log_and_discard<T>(result: rusqlite::Result<T>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("Discarding unreadable row: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ts_round_trip() {
        let ts = now_ts();
        assert!(parse_ts(&ts).is_some());
    }

    #[test]
    fn test_parse_iso_t_separator() {
        assert!(parse_ts("2026-01-15T10:30:00").is_some());
        assert!(parse_ts("not-a-date").is_none());
    }

    #[test]
    fn test_age_days() {
        let now = parse_ts("2026-01-15 00:00:00").unwrap();
        let age = age_days("2026-01-10 00:00:00", now);
        assert!((age - 5.0).abs() < 0.01);
        // Future timestamps clamp to zero
        assert_eq!(age_days("2026-02-01 00:00:00", now), 0.0);
        // Garbage is infinitely old
        assert!(age_days("garbage", now).is_infinite());
    }
}
