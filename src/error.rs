// src/error.rs
// Standardized error types for Engram

use thiserror::Error;

/// Main error type for the engram library.
///
/// The first four variants are the engine's contract with callers:
/// validation and capacity problems are returned at the call boundary,
/// store failures are retried with bounded backoff before surfacing, and
/// integrity violations abort the enclosing operation (inside a
/// housekeeping run they trigger rollback).
#[derive(Error, Debug)]
pub enum EngramError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown error: {0}")]
    Other(String),
}

/// Convenience type alias for Result using EngramError
pub type Result<T> = std::result::Result<T, EngramError>;

impl From<rusqlite::Error> for EngramError {
    fn from(err: rusqlite::Error) -> Self {
        EngramError::StoreUnavailable(err.to_string())
    }
}

// Pool plumbing (deadpool interact) reports through anyhow; by the time an
// anyhow error escapes the db layer it is a store-level failure.
impl From<anyhow::Error> for EngramError {
    fn from(err: anyhow::Error) -> Self {
        EngramError::StoreUnavailable(format!("{err:#}"))
    }
}

impl From<String> for EngramError {
    fn from(s: String) -> Self {
        EngramError::Other(s)
    }
}

impl From<EngramError> for String {
    fn from(err: EngramError) -> Self {
        err.to_string()
    }
}

impl From<tokio::task::JoinError> for EngramError {
    fn from(err: tokio::task::JoinError) -> Self {
        EngramError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error() {
        let err = EngramError::Validation("negative confidence seed".to_string());
        assert!(err.to_string().contains("validation failed"));
        assert!(err.to_string().contains("negative confidence seed"));
    }

    #[test]
    fn test_capacity_error() {
        let err = EngramError::CapacityExceeded("retry buffer full".to_string());
        assert!(err.to_string().contains("capacity exceeded"));
    }

    #[test]
    fn test_integrity_error() {
        let err = EngramError::Integrity("dangling forwarding id".to_string());
        assert!(err.to_string().contains("integrity violation"));
    }

    #[test]
    fn test_from_rusqlite_error() {
        let sqlite_err = rusqlite::Error::QueryReturnedNoRows;
        let err: EngramError = sqlite_err.into();
        assert!(matches!(err, EngramError::StoreUnavailable(_)));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: EngramError = io_err.into();
        assert!(matches!(err, EngramError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<i32>("not json").unwrap_err();
        let err: EngramError = json_err.into();
        assert!(matches!(err, EngramError::Json(_)));
    }

    #[test]
    fn test_into_string() {
        let err = EngramError::Config("weights must sum to 1.0".to_string());
        let s: String = err.into();
        assert!(s.contains("configuration error"));
    }
}
