// src/config/file.rs
// File-based configuration from ~/.engram/config.toml

use super::EngineConfig;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Load config from the config file, falling back to defaults when the file
/// is missing or unparseable. Validation happens in `EngineConfig::load`.
pub fn load_config_file() -> EngineConfig {
    let path = config_path();

    match std::fs::read_to_string(&path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => {
                debug!(path = %path.display(), "Loaded config from file");
                config
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to parse config file, using defaults");
                EngineConfig::default()
            }
        },
        Err(_) => {
            debug!(path = %path.display(), "Config file not found, using defaults");
            EngineConfig::default()
        }
    }
}

/// Get the config file path
fn config_path() -> PathBuf {
    data_dir().join("config.toml")
}

/// Data directory holding the config file and both store databases.
/// `ENGRAM_DATA_DIR` overrides the default of `~/.engram`.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("ENGRAM_DATA_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".engram")
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test covers both branches: parallel tests mutating the same env
    // var would race.
    #[test]
    fn test_data_dir_override_and_default() {
        std::env::set_var("ENGRAM_DATA_DIR", "/tmp/engram-test-dir");
        assert_eq!(data_dir(), PathBuf::from("/tmp/engram-test-dir"));

        std::env::remove_var("ENGRAM_DATA_DIR");
        let dir = data_dir();
        assert!(dir.ends_with(".engram") || dir == PathBuf::from("./.engram"));
    }
}
