//! Configuration file loading and parsing.
//!
//! This module handles loading the configuration file from disk and parsing
//! it into validated, type-safe structures.
//!
//! # Configuration File Locations
//!
//! 1. Path given on the command line (must exist)
//! 2. Default location, if present:
//!    - **Linux/macOS:** `~/.parley-ls/config.json`
//!    - **Windows:** `%USERPROFILE%\.parley-ls\config.json`
//! 3. Built-in defaults
//!
//! # Example Configuration
//!
//! ```json
//! {
//!   "transport": { "mode": "tcp-listen", "port": 6601 },
//!   "diagnostics": { "debounce_ms": 200, "merge": "concatenate" },
//!   "words": { "min_word_length": 3 },
//!   "logging": { "level": "info" }
//! }
//! ```

mod settings;

pub use settings::{
    Config, DiagnosticsConfig, FramingMode, LoggingConfig, TransportConfig, TransportMode,
    WordsConfig, MAX_DEBOUNCE_MS,
};

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Returns the default configuration directory.
///
/// - **Linux/macOS:** `~/.parley-ls/`
/// - **Windows:** `%USERPROFILE%\.parley-ls\`
#[must_use]
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|p| p.join(".parley-ls"))
}

/// Returns the platform-specific default configuration file path.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    default_config_dir().map(|p| p.join("config.json"))
}

/// Loads and validates the configuration.
///
/// With an explicit `path` the file must exist. Without one, the default
/// location is used when it exists and built-in defaults otherwise.
///
/// # Errors
///
/// Returns an error if:
/// - An explicit configuration file cannot be found
/// - The file cannot be read
/// - The JSON is malformed
/// - A value fails validation
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let config_path = match path {
        Some(p) => p.to_path_buf(),
        None => match default_config_path() {
            Some(p) if p.exists() => p,
            _ => {
                tracing::debug!("No configuration file, using defaults");
                return Ok(Config::default());
            }
        },
    };

    if !config_path.exists() {
        return Err(ConfigError::NotFound { path: config_path });
    }

    let contents = std::fs::read_to_string(&config_path).map_err(|e| ConfigError::ReadError {
        path: config_path.clone(),
        source: e,
    })?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| ConfigError::ParseError {
        path: config_path.clone(),
        source: e,
    })?;

    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn default_config_path_ends_in_config_json() {
        if let Some(path) = default_config_path() {
            assert!(path.to_string_lossy().ends_with("config.json"));
            assert!(path.to_string_lossy().contains(".parley-ls"));
        }
    }

    #[test]
    fn explicit_missing_path_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(
            load_config(Some(&missing)),
            Err(ConfigError::NotFound { .. })
        ));
    }

    #[test]
    fn loads_and_validates_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "words": {{ "min_word_length": 5 }} }}"#).unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.words.min_word_length, 5);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        write!(bad, r#"{{ "words": {{ "min_word_length": 0 }} }}"#).unwrap();
        assert!(matches!(
            load_config(Some(bad.path())),
            Err(ConfigError::ValidationError { .. })
        ));
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            load_config(Some(file.path())),
            Err(ConfigError::ParseError { .. })
        ));
    }
}
