//! Configuration file loading.
//!
//! Settings structs live next to the code that consumes them; this module
//! only knows how to turn a file on disk into any `DeserializeOwned` type.
//! The format is picked from the file extension: `.json` is parsed as JSON,
//! `.toml` (or no extension) as TOML.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::Error;
use crate::result::Result;

/// Load a configuration value from a TOML or JSON file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, the extension is not
/// supported, or the content does not parse into `T`.
pub fn load_config_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::config_read_failed(path, e.to_string()))?;

    debug!(path = %path.display(), bytes = content.len(), "Loaded config file");

    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_json(&content),
        Some("toml") | None => parse_toml(&content),
        Some(_) => Err(Error::UnsupportedConfigFormat {
            path: path.to_path_buf(),
        }),
    }
}

/// Parse a TOML document into `T`.
///
/// # Errors
///
/// Returns an error if the document is not valid TOML for `T`.
pub fn parse_toml<T: DeserializeOwned>(content: &str) -> Result<T> {
    toml::from_str(content).map_err(|e| Error::toml_parse_failed(e.to_string()))
}

/// Parse a JSON document into `T`.
///
/// # Errors
///
/// Returns an error if the document is not valid JSON for `T`.
pub fn parse_json<T: DeserializeOwned>(content: &str) -> Result<T> {
    serde_json::from_str(content).map_err(|e| Error::json_parse_failed(e.to_string()))
}

/// Resolve a config path from an environment variable, if set and non-empty.
#[must_use]
pub fn path_from_env(var: &str) -> Option<PathBuf> {
    std::env::var(var)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use std::io::Write;

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        #[serde(default)]
        size: usize,
    }

    fn write_temp(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(suffix)
            .tempfile()
            .expect("temp file");
        file.write_all(content.as_bytes()).expect("write temp file");
        file
    }

    #[test]
    fn should_load_toml_file() {
        let file = write_temp(".toml", "name = \"alpha\"\nsize = 3\n");
        let sample: Sample = load_config_file(file.path()).expect("toml should parse");
        assert_eq!(
            sample,
            Sample {
                name: "alpha".to_string(),
                size: 3
            }
        );
    }

    #[test]
    fn should_load_json_file() {
        let file = write_temp(".json", r#"{"name": "beta"}"#);
        let sample: Sample = load_config_file(file.path()).expect("json should parse");
        assert_eq!(sample.name, "beta");
        assert_eq!(sample.size, 0);
    }

    #[test]
    fn should_reject_unknown_extension() {
        let file = write_temp(".yaml", "name: gamma");
        let result: Result<Sample> = load_config_file(file.path());
        assert!(matches!(result, Err(Error::UnsupportedConfigFormat { .. })));
    }

    #[test]
    fn should_report_missing_file() {
        let result: Result<Sample> = load_config_file(Path::new("/nonexistent/tether.toml"));
        assert!(matches!(result, Err(Error::ConfigReadFailed { .. })));
    }

    #[test]
    fn should_report_toml_parse_error() {
        let result: Result<Sample> = parse_toml("name = ");
        assert!(matches!(result, Err(Error::TomlParseFailed { .. })));
    }

    #[test]
    fn should_ignore_unset_env_path() {
        assert!(path_from_env("TETHER_TEST_SURELY_UNSET_VARIABLE").is_none());
    }
}
