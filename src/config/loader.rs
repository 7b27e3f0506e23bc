/// Configuration loading from JSON documents
use crate::config::builder::{SandboxConfig, SandboxConfigBuilder};
use crate::config::types::{JailError, Result};
use std::path::Path;

/// Read a JSON document into a draft without validating it
pub fn load_builder<P: AsRef<Path>>(path: P) -> Result<SandboxConfigBuilder> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        JailError::ConfigSource(format!("Failed to read config file {:?}: {}", path, e))
    })?;
    parse_builder(&content)
        .map_err(|e| JailError::ConfigSource(format!("{:?}: {}", path, e)))
}

/// Parse a JSON string into a draft
pub fn parse_builder(content: &str) -> Result<SandboxConfigBuilder> {
    serde_json::from_str(content)
        .map_err(|e| JailError::ConfigSource(format!("Failed to parse config JSON: {}", e)))
}

/// Load and validate a configuration file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<SandboxConfig> {
    let builder = load_builder(path)?;
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ConfigViolation;
    use std::io::Write;

    fn write_temp(name: &str, content: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "jailbox-loader-{}-{}.json",
            name,
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_valid_file() {
        let path = write_temp("valid", r#"{"identity": {"hostname": "jail"}}"#);
        let config = load_config(&path).unwrap();
        assert_eq!(config.identity().hostname.as_deref(), Some("jail"));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_missing_file_is_source_error() {
        let err = load_config("/nonexistent/jailbox.json").unwrap_err();
        assert!(matches!(err, JailError::ConfigSource(_)));
    }

    #[test]
    fn test_malformed_json_is_source_error() {
        assert!(matches!(
            parse_builder("{not json"),
            Err(JailError::ConfigSource(_))
        ));
    }

    #[test]
    fn test_invalid_config_reports_violations() {
        let path = write_temp("invalid", r#"{"working_dir": "relative"}"#);
        match load_config(&path) {
            Err(JailError::Config(err)) => {
                assert!(matches!(
                    err.violations.as_slice(),
                    [ConfigViolation::RelativePath { .. }]
                ));
            }
            other => panic!("expected config error, got {:?}", other),
        }
        let _ = std::fs::remove_file(path);
    }
}
