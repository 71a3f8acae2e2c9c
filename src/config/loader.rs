//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::ProxyConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<ProxyConfig, ConfigError> {
    let config: ProxyConfig = toml::from_str(content).map_err(ConfigError::Parse)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_file() {
        let config = parse_config(
            r#"
            [listener]
            bind_address = "127.0.0.1:8100"

            [upstream]
            host = "backend.local"
            port = 9001

            [capture]
            enabled = false

            [timeouts]
            idle_secs = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.listener.bind_address, "127.0.0.1:8100");
        assert_eq!(config.upstream.authority(), "backend.local:9001");
        assert!(!config.capture.enabled);
        assert_eq!(config.timeouts.idle_secs, 10);
    }

    #[test]
    fn rejects_invalid_values() {
        let err = parse_config("[upstream]\nhost = \"\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref errors) if errors.len() == 1));
        assert!(err.to_string().contains("upstream.host"));
    }

    #[test]
    fn rejects_bad_syntax() {
        let err = parse_config("[upstream\nport = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/observing-proxy.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
