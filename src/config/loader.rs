//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::ClientConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ClientConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<ClientConfig, ConfigError> {
    let config: ClientConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_default_config() {
        let config = parse_config("").unwrap();
        assert_eq!(config.connection.pipelining, 1);
    }

    #[test]
    fn test_syntax_error_is_parse_error() {
        assert!(matches!(
            parse_config("[connection\npipelining = 2"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = parse_config("[retry]\ntimeout_factor = 0.5\n").unwrap_err();
        match err {
            ConfigError::Validation(errors) => {
                assert_eq!(errors[0].field, "retry.timeout_factor");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = load_config(Path::new("/nonexistent/pipeliner.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
