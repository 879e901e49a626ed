//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::TunnelConfig;
use crate::config::validation::{validate_config, Role, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path, role: Role) -> Result<TunnelConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content, role)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str, role: Role) -> Result<TunnelConfig, ConfigError> {
    let config: TunnelConfig = toml::from_str(content)?;
    validate_config(&config, role).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_joined() {
        let err = parse_config("[timeouts]\noperation_ms = 0\n", Role::Client).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation failed: timeouts.operation_ms: must be greater than 0"
        );
    }

    #[test]
    fn syntax_errors_surface_as_parse() {
        let err = parse_config("[client\n", Role::Client).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_io() {
        let err = load_config(Path::new("/nonexistent/tunnel.toml"), Role::Server).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
