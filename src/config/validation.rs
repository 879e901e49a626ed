//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate addresses, value ranges (timeouts > 0, limits > 0) and ALPN
//! - Check that the selected role has the TLS material it needs
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: TunnelConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{split_host_port, TunnelConfig};

/// Which side of the tunnel a configuration is loaded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Validate `config` for `role`, collecting every error.
pub fn validate_config(config: &TunnelConfig, role: Role) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.tls.alpn.is_empty() || config.tls.alpn.len() > 255 {
        errors.push(ValidationError::new("tls.alpn", "must be 1 to 255 bytes"));
    }
    if config.transport.idle_timeout_secs == 0 {
        errors.push(ValidationError::new("transport.idle_timeout_secs", "must be greater than 0"));
    }
    if config.timeouts.operation_ms == 0 {
        errors.push(ValidationError::new("timeouts.operation_ms", "must be greater than 0"));
    }
    if config.limits.max_request_bytes == 0 {
        errors.push(ValidationError::new("limits.max_request_bytes", "must be greater than 0"));
    }
    if config.limits.max_response_bytes == 0 {
        errors.push(ValidationError::new("limits.max_response_bytes", "must be greater than 0"));
    }
    if config.observability.metrics_enabled {
        check_addr(&mut errors, "observability.metrics_address", &config.observability.metrics_address);
    }
    if !matches!(config.observability.log_format.as_str(), "pretty" | "json") {
        errors.push(ValidationError::new(
            "observability.log_format",
            format!("unknown format {:?}, expected \"pretty\" or \"json\"", config.observability.log_format),
        ));
    }

    match role {
        Role::Server => {
            check_addr(&mut errors, "server.listen_address", &config.server.listen_address);
            if config.tls.cert_path.is_none() {
                errors.push(ValidationError::new("tls.cert_path", "required by the server"));
            }
            if config.tls.key_path.is_none() {
                errors.push(ValidationError::new("tls.key_path", "required by the server"));
            }
        }
        Role::Client => {
            check_addr(&mut errors, "client.listen_address", &config.client.listen_address);
            if split_host_port(&config.client.server_address).is_none() {
                errors.push(ValidationError::new(
                    "client.server_address",
                    format!("{:?} is not a host:port pair", config.client.server_address),
                ));
            }
            if config.client.server_name.as_deref().is_some_and(str::is_empty) {
                errors.push(ValidationError::new("client.server_name", "must not be empty"));
            }
            if config.client.max_connections == 0 {
                errors.push(ValidationError::new("client.max_connections", "must be greater than 0"));
            }
            if config.tls.insecure_skip_verify && config.tls.ca_cert_path.is_some() {
                errors.push(ValidationError::new(
                    "tls.ca_cert_path",
                    "cannot be combined with insecure_skip_verify",
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_addr(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if let Err(e) = value.parse::<SocketAddr>() {
        errors.push(ValidationError::new(field, format!("{value:?} is not a socket address: {e}")));
    }
}
