//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for both tunnel
//! endpoints. All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default ALPN token advertised by both tunnel endpoints.
pub const DEFAULT_ALPN: &str = "quic-tunnel";

/// Root configuration shared by the `server` and `client` commands.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TunnelConfig {
    /// Tunnel server (QUIC listener) settings.
    pub server: ServerConfig,

    /// Tunnel client (local ingress + dialer) settings.
    pub client: ClientConfig,

    /// Certificates, keys and ALPN for the tunnel hop.
    pub tls: TlsConfig,

    /// QUIC transport settings.
    pub transport: TransportConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Message size bounds.
    pub limits: LimitsConfig,

    /// Origin-facing client settings (server side only).
    pub egress: EgressConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Tunnel server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// UDP address the QUIC endpoint binds (e.g., "0.0.0.0:4433").
    pub listen_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:4433".to_string(),
        }
    }
}

/// Tunnel client configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// TCP address local applications connect to.
    pub listen_address: String,

    /// Tunnel server as `host:port`; hostnames are resolved at startup.
    pub server_address: String,

    /// TLS server name presented during the handshake. Defaults to the host
    /// part of `server_address`.
    pub server_name: Option<String>,

    /// Maximum concurrent local connections (backpressure).
    pub max_connections: usize,

    /// Reuse QUIC connections across requests until the idle timeout.
    pub pool_connections: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:8080".to_string(),
            server_address: "127.0.0.1:4433".to_string(),
            server_name: None,
            max_connections: 1_024,
            pool_connections: true,
        }
    }
}

impl ClientConfig {
    /// The name the client verifies the server certificate against.
    pub fn tls_server_name(&self) -> &str {
        match &self.server_name {
            Some(name) => name.as_str(),
            None => split_host_port(&self.server_address)
                .map(|(host, _)| host)
                .unwrap_or(&self.server_address),
        }
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts. Brackets are removed.
pub fn split_host_port(value: &str) -> Option<(&str, u16)> {
    let (host, port) = value.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = match host.strip_prefix('[') {
        Some(inner) => inner.strip_suffix(']')?,
        None if host.contains(':') => return None,
        None => host,
    };
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

/// TLS configuration for the tunnel hop.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// ALPN token; must be identical on both sides.
    pub alpn: String,

    /// Path to certificate chain file (PEM). Required by the server.
    pub cert_path: Option<String>,

    /// Path to private key file (PEM). Required by the server.
    pub key_path: Option<String>,

    /// CA certificate (PEM) the client pins instead of the webpki roots.
    pub ca_cert_path: Option<String>,

    /// Accept any server certificate (client side, development only).
    pub insecure_skip_verify: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            alpn: DEFAULT_ALPN.to_string(),
            cert_path: None,
            key_path: None,
            ca_cert_path: None,
            insecure_skip_verify: false,
        }
    }
}

/// QUIC transport configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Idle timeout after which QUIC closes a connection, in seconds.
    pub idle_timeout_secs: u64,
}

impl TransportConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Read, write and forwarding deadline in milliseconds.
    pub operation_ms: u64,

    /// Maximum time shutdown waits for in-flight exchanges, in seconds.
    pub drain_secs: u64,
}

impl TimeoutConfig {
    pub fn operation(&self) -> Duration {
        Duration::from_millis(self.operation_ms)
    }

    pub fn drain(&self) -> Duration {
        Duration::from_secs(self.drain_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            operation_ms: 15_000,
            drain_secs: 30,
        }
    }
}

/// Bounds on buffered messages.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum bytes read for one request (head and body).
    pub max_request_bytes: usize,

    /// Maximum bytes read for one response crossing the tunnel.
    pub max_response_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_request_bytes: 4096,
            max_response_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Origin-facing client configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EgressConfig {
    /// Try HTTP/3 before HTTP/2 or HTTP/1.1.
    pub enable_http3: bool,

    /// Skip origin certificate verification.
    pub insecure_skip_verify: bool,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            enable_http3: true,
            insecure_skip_verify: false,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format ("pretty" or "json").
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
