//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks for the server or client role)
//!     → TunnelConfig (validated, immutable)
//!     → converted into runtime values (Duration, quinn configs) at startup
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    ClientConfig, EgressConfig, LimitsConfig, ObservabilityConfig, ServerConfig, TimeoutConfig, TlsConfig,
    TransportConfig, TunnelConfig, DEFAULT_ALPN,
};
pub use validation::{validate_config, Role, ValidationError};
