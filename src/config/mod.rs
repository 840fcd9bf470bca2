//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize, apply [defaults])
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → one ServerConfig handed to each server at start
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AccessConfig, BackendTlsConfig, BalanceKind, ConnectionOptions, DiscoveryConfig,
    DiscoveryKind, FailPolicy, HealthcheckConfig, HealthcheckKind, HostnameMatching,
    LoggingConfig, ObservabilityConfig, ProbeProtocol, Protocol, ProxyConfig,
    ProxyProtocolConfig, ServerConfig, SniConfig, TlsConfig, UdpConfig, UnexpectedHostname,
};
pub use validation::{validate_config, ValidationError};
