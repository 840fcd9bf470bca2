//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the balancer.
//! All types derive Serde traits for deserialization from config files.
//! Durations are integer milliseconds; `0` disables the corresponding timeout.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Log level and destination.
    pub logging: LoggingConfig,

    /// Metrics exporter settings.
    pub observability: ObservabilityConfig,

    /// Connection options applied to servers that do not set them.
    pub defaults: ConnectionOptions,

    /// Servers keyed by name.
    pub servers: BTreeMap<String, ServerConfig>,
}

impl ProxyConfig {
    /// Fill every unset per-server connection option from `[defaults]`.
    pub fn apply_defaults(&mut self) {
        let defaults = self.defaults.clone();
        for server in self.servers.values_mut() {
            server.connection.fill_from(&defaults);
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// `stdout` or `stderr`.
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: "stdout".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Enable the Prometheus exporter.
    pub metrics_enabled: bool,

    /// Address the exporter listens on.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9284".to_string(),
        }
    }
}

/// Connection limits and timeouts. Unset values inherit from `[defaults]`.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Concurrent client limit per listener, 0 is unlimited.
    pub max_connections: Option<u32>,
    pub client_idle_timeout_ms: Option<u64>,
    pub backend_idle_timeout_ms: Option<u64>,
    pub backend_connection_timeout_ms: Option<u64>,
}

impl ConnectionOptions {
    fn fill_from(&mut self, defaults: &ConnectionOptions) {
        self.max_connections = self.max_connections.or(defaults.max_connections);
        self.client_idle_timeout_ms = self.client_idle_timeout_ms.or(defaults.client_idle_timeout_ms);
        self.backend_idle_timeout_ms = self
            .backend_idle_timeout_ms
            .or(defaults.backend_idle_timeout_ms);
        self.backend_connection_timeout_ms = self
            .backend_connection_timeout_ms
            .or(defaults.backend_connection_timeout_ms);
    }

    pub fn max_connections(&self) -> Option<usize> {
        self.max_connections.filter(|&n| n > 0).map(|n| n as usize)
    }

    pub fn client_idle_timeout(&self) -> Option<Duration> {
        millis(self.client_idle_timeout_ms)
    }

    pub fn backend_idle_timeout(&self) -> Option<Duration> {
        millis(self.backend_idle_timeout_ms)
    }

    pub fn backend_connection_timeout(&self) -> Option<Duration> {
        millis(self.backend_connection_timeout_ms)
    }
}

fn millis(value: Option<u64>) -> Option<Duration> {
    value.filter(|&ms| ms > 0).map(Duration::from_millis)
}

/// Transport a server listens on.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    /// TCP with TLS terminated at the listener.
    Tls,
}

/// Balancing strategy.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BalanceKind {
    #[default]
    Weight,
    Roundrobin,
    Priority,
    Leastconn,
    Leastbandwidth,
    /// Client IP hash modulo backend count.
    Iphash,
    /// Highest-random-weight hash over client IP and backend address.
    Iphash1,
    /// Highest-random-weight hash over client IP, client port and backend address.
    Ipporthash,
}

/// Configuration of one server (listener + backend pool).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:3000").
    pub bind: String,

    pub protocol: Protocol,

    pub balance: BalanceKind,

    #[serde(flatten)]
    pub connection: ConnectionOptions,

    /// Cancel the liveness signal of backends that fail or leave discovery
    /// so connections to them are closed instead of drained.
    pub close_on_failure: bool,

    pub discovery: DiscoveryConfig,

    pub healthcheck: HealthcheckConfig,

    /// Certificate for `protocol = "tls"`.
    pub tls: Option<TlsConfig>,

    /// Dial backends over TLS.
    pub backends_tls: Option<BackendTlsConfig>,

    /// SNI-aware backend selection.
    pub sni: Option<SniConfig>,

    /// Client address filter.
    pub access: Option<AccessConfig>,

    /// PROXY protocol header sent to backends.
    pub proxy_protocol: Option<ProxyProtocolConfig>,

    pub udp: UdpConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
            protocol: Protocol::Tcp,
            balance: BalanceKind::Weight,
            connection: ConnectionOptions::default(),
            close_on_failure: false,
            discovery: DiscoveryConfig::default(),
            healthcheck: HealthcheckConfig::default(),
            tls: None,
            backends_tls: None,
            sni: None,
            access: None,
            proxy_protocol: None,
            udp: UdpConfig::default(),
        }
    }
}

/// Listener TLS configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate chain (PEM).
    pub cert_path: String,

    /// Path to private key (PEM).
    pub key_path: String,

    /// `tls12` or `tls13`.
    #[serde(default = "default_min_tls")]
    pub min_version: String,

    #[serde(default = "default_max_tls")]
    pub max_version: String,
}

fn default_min_tls() -> String {
    "tls12".to_string()
}

fn default_max_tls() -> String {
    "tls13".to_string()
}

/// TLS towards backends.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BackendTlsConfig {
    /// CA bundle used to verify backend certificates.
    pub root_ca_cert_path: Option<String>,

    /// Client certificate presented to backends.
    pub cert_path: Option<String>,

    pub key_path: Option<String>,

    /// Skip certificate verification entirely.
    pub ignore_verify: bool,

    /// Name to verify instead of the backend SNI or host.
    pub server_name: Option<String>,
}

/// How backend SNI values are compared to the requested hostname.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HostnameMatching {
    /// Case-insensitive equality.
    #[default]
    Exact,
    /// Backend SNI is an anchored regular expression.
    Regexp,
}

/// What to do with a client whose hostname matches no backend.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UnexpectedHostname {
    /// Route to backends without an SNI value.
    #[default]
    Default,
    /// Close the connection.
    Reject,
    /// Ignore SNI and use every candidate.
    Any,
}

/// SNI configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SniConfig {
    pub hostname_matching_strategy: HostnameMatching,
    pub unexpected_hostname_strategy: UnexpectedHostname,
    /// How long to wait for the ClientHello.
    pub read_timeout_ms: u64,
}

impl Default for SniConfig {
    fn default() -> Self {
        Self {
            hostname_matching_strategy: HostnameMatching::Exact,
            unexpected_hostname_strategy: UnexpectedHostname::Default,
            read_timeout_ms: 2_000,
        }
    }
}

/// Access rules.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AccessConfig {
    /// `allow` or `deny`.
    pub default: String,
    /// Ordered rules like `"allow 10.0.0.0/8"`; the first match wins.
    pub rules: Vec<String>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            default: "allow".to_string(),
            rules: Vec::new(),
        }
    }
}

/// PROXY protocol configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyProtocolConfig {
    /// Only `"1"` is supported.
    pub version: String,
}

/// UDP session settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UdpConfig {
    /// Packets forwarded per session, 0 is unlimited, 1 is single-packet mode.
    pub max_requests: u64,
    /// Responses relayed per session before it closes, 0 is unlimited.
    pub max_responses: u64,
    /// Outbound packet queue per session.
    pub max_queue: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            max_requests: 0,
            max_responses: 0,
            max_queue: 10_000,
        }
    }
}

/// What discovery does when a fetch fails.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailPolicy {
    /// Keep the last successful snapshot.
    #[default]
    Keeplast,
    /// Publish an empty snapshot.
    Setempty,
}

/// Discovery source.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DiscoveryKind {
    Static {
        #[serde(default)]
        static_list: Vec<String>,
    },
    Plaintext {
        plaintext_endpoint: String,
        #[serde(default)]
        plaintext_regex_pattern: Option<String>,
    },
    Json {
        json_endpoint: String,
        #[serde(default = "default_json_host")]
        json_host_pattern: String,
        #[serde(default = "default_json_port")]
        json_port_pattern: String,
        #[serde(default = "default_json_weight")]
        json_weight_pattern: String,
        #[serde(default = "default_json_priority")]
        json_priority_pattern: String,
        #[serde(default = "default_json_sni")]
        json_sni_pattern: String,
        #[serde(default = "default_json_max_connections")]
        json_max_connections_pattern: String,
    },
    Exec {
        exec_command: Vec<String>,
    },
}

fn default_json_host() -> String {
    "host".to_string()
}

fn default_json_port() -> String {
    "port".to_string()
}

fn default_json_weight() -> String {
    "weight".to_string()
}

fn default_json_priority() -> String {
    "priority".to_string()
}

fn default_json_sni() -> String {
    "sni".to_string()
}

fn default_json_max_connections() -> String {
    "max_connections".to_string()
}

/// Discovery configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    #[serde(flatten)]
    pub kind: DiscoveryKind,

    /// Refetch interval, 0 fetches once.
    pub interval_ms: u64,

    /// Bound on a single fetch.
    pub timeout_ms: u64,

    /// Wait before retrying a failed fetch.
    pub retry_wait_ms: u64,

    pub failpolicy: FailPolicy,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            kind: DiscoveryKind::Static {
                static_list: Vec::new(),
            },
            interval_ms: 0,
            timeout_ms: 5_000,
            retry_wait_ms: 2_000,
            failpolicy: FailPolicy::Keeplast,
        }
    }
}

/// Transport used by the probe health check.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeProtocol {
    #[default]
    Tcp,
    Udp,
}

/// Health check strategy.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HealthcheckKind {
    None,
    /// TCP connect.
    Ping,
    /// Send bytes, expect a reply starting with `probe_recv`.
    Probe {
        #[serde(default)]
        probe_protocol: ProbeProtocol,
        probe_send: String,
        probe_recv: String,
    },
    /// Run `exec_command <host> <port>` and compare stdout.
    Exec {
        exec_command: Vec<String>,
        #[serde(default = "default_exec_positive")]
        exec_expected_positive_output: String,
        #[serde(default = "default_exec_negative")]
        exec_expected_negative_output: String,
    },
}

fn default_exec_positive() -> String {
    "1".to_string()
}

fn default_exec_negative() -> String {
    "0".to_string()
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthcheckConfig {
    #[serde(flatten)]
    pub kind: HealthcheckKind,

    pub interval_ms: u64,

    pub timeout_ms: u64,

    /// Consecutive successes before a dead backend is live again.
    pub passes: u32,

    /// Consecutive failures before a live backend is dead.
    pub fails: u32,
}

impl Default for HealthcheckConfig {
    fn default() -> Self {
        Self {
            kind: HealthcheckKind::None,
            interval_ms: 2_000,
            timeout_ms: 500,
            passes: 1,
            fails: 1,
        }
    }
}
