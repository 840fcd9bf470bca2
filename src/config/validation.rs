//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate addresses, value ranges and protocol combinations
//! - Compile patterns and rules once so bad ones fail before start
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::{
    DiscoveryKind, HealthcheckKind, Protocol, ProxyConfig, ServerConfig,
};
use crate::discovery::LineParser;
use crate::net::access::AccessPolicy;

/// One semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Server name, or `None` for global sections.
    pub server: Option<String>,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.server {
            Some(server) => write!(f, "servers.{}.{}: {}", server, self.field, self.message),
            None => write!(f, "{}: {}", self.field, self.message),
        }
    }
}

struct Errors {
    server: Option<String>,
    list: Vec<ValidationError>,
}

impl Errors {
    fn push(&mut self, field: &str, message: impl Into<String>) {
        self.list.push(ValidationError {
            server: self.server.clone(),
            field: field.to_string(),
            message: message.into(),
        });
    }
}

const TLS_VERSIONS: [&str; 2] = ["tls12", "tls13"];

pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Errors {
        server: None,
        list: Vec::new(),
    };

    if !matches!(config.logging.output.as_str(), "stdout" | "stderr") {
        errors.push("logging.output", "expected stdout or stderr");
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push("observability.metrics_address", "invalid socket address");
    }
    if config.servers.is_empty() {
        errors.push("servers", "no servers configured");
    }

    for (name, server) in &config.servers {
        errors.server = Some(name.clone());
        validate_server(server, &mut errors);
    }

    if errors.list.is_empty() {
        Ok(())
    } else {
        Err(errors.list)
    }
}

fn validate_server(cfg: &ServerConfig, errors: &mut Errors) {
    if cfg.bind.parse::<SocketAddr>().is_err() {
        errors.push("bind", format!("invalid socket address {:?}", cfg.bind));
    }

    match (cfg.protocol, &cfg.tls) {
        (Protocol::Tls, None) => errors.push("tls", "protocol tls requires a [tls] section"),
        (Protocol::Tls, Some(tls)) => {
            let min = TLS_VERSIONS.iter().position(|v| *v == tls.min_version);
            let max = TLS_VERSIONS.iter().position(|v| *v == tls.max_version);
            match (min, max) {
                (Some(min), Some(max)) if min > max => {
                    errors.push("tls.min_version", "min_version is above max_version")
                }
                (Some(_), Some(_)) => {}
                _ => errors.push("tls", "versions must be tls12 or tls13"),
            }
        }
        (_, Some(_)) => errors.push("tls", "[tls] is only used with protocol tls"),
        _ => {}
    }

    if cfg.protocol == Protocol::Udp {
        if cfg.sni.is_some() {
            errors.push("sni", "sni is not available for udp");
        }
        if cfg.proxy_protocol.is_some() {
            errors.push("proxy_protocol", "proxy_protocol is not available for udp");
        }
        if cfg.backends_tls.is_some() {
            errors.push("backends_tls", "backends_tls is not available for udp");
        }
        if cfg.udp.max_queue == 0 {
            errors.push("udp.max_queue", "must be greater than 0");
        }
    }

    if let Some(btls) = &cfg.backends_tls {
        if !btls.ignore_verify && btls.root_ca_cert_path.is_none() {
            errors.push(
                "backends_tls.root_ca_cert_path",
                "required unless ignore_verify is set",
            );
        }
        if btls.cert_path.is_some() != btls.key_path.is_some() {
            errors.push("backends_tls", "cert_path and key_path must be set together");
        }
    }

    if let Some(pp) = &cfg.proxy_protocol {
        if pp.version.trim() != "1" {
            errors.push("proxy_protocol.version", "only version \"1\" is supported");
        }
    }

    if let Some(access) = &cfg.access {
        if let Err(e) = AccessPolicy::new(access) {
            errors.push("access", e.to_string());
        }
    }

    validate_discovery(cfg, errors);
    validate_healthcheck(cfg, errors);
}

fn validate_discovery(cfg: &ServerConfig, errors: &mut Errors) {
    let discovery = &cfg.discovery;
    if discovery.timeout_ms == 0 {
        errors.push("discovery.timeout_ms", "must be greater than 0");
    }

    match &discovery.kind {
        DiscoveryKind::Static { static_list } => {
            let parser = LineParser::default();
            for line in static_list {
                if parser.parse(line).is_none() {
                    errors.push("discovery.static_list", format!("cannot parse {:?}", line));
                }
            }
        }
        DiscoveryKind::Plaintext {
            plaintext_endpoint,
            plaintext_regex_pattern,
        } => {
            if plaintext_endpoint.is_empty() {
                errors.push("discovery.plaintext_endpoint", "must not be empty");
            }
            if let Err(e) = LineParser::new(plaintext_regex_pattern.as_deref()) {
                errors.push("discovery.plaintext_regex_pattern", e.to_string());
            }
        }
        DiscoveryKind::Json { json_endpoint, .. } => {
            if json_endpoint.is_empty() {
                errors.push("discovery.json_endpoint", "must not be empty");
            }
        }
        DiscoveryKind::Exec { exec_command } => {
            if exec_command.is_empty() {
                errors.push("discovery.exec_command", "must not be empty");
            }
        }
    }
}

fn validate_healthcheck(cfg: &ServerConfig, errors: &mut Errors) {
    let hc = &cfg.healthcheck;
    if hc.kind == HealthcheckKind::None {
        return;
    }

    if hc.interval_ms == 0 {
        errors.push("healthcheck.interval_ms", "must be greater than 0");
    }
    if hc.timeout_ms == 0 {
        errors.push("healthcheck.timeout_ms", "must be greater than 0");
    }
    if hc.passes == 0 || hc.fails == 0 {
        errors.push("healthcheck", "passes and fails must be at least 1");
    }

    match &hc.kind {
        HealthcheckKind::Probe { probe_recv, .. } if probe_recv.is_empty() => {
            errors.push("healthcheck.probe_recv", "must not be empty")
        }
        HealthcheckKind::Exec { exec_command, .. } if exec_command.is_empty() => {
            errors.push("healthcheck.exec_command", "must not be empty")
        }
        _ => {}
    }
}
