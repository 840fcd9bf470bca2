//! Backend identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identity of a backend: host and port as reported by discovery.
///
/// Equality is plain field comparison, so `"localhost:80"` and
/// `"127.0.0.1:80"` are different targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target {
    pub host: String,
    pub port: String,
}

/// Error returned when a `host:port` string cannot be split.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid target address: {0:?}")]
pub struct TargetParseError(pub String);

impl Target {
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: port.into(),
        }
    }

    /// The dialable `host:port` form. IPv6 hosts are bracketed.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Target {
    type Err = TargetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TargetParseError(s.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() || port.is_empty() || port.parse::<u16>().is_err() {
            return Err(TargetParseError(s.to_string()));
        }
        Ok(Self::new(host, port))
    }
}
