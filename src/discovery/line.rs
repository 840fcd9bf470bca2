//! Backend line format: `host:port [weight=N] [priority=N] [sni=NAME] [max_connections=N]`.

use regex::Regex;

use crate::core::{Backend, Target};
use crate::discovery::DiscoveryError;

pub const DEFAULT_BACKEND_PATTERN: &str = r"^(?P<host>\S+):(?P<port>\d+)(\sweight=(?P<weight>\d+))?(\spriority=(?P<priority>\d+))?(\ssni=(?P<sni>[^\s]+))?(\smax_connections=(?P<max_connections>\d+))?$";

/// Parses backend lines with a regex exposing named groups.
///
/// `host` and `port` are required; `weight`, `priority`, `sni` and
/// `max_connections` are optional and fall back to backend defaults.
#[derive(Debug, Clone)]
pub struct LineParser {
    regex: Regex,
}

impl Default for LineParser {
    fn default() -> Self {
        Self {
            regex: Regex::new(DEFAULT_BACKEND_PATTERN).expect("default backend pattern is valid"),
        }
    }
}

impl LineParser {
    pub fn new(pattern: Option<&str>) -> Result<Self, DiscoveryError> {
        let Some(pattern) = pattern else {
            return Ok(Self::default());
        };
        let regex = Regex::new(pattern)?;
        let names: Vec<&str> = regex.capture_names().flatten().collect();
        if !names.contains(&"host") || !names.contains(&"port") {
            return Err(DiscoveryError::PatternGroups);
        }
        Ok(Self { regex })
    }

    pub fn parse(&self, line: &str) -> Option<Backend> {
        let caps = self.regex.captures(line.trim())?;
        let host = caps.name("host")?.as_str();
        let port = caps.name("port")?.as_str();
        port.parse::<u16>().ok()?;

        let number = |name: &str| caps.name(name).and_then(|m| m.as_str().parse::<i64>().ok());

        let mut backend = Backend::new(Target::new(host, port));
        if let Some(weight) = number("weight").and_then(|w| i32::try_from(w).ok()) {
            backend = backend.with_weight(weight);
        }
        if let Some(priority) = number("priority").and_then(|p| i32::try_from(p).ok()) {
            backend = backend.with_priority(priority);
        }
        if let Some(sni) = caps.name("sni") {
            backend = backend.with_sni(sni.as_str());
        }
        if let Some(max) = number("max_connections").and_then(|m| u32::try_from(m).ok()) {
            backend = backend.with_max_connections(max);
        }
        Some(backend)
    }

    /// Parse every non-empty line, skipping the ones that do not match.
    pub fn parse_lines<'a, I>(&self, lines: I) -> Vec<Backend>
    where
        I: IntoIterator<Item = &'a str>,
    {
        lines
            .into_iter()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| {
                let parsed = self.parse(line);
                if parsed.is_none() {
                    tracing::warn!(line = %line, "Skipping unparsable backend line");
                }
                parsed
            })
            .collect()
    }
}
