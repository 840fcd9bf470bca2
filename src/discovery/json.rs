//! JSON array discovery.
//!
//! The endpoint returns an array of objects. Each field is located with a
//! dotted path (`meta.addr.host`, `ports.0`) relative to the array item.

use serde_json::Value;

use crate::core::{Backend, Target};
use crate::discovery::DiscoveryError;

/// Field paths inside one array item.
#[derive(Debug, Clone)]
pub struct JsonPatterns {
    pub host: String,
    pub port: String,
    pub weight: String,
    pub priority: String,
    pub sni: String,
    pub max_connections: String,
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?),
            _ => None,
        })
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Convert a response body into backends. Items without host or port fail
/// the whole fetch.
pub fn parse_backends(body: &str, patterns: &JsonPatterns) -> Result<Vec<Backend>, DiscoveryError> {
    let parsed: Value = serde_json::from_str(body)?;
    let Value::Array(items) = parsed else {
        return Err(DiscoveryError::NotArray);
    };

    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let field = |path: &str, what: &str| {
                lookup(item, path)
                    .and_then(as_string)
                    .ok_or_else(|| DiscoveryError::Entry {
                        index,
                        message: format!("missing {} at `{}`", what, path),
                    })
            };
            let host = field(&patterns.host, "host")?;
            let port = field(&patterns.port, "port")?;
            port.parse::<u16>().map_err(|_| DiscoveryError::Entry {
                index,
                message: format!("invalid port `{}`", port),
            })?;

            let mut backend = Backend::new(Target::new(host, port));
            if let Some(weight) = lookup(item, &patterns.weight).and_then(as_int) {
                backend = backend.with_weight(weight as i32);
            }
            if let Some(priority) = lookup(item, &patterns.priority).and_then(as_int) {
                backend = backend.with_priority(priority as i32);
            }
            if let Some(Value::String(sni)) = lookup(item, &patterns.sni) {
                backend = backend.with_sni(sni.as_str());
            }
            if let Some(max) = lookup(item, &patterns.max_connections).and_then(as_int) {
                backend = backend.with_max_connections(max.max(0) as u32);
            }
            Ok(backend)
        })
        .collect()
}
