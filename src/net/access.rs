//! Client access rules.
//!
//! Rules are evaluated in order and the first match decides; clients that
//! match nothing get the default verdict.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::config::schema::AccessConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    #[error("invalid access verdict {0:?}, expected allow or deny")]
    Verdict(String),
    #[error("invalid access rule {0:?}, expected \"allow|deny <ip or cidr>\"")]
    Rule(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AccessRule {
    allow: bool,
    network: IpNet,
}

/// Compiled allow / deny list.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    default_allow: bool,
    rules: Vec<AccessRule>,
}

fn verdict(word: &str) -> Option<bool> {
    match word {
        "allow" => Some(true),
        "deny" => Some(false),
        _ => None,
    }
}

impl AccessPolicy {
    pub fn new(cfg: &AccessConfig) -> Result<Self, AccessError> {
        let default_allow =
            verdict(cfg.default.trim()).ok_or_else(|| AccessError::Verdict(cfg.default.clone()))?;

        let rules = cfg
            .rules
            .iter()
            .map(|line| parse_rule(line))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            default_allow,
            rules,
        })
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        self.rules
            .iter()
            .find(|rule| rule.network.contains(&ip))
            .map_or(self.default_allow, |rule| rule.allow)
    }
}

fn parse_rule(line: &str) -> Result<AccessRule, AccessError> {
    let bad = || AccessError::Rule(line.to_string());
    let mut parts = line.split_whitespace();
    let allow = parts.next().and_then(verdict).ok_or_else(bad)?;
    let subject = parts.next().ok_or_else(bad)?;
    if parts.next().is_some() {
        return Err(bad());
    }

    let network = match subject.parse::<IpNet>() {
        Ok(net) => net,
        Err(_) => subject.parse::<IpAddr>().map(IpNet::from).map_err(|_| bad())?,
    };
    Ok(AccessRule { allow, network })
}
