//! SNI-aware candidate filtering.
//!
//! # Rules
//! ```text
//! client SNI empty:
//!     reject  → EmptySni
//!     any     → every candidate
//!     default → candidates without an SNI value
//! client SNI present:
//!     candidates whose SNI matches, if any
//!     otherwise: reject → UnmatchedSni, any → every candidate,
//!                default → candidates without an SNI value
//! ```

use std::collections::HashMap;

use regex::Regex;

use crate::config::schema::{HostnameMatching, SniConfig, UnexpectedHostname};
use crate::core::{Backend, Context};
use crate::load_balancer::{BalanceError, Balancer};

/// Filters candidates by the hostname the client asked for.
#[derive(Debug)]
pub struct SniFilter<B> {
    matching: HostnameMatching,
    unexpected: UnexpectedHostname,
    /// Compiled backend patterns, keyed by their source.
    patterns: HashMap<String, Regex>,
    inner: B,
}

impl<B: Balancer> SniFilter<B> {
    pub fn new(cfg: &SniConfig, inner: B) -> Self {
        Self {
            matching: cfg.hostname_matching_strategy,
            unexpected: cfg.unexpected_hostname_strategy,
            patterns: HashMap::new(),
            inner,
        }
    }

    fn matches(&mut self, requested: &str, pattern: &str) -> Result<bool, BalanceError> {
        match self.matching {
            HostnameMatching::Exact => Ok(requested.eq_ignore_ascii_case(pattern)),
            HostnameMatching::Regexp => {
                if !self.patterns.contains_key(pattern) {
                    let compiled = Regex::new(&format!("^(?:{})$", pattern)).map_err(|source| {
                        BalanceError::SniPattern {
                            pattern: pattern.to_string(),
                            source,
                        }
                    })?;
                    self.patterns.insert(pattern.to_string(), compiled);
                }
                Ok(self
                    .patterns
                    .get(pattern)
                    .is_some_and(|re| re.is_match(requested)))
            }
        }
    }

    fn fallback<'a>(
        &mut self,
        ctx: &Context,
        backends: &[&'a Backend],
        error: BalanceError,
    ) -> Result<&'a Backend, BalanceError> {
        match self.unexpected {
            UnexpectedHostname::Reject => Err(error),
            UnexpectedHostname::Any => self.inner.elect(ctx, backends),
            UnexpectedHostname::Default => {
                let plain: Vec<&'a Backend> = backends
                    .iter()
                    .copied()
                    .filter(|b| b.sni.as_deref().map_or(true, str::is_empty))
                    .collect();
                if plain.is_empty() {
                    return Err(error);
                }
                self.inner.elect(ctx, &plain)
            }
        }
    }
}

impl<B: Balancer> Balancer for SniFilter<B> {
    fn elect<'a>(
        &mut self,
        ctx: &Context,
        backends: &[&'a Backend],
    ) -> Result<&'a Backend, BalanceError> {
        let requested = ctx.sni();
        if requested.is_empty() {
            return self.fallback(ctx, backends, BalanceError::EmptySni);
        }

        let mut matched = Vec::with_capacity(backends.len());
        for backend in backends {
            let Some(pattern) = backend.sni.as_deref().filter(|p| !p.is_empty()) else {
                continue;
            };
            if self.matches(requested, pattern)? {
                matched.push(*backend);
            }
        }

        if !matched.is_empty() {
            return self.inner.elect(ctx, &matched);
        }

        self.fallback(ctx, backends, BalanceError::UnmatchedSni(requested.to_string()))
    }
}
