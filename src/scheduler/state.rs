//! Backend registry owned by the scheduler loop.
//!
//! Every method is synchronous and runs to completion inside one loop
//! iteration, so callers never observe a half-applied update.
//!
//! # Backend lifecycle
//! ```text
//! discovery reports new target ──▶ inserted (discovered, live)
//! each snapshot: all undiscovered → re-mark present ones → prune
//! undiscovered + 0 connections ──▶ removed
//! undiscovered + connections   ──▶ kept, not electable, removed on last decrement
//! ```

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::core::{Backend, Context, Target};
use crate::load_balancer::{BalanceError, Balancer};
use crate::stats::BandwidthStats;

/// An elected backend and its liveness signal.
#[derive(Debug, Clone)]
pub struct Elected {
    pub backend: Backend,
    /// Cancelled when the backend goes down or is force-closed.
    pub alive: CancellationToken,
}

/// Structural changes produced by one discovery snapshot.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DiscoveryOutcome {
    pub added: Vec<Target>,
    pub removed: Vec<Target>,
}

impl DiscoveryOutcome {
    /// True when targets were added or removed.
    pub fn is_structural(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// Result of a connection counter operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOutcome {
    /// The target is not in the registry.
    Untracked,
    Updated,
    /// The last connection of an undiscovered backend closed.
    Removed,
}

#[derive(Debug)]
struct Entry {
    backend: Backend,
    alive: CancellationToken,
}

impl Entry {
    fn new(backend: Backend) -> Self {
        let alive = CancellationToken::new();
        if !backend.stats.live {
            alive.cancel();
        }
        Self { backend, alive }
    }
}

/// The scheduler's backend map.
#[derive(Debug, Default)]
pub struct Registry {
    backends: HashMap<Target, Entry>,
    close_on_failure: bool,
}

impl Registry {
    pub fn new(close_on_failure: bool) -> Self {
        Self {
            backends: HashMap::new(),
            close_on_failure,
        }
    }

    /// Merge a full discovery snapshot.
    pub fn apply_discovery(&mut self, snapshot: Vec<Backend>) -> DiscoveryOutcome {
        let mut outcome = DiscoveryOutcome::default();

        for entry in self.backends.values_mut() {
            entry.backend.stats.discovered = false;
        }

        for mut backend in snapshot {
            if let Some(entry) = self.backends.get_mut(&backend.target) {
                entry.backend.merge_from(&backend);
                entry.backend.stats.discovered = true;
                if entry.backend.stats.live && entry.alive.is_cancelled() {
                    entry.alive = CancellationToken::new();
                }
                continue;
            }
            backend.stats.discovered = true;
            outcome.added.push(backend.target.clone());
            self.backends.insert(backend.target.clone(), Entry::new(backend));
        }

        let close_on_failure = self.close_on_failure;
        self.backends.retain(|target, entry| {
            let stats = &entry.backend.stats;
            if stats.discovered {
                return true;
            }
            if stats.active_connections > 0 {
                if close_on_failure && !entry.alive.is_cancelled() {
                    tracing::info!(
                        target = %target,
                        active = stats.active_connections,
                        "Closing connections of undiscovered backend"
                    );
                    entry.alive.cancel();
                }
                return true;
            }
            entry.alive.cancel();
            outcome.removed.push(target.clone());
            false
        });

        outcome
    }

    /// Apply a health check transition. Returns false for unknown targets.
    pub fn apply_check_result(&mut self, target: &Target, live: bool) -> bool {
        let Some(entry) = self.backends.get_mut(target) else {
            return false;
        };

        if entry.backend.stats.live != live {
            entry.backend.stats.live = live;
            if live {
                entry.alive = CancellationToken::new();
            } else {
                entry.alive.cancel();
            }
        }
        true
    }

    /// Copy bandwidth figures onto the backend.
    pub fn apply_bandwidth(&mut self, bw: &BandwidthStats) -> Option<&Backend> {
        let entry = self.backends.get_mut(bw.target.as_ref()?)?;
        let stats = &mut entry.backend.stats;
        stats.rx_bytes = bw.rx_total;
        stats.tx_bytes = bw.tx_total;
        stats.rx_second = bw.rx_second;
        stats.tx_second = bw.tx_second;
        Some(&entry.backend)
    }

    pub fn increment_connection(&mut self, target: &Target) -> OpOutcome {
        match self.backends.get_mut(target) {
            Some(entry) => {
                entry.backend.stats.active_connections += 1;
                entry.backend.stats.total_connections += 1;
                OpOutcome::Updated
            }
            None => OpOutcome::Untracked,
        }
    }

    pub fn increment_refused(&mut self, target: &Target) -> OpOutcome {
        match self.backends.get_mut(target) {
            Some(entry) => {
                entry.backend.stats.refused_connections += 1;
                OpOutcome::Updated
            }
            None => OpOutcome::Untracked,
        }
    }

    /// Decrement active connections, removing a drained undiscovered backend.
    pub fn decrement_connection(&mut self, target: &Target) -> OpOutcome {
        let Some(entry) = self.backends.get_mut(target) else {
            return OpOutcome::Untracked;
        };

        let stats = &mut entry.backend.stats;
        if stats.active_connections == 0 {
            tracing::warn!(target = %target, "Decrement on backend without active connections");
        }
        stats.active_connections = stats.active_connections.saturating_sub(1);

        if stats.active_connections == 0 && !stats.discovered {
            if let Some(entry) = self.backends.remove(target) {
                entry.alive.cancel();
            }
            return OpOutcome::Removed;
        }
        OpOutcome::Updated
    }

    /// Elect among live, discovered backends.
    pub fn elect(
        &self,
        balancer: &mut dyn Balancer,
        ctx: &Context,
    ) -> Result<Elected, BalanceError> {
        let candidates: Vec<&Backend> = self
            .backends
            .values()
            .map(|e| &e.backend)
            .filter(|b| b.stats.live && b.stats.discovered)
            .collect();

        let chosen = balancer.elect(ctx, &candidates)?;
        let alive = self
            .backends
            .get(&chosen.target)
            .map(|e| e.alive.clone())
            .unwrap_or_default();

        Ok(Elected {
            backend: chosen.clone(),
            alive,
        })
    }

    pub fn get(&self, target: &Target) -> Option<&Backend> {
        self.backends.get(target).map(|e| &e.backend)
    }

    pub fn targets(&self) -> Vec<Target> {
        let mut targets: Vec<Target> = self.backends.keys().cloned().collect();
        targets.sort();
        targets
    }

    /// Copies of every registered backend, sorted by target.
    pub fn backends(&self) -> Vec<Backend> {
        let mut backends: Vec<Backend> = self.backends.values().map(|e| e.backend.clone()).collect();
        backends.sort_by(|a, b| a.target.cmp(&b.target));
        backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::{LeastConnections, RoundRobin};

    fn b(host: &str) -> Backend {
        Backend::new(Target::new(host, "80"))
    }

    fn t(host: &str) -> Target {
        Target::new(host, "80")
    }

    fn ctx() -> Context {
        Context::new("10.0.0.1:5000".parse().unwrap())
    }

    #[test]
    fn new_backends_are_structural() {
        let mut reg = Registry::new(false);
        let outcome = reg.apply_discovery(vec![b("a"), b("b")]);
        assert_eq!(outcome.added, vec![t("a"), t("b")]);
        assert!(outcome.is_structural());

        let a = reg.get(&t("a")).unwrap();
        assert!(a.stats.live);
        assert!(a.stats.discovered);
    }

    #[test]
    fn identical_snapshot_is_not_structural() {
        let mut reg = Registry::new(false);
        reg.apply_discovery(vec![b("a"), b("b")]);
        let outcome = reg.apply_discovery(vec![b("b"), b("a")]);
        assert!(!outcome.is_structural());
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn rediscovery_merges_and_keeps_stats() {
        let mut reg = Registry::new(false);
        reg.apply_discovery(vec![b("a")]);
        reg.increment_connection(&t("a"));
        reg.increment_refused(&t("a"));

        reg.apply_discovery(vec![b("a").with_weight(9).with_priority(3)]);

        let a = reg.get(&t("a")).unwrap();
        assert_eq!(a.weight, 9);
        assert_eq!(a.priority, 3);
        assert_eq!(a.stats.active_connections, 1);
        assert_eq!(a.stats.total_connections, 1);
        assert_eq!(a.stats.refused_connections, 1);
    }

    #[test]
    fn idle_undiscovered_backend_is_pruned() {
        let mut reg = Registry::new(false);
        reg.apply_discovery(vec![b("a"), b("b")]);
        let outcome = reg.apply_discovery(vec![b("a")]);
        assert_eq!(outcome.removed, vec![t("b")]);
        assert!(reg.get(&t("b")).is_none());
    }

    #[test]
    fn busy_backend_drains_then_is_removed_once() {
        let mut reg = Registry::new(false);
        reg.apply_discovery(vec![b("a"), b("b")]);
        reg.increment_connection(&t("b"));
        reg.increment_connection(&t("b"));

        let outcome = reg.apply_discovery(vec![b("a")]);
        assert!(!outcome.is_structural());
        let drained = reg.get(&t("b")).unwrap();
        assert!(!drained.stats.discovered);

        // Present but never electable.
        let mut lb = LeastConnections::new();
        for _ in 0..5 {
            let elected = reg.elect(&mut lb, &ctx()).unwrap();
            assert_eq!(elected.backend.target, t("a"));
        }

        assert_eq!(reg.decrement_connection(&t("b")), OpOutcome::Updated);
        assert_eq!(reg.decrement_connection(&t("b")), OpOutcome::Removed);
        assert!(reg.get(&t("b")).is_none());
        assert_eq!(reg.decrement_connection(&t("b")), OpOutcome::Untracked);
    }

    #[test]
    fn discovered_backend_is_kept_at_zero() {
        let mut reg = Registry::new(false);
        reg.apply_discovery(vec![b("a")]);
        reg.increment_connection(&t("a"));
        assert_eq!(reg.decrement_connection(&t("a")), OpOutcome::Updated);
        assert!(reg.get(&t("a")).is_some());
    }

    #[test]
    fn decrement_never_underflows() {
        let mut reg = Registry::new(false);
        reg.apply_discovery(vec![b("a")]);
        assert_eq!(reg.decrement_connection(&t("a")), OpOutcome::Updated);
        assert_eq!(reg.get(&t("a")).unwrap().stats.active_connections, 0);
    }

    #[test]
    fn rediscovered_draining_backend_is_electable_again() {
        let mut reg = Registry::new(false);
        reg.apply_discovery(vec![b("a")]);
        reg.increment_connection(&t("a"));
        reg.apply_discovery(vec![]);
        assert!(reg.elect(&mut RoundRobin::new(), &ctx()).is_err());

        let outcome = reg.apply_discovery(vec![b("a")]);
        assert!(!outcome.is_structural());
        assert!(reg.elect(&mut RoundRobin::new(), &ctx()).is_ok());
    }

    #[test]
    fn health_results_toggle_liveness() {
        let mut reg = Registry::new(false);
        reg.apply_discovery(vec![b("a")]);
        let elected = reg.elect(&mut RoundRobin::new(), &ctx()).unwrap();
        assert!(!elected.alive.is_cancelled());

        assert!(reg.apply_check_result(&t("a"), false));
        assert!(elected.alive.is_cancelled());
        assert!(matches!(
            reg.elect(&mut RoundRobin::new(), &ctx()),
            Err(BalanceError::BackendsEmpty)
        ));

        assert!(reg.apply_check_result(&t("a"), true));
        let again = reg.elect(&mut RoundRobin::new(), &ctx()).unwrap();
        assert!(!again.alive.is_cancelled());
    }

    #[test]
    fn unknown_targets_are_ignored() {
        let mut reg = Registry::new(false);
        assert!(!reg.apply_check_result(&t("ghost"), false));
        assert_eq!(reg.increment_connection(&t("ghost")), OpOutcome::Untracked);
        assert_eq!(reg.increment_refused(&t("ghost")), OpOutcome::Untracked);
        let bw = BandwidthStats {
            target: Some(t("ghost")),
            ..BandwidthStats::default()
        };
        assert!(reg.apply_bandwidth(&bw).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn close_on_failure_cancels_drained_backends() {
        let mut reg = Registry::new(true);
        reg.apply_discovery(vec![b("a")]);
        reg.increment_connection(&t("a"));
        let elected = reg.elect(&mut RoundRobin::new(), &ctx()).unwrap();

        reg.apply_discovery(vec![]);
        assert!(elected.alive.is_cancelled());
        assert!(reg.get(&t("a")).is_some());
    }

    #[test]
    fn rediscovered_backend_gets_fresh_signal() {
        let mut reg = Registry::new(true);
        reg.apply_discovery(vec![b("a")]);
        reg.increment_connection(&t("a"));
        let draining = reg.elect(&mut RoundRobin::new(), &ctx()).unwrap();

        reg.apply_discovery(vec![]);
        reg.apply_discovery(vec![b("a")]);
        assert_eq!(reg.decrement_connection(&t("a")), OpOutcome::Updated);
        assert!(draining.alive.is_cancelled());

        let fresh = reg.elect(&mut RoundRobin::new(), &ctx()).unwrap();
        assert_eq!(fresh.backend.target, t("a"));
        assert!(!fresh.alive.is_cancelled());
    }

    #[test]
    fn rediscovered_dead_backend_keeps_cancelled_signal() {
        let mut reg = Registry::new(true);
        reg.apply_discovery(vec![b("a")]);
        reg.increment_connection(&t("a"));
        reg.apply_check_result(&t("a"), false);

        reg.apply_discovery(vec![]);
        reg.apply_discovery(vec![b("a")]);
        assert!(reg.backends[&t("a")].alive.is_cancelled());

        reg.apply_check_result(&t("a"), true);
        assert!(!reg.backends[&t("a")].alive.is_cancelled());
    }

    #[test]
    fn drain_without_close_on_failure_keeps_signal() {
        let mut reg = Registry::new(false);
        reg.apply_discovery(vec![b("a")]);
        reg.increment_connection(&t("a"));
        let elected = reg.elect(&mut RoundRobin::new(), &ctx()).unwrap();

        reg.apply_discovery(vec![]);
        assert!(!elected.alive.is_cancelled());
    }

    #[test]
    fn bandwidth_updates_backend() {
        let mut reg = Registry::new(false);
        reg.apply_discovery(vec![b("a")]);
        let bw = BandwidthStats {
            target: Some(t("a")),
            rx_total: 10,
            tx_total: 20,
            rx_second: 5,
            tx_second: 10,
        };
        let updated = reg.apply_bandwidth(&bw).unwrap();
        assert_eq!(updated.stats.rx_bytes, 10);
        assert_eq!(updated.stats.tx_second, 10);
    }

    #[test]
    fn targets_are_sorted() {
        let mut reg = Registry::new(false);
        reg.apply_discovery(vec![b("c"), b("a"), b("b")]);
        assert_eq!(reg.targets(), vec![t("a"), t("b"), t("c")]);
        let hosts: Vec<_> = reg.backends().into_iter().map(|b| b.target.host).collect();
        assert_eq!(hosts, vec!["a", "b", "c"]);
    }
}
