//! Backend abstraction.
//!
//! # Responsibilities
//! - Carry the discovery-supplied knobs (priority, weight, sni, max connections)
//! - Carry runtime statistics owned by the scheduler
//! - Merge a fresh discovery copy into the registered instance

use serde::Serialize;

use crate::core::Target;

/// Runtime statistics of one backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackendStats {
    /// Health status, toggled only by health check results.
    pub live: bool,
    /// Present in the most recent discovery snapshot.
    pub discovered: bool,
    pub active_connections: u64,
    pub total_connections: u64,
    pub refused_connections: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_second: u64,
    pub tx_second: u64,
}

/// A single upstream server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Backend {
    pub target: Target,
    /// Lower value is preferred by the priority balancer.
    pub priority: i32,
    pub weight: i32,
    /// Hostname or pattern matched against the client SNI.
    pub sni: Option<String>,
    /// Upper bound on concurrent connections, 0 is unlimited.
    pub max_connections: u32,
    pub stats: BackendStats,
}

impl Backend {
    /// Create a backend with default knobs. New backends start live.
    pub fn new(target: Target) -> Self {
        Self {
            target,
            priority: 1,
            weight: 1,
            sni: None,
            max_connections: 0,
            stats: BackendStats {
                live: true,
                ..BackendStats::default()
            },
        }
    }

    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_sni(mut self, sni: impl Into<String>) -> Self {
        self.sni = Some(sni.into());
        self
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Copy discovery-owned properties from `other`, keeping runtime stats.
    pub fn merge_from(&mut self, other: &Backend) {
        self.priority = other.priority;
        self.weight = other.weight;
        self.sni = other.sni.clone();
        self.max_connections = other.max_connections;
    }

    /// True when a positive limit is set and reached.
    pub fn is_at_capacity(&self) -> bool {
        self.max_connections > 0 && self.stats.active_connections >= u64::from(self.max_connections)
    }

    pub fn address(&self) -> String {
        self.target.address()
    }
}
