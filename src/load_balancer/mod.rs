//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Scheduler elect request
//!     → live + discovered candidates (&[&Backend])
//!     → middleware/sni.rs (filter by requested hostname)
//!     → middleware/max_conn.rs (drop backends at capacity)
//!     → strategy:
//!         - round_robin.rs (sorted rotation)
//!         - weight.rs / priority.rs (weighted random)
//!         - least_conn.rs / least_bandwidth.rs (linear scan)
//!         - iphash.rs (modulo or highest-random-weight hash)
//!     → one backend from the input slice, or BalanceError
//! ```
//!
//! # Design Decisions
//! - Balancers are pure: no I/O, they run inline in the scheduler loop
//! - `&mut self` lets strategies keep cursors and RNGs without locks
//! - Middleware order is fixed: SNI outermost, max-connections inside it

pub mod iphash;
pub mod least_bandwidth;
pub mod least_conn;
pub mod middleware;
pub mod priority;
pub mod round_robin;
pub mod weight;

use crate::config::schema::{BalanceKind, SniConfig};
use crate::core::{Backend, Context};

pub use iphash::{IpHash, IpPortHash, StableIpHash};
pub use least_bandwidth::LeastBandwidth;
pub use least_conn::LeastConnections;
pub use middleware::{MaxConnections, SniFilter};
pub use priority::Priority;
pub use round_robin::RoundRobin;
pub use weight::Weighted;

/// Reasons an election can fail. All of them are per-connection outcomes.
#[derive(Debug, thiserror::Error)]
pub enum BalanceError {
    #[error("backends empty")]
    BackendsEmpty,

    #[error("invalid backend weight")]
    InvalidWeight,

    #[error("all backends have reached max connections limit")]
    AllOverCapacity,

    #[error("rejecting client due to an empty sni")]
    EmptySni,

    #[error("rejecting client due to not matching sni [{0}]")]
    UnmatchedSni(String),

    #[error("invalid sni pattern {pattern:?}: {source}")]
    SniPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Picks one backend for a client.
pub trait Balancer: Send {
    /// Elect one backend from `backends`. The returned reference always
    /// points into the input slice.
    fn elect<'a>(
        &mut self,
        ctx: &Context,
        backends: &[&'a Backend],
    ) -> Result<&'a Backend, BalanceError>;
}

impl<B: Balancer + ?Sized> Balancer for Box<B> {
    fn elect<'a>(
        &mut self,
        ctx: &Context,
        backends: &[&'a Backend],
    ) -> Result<&'a Backend, BalanceError> {
        (**self).elect(ctx, backends)
    }
}

/// Build the configured strategy wrapped in its middleware.
pub fn build_balancer(kind: BalanceKind, sni: Option<&SniConfig>) -> Box<dyn Balancer> {
    let base: Box<dyn Balancer> = match kind {
        BalanceKind::Weight => Box::new(Weighted::new()),
        BalanceKind::Roundrobin => Box::new(RoundRobin::new()),
        BalanceKind::Priority => Box::new(Priority::new()),
        BalanceKind::Leastconn => Box::new(LeastConnections::new()),
        BalanceKind::Leastbandwidth => Box::new(LeastBandwidth::new()),
        BalanceKind::Iphash => Box::new(IpHash::new()),
        BalanceKind::Iphash1 => Box::new(StableIpHash::new()),
        BalanceKind::Ipporthash => Box::new(IpPortHash::new()),
    };

    let limited = MaxConnections::new(base);
    match sni {
        Some(cfg) => Box::new(SniFilter::new(cfg, limited)),
        None => Box::new(limited),
    }
}
