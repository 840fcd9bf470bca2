//! Balancer decorators.
//!
//! Each middleware filters the candidate slice and delegates to the wrapped
//! balancer. The factory composes them as `SniFilter(MaxConnections(base))`.

pub mod max_conn;
pub mod sni;

pub use max_conn::MaxConnections;
pub use sni::SniFilter;
