//! Least Connections load balancing strategy.

use crate::core::{Backend, Context};
use crate::load_balancer::{BalanceError, Balancer};

/// Least connections selector.
/// Selects the backend with the minimum number of active connections.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl Balancer for LeastConnections {
    fn elect<'a>(
        &mut self,
        _ctx: &Context,
        backends: &[&'a Backend],
    ) -> Result<&'a Backend, BalanceError> {
        // In case of tie, the first one is selected
        backends
            .iter()
            .copied()
            .min_by_key(|b| b.stats.active_connections)
            .ok_or(BalanceError::BackendsEmpty)
    }
}
