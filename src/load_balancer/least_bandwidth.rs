//! Least bandwidth load balancing strategy.

use crate::core::{Backend, Context};
use crate::load_balancer::{BalanceError, Balancer};

/// Selects the backend with the lowest `rx_second + tx_second`.
#[derive(Debug, Default)]
pub struct LeastBandwidth;

impl LeastBandwidth {
    pub fn new() -> Self {
        Self
    }
}

impl Balancer for LeastBandwidth {
    fn elect<'a>(
        &mut self,
        _ctx: &Context,
        backends: &[&'a Backend],
    ) -> Result<&'a Backend, BalanceError> {
        backends
            .iter()
            .copied()
            .min_by_key(|b| b.stats.rx_second.saturating_add(b.stats.tx_second))
            .ok_or(BalanceError::BackendsEmpty)
    }
}
