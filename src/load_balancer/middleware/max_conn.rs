//! Per-backend connection limit.

use crate::core::{Backend, Context};
use crate::load_balancer::{BalanceError, Balancer};

/// Drops candidates whose `active_connections` reached `max_connections`.
#[derive(Debug)]
pub struct MaxConnections<B> {
    inner: B,
}

impl<B: Balancer> MaxConnections<B> {
    pub fn new(inner: B) -> Self {
        Self { inner }
    }
}

impl<B: Balancer> Balancer for MaxConnections<B> {
    fn elect<'a>(
        &mut self,
        ctx: &Context,
        backends: &[&'a Backend],
    ) -> Result<&'a Backend, BalanceError> {
        if backends.is_empty() {
            return Err(BalanceError::BackendsEmpty);
        }

        let eligible: Vec<&'a Backend> = backends
            .iter()
            .copied()
            .filter(|b| {
                let full = b.is_at_capacity();
                if full {
                    tracing::debug!(
                        target = %b.target,
                        active = b.stats.active_connections,
                        max_connections = b.max_connections,
                        "Backend excluded: connection limit reached"
                    );
                }
                !full
            })
            .collect();

        if eligible.is_empty() {
            return Err(BalanceError::AllOverCapacity);
        }

        self.inner.elect(ctx, &eligible)
    }
}
