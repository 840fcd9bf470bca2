//! Weighted random load balancing strategy.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core::{Backend, Context};
use crate::load_balancer::{BalanceError, Balancer};

/// Picks a backend with probability proportional to its weight.
#[derive(Debug)]
pub struct Weighted {
    rng: StdRng,
}

impl Weighted {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic selector for tests and reproducible runs.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for Weighted {
    fn default() -> Self {
        Self::new()
    }
}

impl Balancer for Weighted {
    fn elect<'a>(
        &mut self,
        _ctx: &Context,
        backends: &[&'a Backend],
    ) -> Result<&'a Backend, BalanceError> {
        pick_weighted(&mut self.rng, backends)
    }
}

/// Weighted draw over `backends`. Every weight must be positive.
pub(crate) fn pick_weighted<'a, R: Rng>(
    rng: &mut R,
    backends: &[&'a Backend],
) -> Result<&'a Backend, BalanceError> {
    if backends.is_empty() {
        return Err(BalanceError::BackendsEmpty);
    }

    let mut total: u64 = 0;
    for backend in backends {
        if backend.weight <= 0 {
            return Err(BalanceError::InvalidWeight);
        }
        total += backend.weight as u64;
    }

    let draw = rng.gen_range(0..total);
    let mut cumulative = 0u64;
    for backend in backends {
        cumulative += backend.weight as u64;
        if draw < cumulative {
            return Ok(*backend);
        }
    }

    // Unreachable while draw < total.
    Err(BalanceError::BackendsEmpty)
}
