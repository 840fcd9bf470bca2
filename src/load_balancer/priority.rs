//! Priority-then-weight load balancing strategy.

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::core::{Backend, Context};
use crate::load_balancer::weight::pick_weighted;
use crate::load_balancer::{BalanceError, Balancer};

/// Restricts candidates to the lowest priority value, then draws by weight.
#[derive(Debug)]
pub struct Priority {
    rng: StdRng,
}

impl Priority {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::new()
    }
}

impl Balancer for Priority {
    fn elect<'a>(
        &mut self,
        _ctx: &Context,
        backends: &[&'a Backend],
    ) -> Result<&'a Backend, BalanceError> {
        let best = backends
            .iter()
            .map(|b| b.priority)
            .min()
            .ok_or(BalanceError::BackendsEmpty)?;

        let tier: Vec<&'a Backend> = backends
            .iter()
            .copied()
            .filter(|b| b.priority == best)
            .collect();

        pick_weighted(&mut self.rng, &tier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_util::*;

    #[test]
    fn never_leaves_best_tier() {
        let backends = vec![
            backend("primary-a", "1").with_priority(1).with_weight(1),
            backend("primary-b", "1").with_priority(1).with_weight(3),
            backend("standby", "1").with_priority(2).with_weight(100),
        ];
        let mut lb = Priority::with_seed(3);
        let ctx = ctx("10.0.0.1:5000");

        let mut seen_b = false;
        for _ in 0..5_000 {
            let picked = lb.elect(&ctx, &refs(&backends)).unwrap();
            assert_ne!(picked.target.host, "standby");
            seen_b |= picked.target.host == "primary-b";
        }
        assert!(seen_b);
    }

    #[test]
    fn falls_to_next_tier_when_alone() {
        let backends = vec![backend("standby", "1").with_priority(5)];
        let mut lb = Priority::with_seed(3);
        let picked = lb.elect(&ctx("10.0.0.1:5000"), &refs(&backends)).unwrap();
        assert_eq!(picked.target.host, "standby");
    }

    #[test]
    fn weight_is_validated_only_in_best_tier() {
        let backends = vec![
            backend("a", "1").with_priority(1).with_weight(0),
            backend("b", "1").with_priority(2).with_weight(1),
        ];
        let mut lb = Priority::with_seed(3);
        assert!(matches!(
            lb.elect(&ctx("10.0.0.1:5000"), &refs(&backends)),
            Err(BalanceError::InvalidWeight)
        ));
    }
}
