//! Round-robin load balancing strategy.

use crate::core::{Backend, Context};
use crate::load_balancer::{BalanceError, Balancer};

/// Round-robin selector.
/// Candidates are sorted by `host:port` before indexing, so the rotation
/// order does not depend on registry iteration order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    current: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Balancer for RoundRobin {
    fn elect<'a>(
        &mut self,
        _ctx: &Context,
        backends: &[&'a Backend],
    ) -> Result<&'a Backend, BalanceError> {
        if backends.is_empty() {
            return Err(BalanceError::BackendsEmpty);
        }

        let mut sorted = backends.to_vec();
        sorted.sort_by_cached_key(|b| b.target.to_string());

        // The set may have shrunk since the last call.
        if self.current >= sorted.len() {
            self.current = 0;
        }

        let backend = sorted[self.current];
        self.current += 1;
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_util::*;

    #[test]
    fn test_round_robin() {
        let mut lb = RoundRobin::new();
        let backends = vec![backend("127.0.0.1", "8081"), backend("127.0.0.1", "8080")];
        let ctx = ctx("10.0.0.1:5000");

        let s1 = lb.elect(&ctx, &refs(&backends)).unwrap();
        assert_eq!(s1.target.port, "8080");

        let s2 = lb.elect(&ctx, &refs(&backends)).unwrap();
        assert_eq!(s2.target.port, "8081");

        let s3 = lb.elect(&ctx, &refs(&backends)).unwrap();
        assert_eq!(s3.target.port, "8080");
    }

    #[test]
    fn visits_each_backend_once_per_cycle() {
        let mut lb = RoundRobin::new();
        let backends: Vec<_> = ["d", "b", "a", "c"].iter().map(|h| backend(h, "80")).collect();
        let ctx = ctx("10.0.0.1:5000");

        let picked: Vec<String> = (0..4)
            .map(|_| lb.elect(&ctx, &refs(&backends)).unwrap().target.host.clone())
            .collect();
        assert_eq!(picked, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn wraps_when_set_shrinks() {
        let mut lb = RoundRobin::new();
        let three: Vec<_> = ["a", "b", "c"].iter().map(|h| backend(h, "80")).collect();
        let ctx = ctx("10.0.0.1:5000");
        for _ in 0..3 {
            lb.elect(&ctx, &refs(&three)).unwrap();
        }

        let two: Vec<_> = ["a", "b"].iter().map(|h| backend(h, "80")).collect();
        let picked = lb.elect(&ctx, &refs(&two)).unwrap();
        assert_eq!(picked.target.host, "a");
    }

    #[test]
    fn sequential_elections_follow_address_order() {
        let mut lb = RoundRobin::new();
        let backends = vec![backend("A", "1001"), backend("A", "1000")];
        let ctx = ctx("10.0.0.1:5000");

        assert_eq!(lb.elect(&ctx, &refs(&backends)).unwrap().target.to_string(), "A:1000");
        assert_eq!(lb.elect(&ctx, &refs(&backends)).unwrap().target.to_string(), "A:1001");
    }
}
