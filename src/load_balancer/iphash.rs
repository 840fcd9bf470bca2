//! Client address hashing strategies.
//!
//! `IpHash` maps a client to `hash(ip) % n` over the sorted candidates, which
//! reshuffles most clients whenever the backend set changes. `StableIpHash`
//! and `IpPortHash` use highest-random-weight hashing instead: every
//! candidate is scored with `hash(client || backend address)` and the top
//! score wins, so removing a backend only moves the clients it owned.

use std::hash::Hasher;
use std::net::IpAddr;

use fnv::FnvHasher;

use crate::core::{Backend, Context};
use crate::load_balancer::{BalanceError, Balancer};

fn ip_bytes(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// Simple modulo hash of the client IP.
#[derive(Debug, Default)]
pub struct IpHash;

impl IpHash {
    pub fn new() -> Self {
        Self
    }
}

impl Balancer for IpHash {
    fn elect<'a>(
        &mut self,
        ctx: &Context,
        backends: &[&'a Backend],
    ) -> Result<&'a Backend, BalanceError> {
        if backends.is_empty() {
            return Err(BalanceError::BackendsEmpty);
        }

        let mut sorted = backends.to_vec();
        sorted.sort_by_cached_key(|b| b.target.to_string());

        let mut hasher = FnvHasher::default();
        hasher.write(&ip_bytes(ctx.ip()));
        let index = (hasher.finish() % sorted.len() as u64) as usize;
        Ok(sorted[index])
    }
}

fn highest_random_weight<'a>(
    client_key: &[u8],
    backends: &[&'a Backend],
) -> Result<&'a Backend, BalanceError> {
    backends
        .iter()
        .copied()
        .map(|b| {
            let address = b.target.to_string();
            let mut hasher = FnvHasher::default();
            hasher.write(client_key);
            hasher.write(address.as_bytes());
            (hasher.finish(), address, b)
        })
        // Address breaks score ties so the result is order independent.
        .max_by(|(ha, aa, _), (hb, ab, _)| ha.cmp(hb).then_with(|| aa.cmp(ab)))
        .map(|(_, _, b)| b)
        .ok_or(BalanceError::BackendsEmpty)
}

/// Highest-random-weight hash over the client IP.
#[derive(Debug, Default)]
pub struct StableIpHash;

impl StableIpHash {
    pub fn new() -> Self {
        Self
    }
}

impl Balancer for StableIpHash {
    fn elect<'a>(
        &mut self,
        ctx: &Context,
        backends: &[&'a Backend],
    ) -> Result<&'a Backend, BalanceError> {
        highest_random_weight(&ip_bytes(ctx.ip()), backends)
    }
}

/// Highest-random-weight hash over client IP and port, for clients behind NAT.
#[derive(Debug, Default)]
pub struct IpPortHash;

impl IpPortHash {
    pub fn new() -> Self {
        Self
    }
}

impl Balancer for IpPortHash {
    fn elect<'a>(
        &mut self,
        ctx: &Context,
        backends: &[&'a Backend],
    ) -> Result<&'a Backend, BalanceError> {
        let mut key = ip_bytes(ctx.ip());
        key.extend_from_slice(&ctx.port().to_be_bytes());
        highest_random_weight(&key, backends)
    }
}
