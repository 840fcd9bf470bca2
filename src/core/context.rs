//! Per-client election context.

use std::net::{IpAddr, SocketAddr};

/// What a balancer may know about the client it is electing for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    pub client_addr: SocketAddr,
    /// Hostname from the TLS ClientHello, when it was sniffed.
    pub sni: Option<String>,
}

impl Context {
    pub fn new(client_addr: SocketAddr) -> Self {
        Self {
            client_addr,
            sni: None,
        }
    }

    pub fn with_sni(mut self, sni: Option<String>) -> Self {
        self.sni = sni.filter(|s| !s.is_empty());
        self
    }

    pub fn ip(&self) -> IpAddr {
        self.client_addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.client_addr.port()
    }

    /// Requested hostname, empty when none was presented.
    pub fn sni(&self) -> &str {
        self.sni.as_deref().unwrap_or("")
    }
}
