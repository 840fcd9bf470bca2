//! Listening servers.
//!
//! # Data Flow
//! ```text
//! TCP / TLS (tcp.rs):
//!     accept → access → [SNI sniff] → [TLS accept] → elect → dial
//!     → [backend TLS] → [PROXY header] → proxy.rs copy loop
//!
//! UDP (udp/):
//!     recv_from → access → session per client address → backend socket
//!     single-packet mode: one request, optional reply, no session
//! ```
//!
//! Each server owns one scheduler, discovery, healthcheck and stats
//! handler. Stopping the server stops all of them.

pub mod proxy;
pub mod tcp;
pub mod udp;

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;

use crate::config::{Protocol, ServerConfig};
use crate::discovery::{Discovery, DiscoveryError};
use crate::health::Healthcheck;
use crate::load_balancer::build_balancer;
use crate::net::access::AccessError;
use crate::net::listener::ListenerError;
use crate::net::tls::TlsError;
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::stats::handler::STATS_INTERVAL;
use crate::stats::{ServerStats, StatsHandle, StatsHandler};

pub use tcp::TcpServer;
pub use udp::UdpServer;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("failed to bind udp {address}: {source}")]
    UdpBind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("tls: {0}")]
    Tls(#[from] TlsError),
    #[error("access: {0}")]
    Access(#[from] AccessError),
    #[error("discovery: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("{0}")]
    Config(String),
}

/// Scheduler and stats shared by both server kinds.
pub(crate) struct ServerCore {
    pub(crate) scheduler: SchedulerHandle,
    pub(crate) stats: StatsHandle,
}

impl ServerCore {
    /// Start discovery, healthcheck, stats and the scheduler. The stats
    /// handler stops with `stop`; the scheduler stops on request.
    pub(crate) fn start(
        name: &str,
        cfg: &ServerConfig,
        stop: &CancellationToken,
    ) -> Result<Self, ServerError> {
        let discovery = Discovery::new(cfg.discovery.clone())?;
        let healthcheck = Healthcheck::new(cfg.healthcheck.clone());
        let balancer = build_balancer(cfg.balance, cfg.sni.as_ref());
        let (stats, bandwidth) = StatsHandler::spawn(name, STATS_INTERVAL, stop.child_token());

        let scheduler = Scheduler::new(name, balancer, discovery, healthcheck, stats.clone(), bandwidth)
            .close_on_failure(cfg.close_on_failure)
            .start();

        Ok(Self { scheduler, stats })
    }
}

fn check_proxy_protocol(cfg: &ServerConfig) -> Result<bool, ServerError> {
    match &cfg.proxy_protocol {
        None => Ok(false),
        Some(pp) if pp.version.trim() == "1" => Ok(true),
        Some(pp) => Err(ServerError::Config(format!(
            "unsupported proxy_protocol version {:?}",
            pp.version
        ))),
    }
}

/// A running server of either protocol.
pub enum Server {
    Tcp(TcpServer),
    Udp(UdpServer),
}

impl Server {
    pub async fn start(name: &str, cfg: &ServerConfig) -> Result<Self, ServerError> {
        match cfg.protocol {
            Protocol::Tcp | Protocol::Tls => Ok(Server::Tcp(TcpServer::start(name, cfg).await?)),
            Protocol::Udp => Ok(Server::Udp(UdpServer::start(name, cfg).await?)),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Server::Tcp(s) => s.name(),
            Server::Udp(s) => s.name(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Server::Tcp(s) => s.local_addr(),
            Server::Udp(s) => s.local_addr(),
        }
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        match self {
            Server::Tcp(s) => s.scheduler(),
            Server::Udp(s) => s.scheduler(),
        }
    }

    pub fn stats(&self) -> ServerStats {
        match self {
            Server::Tcp(s) => s.stats(),
            Server::Udp(s) => s.stats(),
        }
    }

    pub fn stop(&self) {
        match self {
            Server::Tcp(s) => s.stop(),
            Server::Udp(s) => s.stop(),
        }
    }
}
