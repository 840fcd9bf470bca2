//! UDP server.
//!
//! The receive loop owns the session map. Packets from a known client go
//! to its session queue; the first packet from a new client elects a
//! backend and starts a session. A periodic sweep drops finished sessions.

pub mod session;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::core::{Context, Target};
use crate::net::access::AccessPolicy;
use crate::scheduler::{Elected, SchedulerHandle};
use crate::server::{ServerCore, ServerError};
use crate::stats::{ServerStats, StatsHandle};

pub use session::{Session, SessionLimits, SessionParts, UDP_PACKET_SIZE};

/// Interval between sweeps of finished sessions.
pub const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(2);

/// Reply wait in single-packet mode when no backend idle timeout is set.
const SINGLE_PACKET_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// A running UDP server.
pub struct UdpServer {
    name: String,
    local_addr: SocketAddr,
    scheduler: SchedulerHandle,
    stats: StatsHandle,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl UdpServer {
    pub async fn start(name: &str, cfg: &ServerConfig) -> Result<Self, ServerError> {
        let access = cfg.access.as_ref().map(AccessPolicy::new).transpose()?;

        let socket = UdpSocket::bind(cfg.bind.as_str())
            .await
            .map_err(|source| ServerError::UdpBind {
                address: cfg.bind.clone(),
                source,
            })?;
        let local_addr = socket.local_addr().map_err(|source| ServerError::UdpBind {
            address: cfg.bind.clone(),
            source,
        })?;

        let stop = CancellationToken::new();
        let core = ServerCore::start(name, cfg, &stop)?;

        let recv_loop = RecvLoop {
            name: name.to_string(),
            socket: Arc::new(socket),
            scheduler: core.scheduler.clone(),
            stats: core.stats.clone(),
            access,
            limits: SessionLimits {
                client_idle: cfg.connection.client_idle_timeout(),
                backend_idle: cfg.connection.backend_idle_timeout(),
                max_requests: cfg.udp.max_requests,
                max_responses: cfg.udp.max_responses,
                max_queue: cfg.udp.max_queue,
            },
            close_on_failure: cfg.close_on_failure,
            sessions: HashMap::new(),
        };
        let task = tokio::spawn(recv_loop.run(stop.clone()));

        tracing::info!(server = %name, address = %local_addr, protocol = "udp", "Server started");

        Ok(Self {
            name: name.to_string(),
            local_addr,
            scheduler: core.scheduler,
            stats: core.stats,
            stop,
            task,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub fn stats(&self) -> ServerStats {
        self.stats.snapshot()
    }

    /// Stop receiving, end every session and stop the scheduler.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct RecvLoop {
    name: String,
    socket: Arc<UdpSocket>,
    scheduler: SchedulerHandle,
    stats: StatsHandle,
    access: Option<AccessPolicy>,
    limits: SessionLimits,
    close_on_failure: bool,
    sessions: HashMap<SocketAddr, Session>,
}

impl RecvLoop {
    fn single_packet(&self) -> bool {
        self.limits.max_requests == 1
    }

    async fn run(mut self, stop: CancellationToken) {
        let mut sweep = time::interval(SESSION_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; UDP_PACKET_SIZE];

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = sweep.tick() => {
                    self.sweep();
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((n, client)) => {
                        let packet = Bytes::copy_from_slice(&buf[..n]);
                        self.on_packet(client, packet, &stop).await;
                    }
                    Err(e) => {
                        tracing::debug!(server = %self.name, error = %e, "UDP receive failed");
                    }
                },
            }
        }

        self.sessions.clear();
        self.scheduler.stop();
        tracing::info!(server = %self.name, "Server stopped");
    }

    /// Drop finished sessions and report how many remain.
    fn sweep(&mut self) -> usize {
        self.sessions.retain(|_, session| !session.is_done());
        let remaining = self.sessions.len();
        self.stats.connections(remaining as u64);
        remaining
    }

    async fn on_packet(&mut self, client: SocketAddr, packet: Bytes, stop: &CancellationToken) {
        if let Some(access) = &self.access {
            if !access.allows(client.ip()) {
                tracing::debug!(server = %self.name, client = %client, "Client denied by access rules");
                return;
            }
        }

        if self.single_packet() {
            self.spawn_single_packet(client, packet);
            return;
        }

        if let Some(session) = self.sessions.get(&client) {
            if !session.is_done() {
                session.send(packet);
                return;
            }
        }

        let Some(session) = self.open_session(client, stop).await else {
            return;
        };
        session.send(packet);
        self.sessions.insert(client, session);
        self.stats.connections(self.sessions.len() as u64);
    }

    async fn open_session(&self, client: SocketAddr, stop: &CancellationToken) -> Option<Session> {
        let (elected, backend) = elect_backend(&self.scheduler, &self.name, client).await?;
        let target = elected.backend.target.clone();
        let guard = self.scheduler.connection_guard(&target).ok()?;

        tracing::debug!(server = %self.name, client = %client, backend = %target, "UDP session opened");
        let parts = SessionParts {
            client,
            target,
            backend,
            server: self.socket.clone(),
            scheduler: self.scheduler.clone(),
            guard,
            alive: self.close_on_failure.then_some(elected.alive),
            limits: self.limits,
        };
        Some(Session::start(parts, stop.child_token()))
    }

    /// One request, at most one reply, no session bookkeeping.
    fn spawn_single_packet(&self, client: SocketAddr, packet: Bytes) {
        let scheduler = self.scheduler.clone();
        let server = self.socket.clone();
        let name = self.name.clone();
        let limits = self.limits;

        tokio::spawn(async move {
            let Some((elected, backend)) = elect_backend(&scheduler, &name, client).await else {
                return;
            };
            let target = elected.backend.target;
            let Ok(_guard) = scheduler.connection_guard(&target) else {
                return;
            };

            match backend.send(&packet).await {
                Ok(n) => {
                    let _ = scheduler.increment_tx(&target, n as u64);
                }
                Err(e) => {
                    tracing::warn!(server = %name, backend = %target, error = %e, "Failed to send to backend");
                    return;
                }
            }

            if limits.max_responses == 0 {
                return;
            }

            let wait = limits.backend_idle.unwrap_or(SINGLE_PACKET_REPLY_TIMEOUT);
            let mut buf = vec![0u8; UDP_PACKET_SIZE];
            match time::timeout(wait, backend.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    let _ = scheduler.increment_rx(&target, n as u64);
                    if let Err(e) = server.send_to(&buf[..n], client).await {
                        tracing::warn!(server = %name, client = %client, error = %e, "Failed to relay response to client");
                    }
                }
                Ok(Err(e)) => {
                    tracing::debug!(server = %name, backend = %target, error = %e, "Failed to receive from backend");
                }
                Err(_) => {
                    tracing::debug!(server = %name, backend = %target, "No reply from backend");
                }
            }
        });
    }
}

async fn elect_backend(
    scheduler: &SchedulerHandle,
    name: &str,
    client: SocketAddr,
) -> Option<(Elected, UdpSocket)> {
    let elected = match scheduler.take_backend(Context::new(client)).await {
        Ok(elected) => elected,
        Err(e) => {
            tracing::warn!(server = %name, client = %client, error = %e, "No backend for UDP client");
            return None;
        }
    };

    let target = &elected.backend.target;
    match connect_backend(target).await {
        Ok(socket) => Some((elected, socket)),
        Err(e) => {
            let _ = scheduler.increment_refused(target);
            tracing::warn!(server = %name, backend = %target, error = %e, "Failed to reach UDP backend");
            None
        }
    }
}

/// Bind an ephemeral socket and connect it to `target`.
async fn connect_backend(target: &Target) -> std::io::Result<UdpSocket> {
    let remote = tokio::net::lookup_host(target.address())
        .await?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "backend address did not resolve"))?;
    let local = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(remote).await?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::test_util::{start, wait_for_backends};
    use crate::stats::StatsHandler;

    #[tokio::test]
    async fn sweep_drops_finished_sessions() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = silent.local_addr().unwrap();
        let scheduler = start(&[&backend_addr.to_string()]);
        let backends = wait_for_backends(&scheduler, 1).await;
        let target = backends[0].target.clone();

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (stats, _bandwidth) =
            StatsHandler::spawn("sweep", Duration::from_millis(20), CancellationToken::new());
        let limits = SessionLimits {
            client_idle: None,
            backend_idle: None,
            max_requests: 0,
            max_responses: 0,
            max_queue: 4,
        };

        let mut recv_loop = RecvLoop {
            name: "sweep".to_string(),
            socket: socket.clone(),
            scheduler: scheduler.clone(),
            stats: stats.clone(),
            access: None,
            limits,
            close_on_failure: false,
            sessions: HashMap::new(),
        };

        let mut done = Vec::new();
        for port in [40001u16, 40002] {
            let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            backend.connect(backend_addr).await.unwrap();
            let client: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
            let token = CancellationToken::new();
            let parts = SessionParts {
                client,
                target: target.clone(),
                backend,
                server: socket.clone(),
                scheduler: scheduler.clone(),
                guard: scheduler.connection_guard(&target).unwrap(),
                alive: None,
                limits,
            };
            recv_loop.sessions.insert(client, Session::start(parts, token.clone()));
            done.push(token);
        }
        assert_eq!(recv_loop.sweep(), 2);

        done[0].cancel();
        assert_eq!(recv_loop.sweep(), 1);
        assert!(recv_loop.sessions.contains_key(&"127.0.0.1:40002".parse().unwrap()));

        for _ in 0..100 {
            if recv_loop.stats.snapshot().active_connections == 1 {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stats.snapshot().active_connections, 1);

        done[1].cancel();
        assert_eq!(recv_loop.sweep(), 0);
        assert!(recv_loop.sessions.is_empty());
    }
}
