//! One UDP client flow pinned to one backend.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::core::Target;
use crate::scheduler::{BackendConnectionGuard, SchedulerHandle};

/// Largest UDP payload.
pub const UDP_PACKET_SIZE: usize = 65_507;

#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub client_idle: Option<Duration>,
    pub backend_idle: Option<Duration>,
    /// 0 is unlimited.
    pub max_requests: u64,
    /// 0 is unlimited.
    pub max_responses: u64,
    pub max_queue: usize,
}

/// Inputs for [`Session::start`].
pub struct SessionParts {
    pub client: SocketAddr,
    pub target: Target,
    /// Connected to the backend.
    pub backend: UdpSocket,
    /// The server socket replies are sent from.
    pub server: Arc<UdpSocket>,
    pub scheduler: SchedulerHandle,
    pub guard: BackendConnectionGuard,
    /// Backend liveness, when connections should close on failure.
    pub alive: Option<CancellationToken>,
    pub limits: SessionLimits,
}

/// Handle kept in the server's session map.
#[derive(Debug)]
pub struct Session {
    queue: mpsc::Sender<Bytes>,
    done: CancellationToken,
}

impl Session {
    /// Spawn the session. `done` is cancelled when the session ends for
    /// any reason; cancelling it from outside ends the session.
    pub fn start(parts: SessionParts, done: CancellationToken) -> Self {
        let (queue, rx) = mpsc::channel(parts.limits.max_queue.max(1));
        tokio::spawn(run(parts, rx, done.clone()));
        Self { queue, done }
    }

    /// Queue a packet for the backend. Dropped when the queue is full or
    /// the session is done.
    pub fn send(&self, packet: Bytes) -> bool {
        if self.is_done() {
            return false;
        }
        match self.queue.try_send(packet) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!("UDP session queue full, dropping packet");
                false
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }
}

async fn idle_or_forever(limit: Option<Duration>) {
    match limit {
        Some(d) => time::sleep(d).await,
        None => std::future::pending().await,
    }
}

async fn run(parts: SessionParts, rx: mpsc::Receiver<Bytes>, done: CancellationToken) {
    let SessionParts {
        client,
        target,
        backend,
        server,
        scheduler,
        guard,
        alive,
        limits,
    } = parts;

    let backend_down = async {
        match &alive {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = done.cancelled() => {}
        _ = backend_down => {
            tracing::debug!(client = %client, backend = %target, "Backend down, closing UDP session");
        }
        _ = forward(&backend, rx, &scheduler, &target, limits) => {}
        _ = relay(&backend, &server, client, &scheduler, &target, limits) => {}
    }

    done.cancel();
    drop(guard);
}

/// Client to backend. Ends on client idle timeout.
async fn forward(
    backend: &UdpSocket,
    mut rx: mpsc::Receiver<Bytes>,
    scheduler: &SchedulerHandle,
    target: &Target,
    limits: SessionLimits,
) {
    let mut sent: u64 = 0;
    loop {
        let packet = tokio::select! {
            packet = rx.recv() => match packet {
                Some(packet) => packet,
                None => return,
            },
            _ = idle_or_forever(limits.client_idle) => {
                tracing::trace!(backend = %target, "UDP session client idle");
                return;
            }
        };

        if limits.max_requests > 0 && sent >= limits.max_requests {
            tracing::debug!(backend = %target, max = limits.max_requests, "UDP request limit reached, dropping packet");
            continue;
        }

        match backend.send(&packet).await {
            Ok(n) => {
                sent += 1;
                let _ = scheduler.increment_tx(target, n as u64);
            }
            Err(e) => {
                tracing::warn!(backend = %target, error = %e, "Failed to send to backend");
                return;
            }
        }
    }
}

/// Backend to client through the server socket. Ends on backend idle
/// timeout or after `max_responses` replies.
async fn relay(
    backend: &UdpSocket,
    server: &UdpSocket,
    client: SocketAddr,
    scheduler: &SchedulerHandle,
    target: &Target,
    limits: SessionLimits,
) {
    let mut buf = vec![0u8; UDP_PACKET_SIZE];
    let mut responses: u64 = 0;
    loop {
        let n = tokio::select! {
            received = backend.recv(&mut buf) => match received {
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(backend = %target, error = %e, "Failed to receive from backend");
                    return;
                }
            },
            _ = idle_or_forever(limits.backend_idle) => {
                tracing::trace!(backend = %target, "UDP session backend idle");
                return;
            }
        };

        let _ = scheduler.increment_rx(target, n as u64);
        if let Err(e) = server.send_to(&buf[..n], client).await {
            tracing::warn!(client = %client, error = %e, "Failed to relay response to client");
            return;
        }

        responses += 1;
        if limits.max_responses > 0 && responses >= limits.max_responses {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::test_util::{start, wait_for_backends};

    fn limits() -> SessionLimits {
        SessionLimits {
            client_idle: None,
            backend_idle: None,
            max_requests: 0,
            max_responses: 0,
            max_queue: 16,
        }
    }

    struct Fixture {
        session: Session,
        done: CancellationToken,
        scheduler: SchedulerHandle,
        client: UdpSocket,
    }

    /// Start a session from a fresh client towards `backend_addr`.
    async fn open(backend_addr: SocketAddr, limits: SessionLimits) -> Fixture {
        let scheduler = start(&[&backend_addr.to_string()]);
        let backends = wait_for_backends(&scheduler, 1).await;
        let target = backends[0].target.clone();

        let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        backend.connect(backend_addr).await.unwrap();
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let parts = SessionParts {
            client: client.local_addr().unwrap(),
            target: target.clone(),
            backend,
            server,
            scheduler: scheduler.clone(),
            guard: scheduler.connection_guard(&target).unwrap(),
            alive: None,
            limits,
        };
        let done = CancellationToken::new();
        let session = Session::start(parts, done.clone());
        Fixture {
            session,
            done,
            scheduler,
            client,
        }
    }

    async fn wait_done(done: &CancellationToken) {
        time::timeout(Duration::from_secs(2), done.cancelled())
            .await
            .expect("session never finished");
    }

    async fn active_connections(scheduler: &SchedulerHandle) -> u64 {
        for _ in 0..100 {
            let backends = scheduler.backends().await.unwrap();
            if backends[0].stats.active_connections == 0 {
                return 0;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        scheduler.backends().await.unwrap()[0].stats.active_connections
    }

    #[tokio::test]
    async fn full_queue_drops_packet() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let f = open(
            silent.local_addr().unwrap(),
            SessionLimits {
                max_queue: 1,
                ..limits()
            },
        )
        .await;

        // The session task has not run yet, so nothing drains the queue.
        assert!(f.session.send(Bytes::from_static(b"one")));
        assert!(!f.session.send(Bytes::from_static(b"two")));
        assert!(!f.session.is_done());
    }

    #[tokio::test]
    async fn finished_session_refuses_packets() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let f = open(silent.local_addr().unwrap(), limits()).await;

        f.done.cancel();
        assert!(f.session.is_done());
        assert!(!f.session.send(Bytes::from_static(b"late")));
        assert_eq!(active_connections(&f.scheduler).await, 0);
    }

    #[tokio::test]
    async fn client_idle_ends_session_and_releases_backend() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let f = open(
            silent.local_addr().unwrap(),
            SessionLimits {
                client_idle: Some(Duration::from_millis(50)),
                ..limits()
            },
        )
        .await;

        let backends = f.scheduler.backends().await.unwrap();
        assert_eq!(backends[0].stats.active_connections, 1);

        wait_done(&f.done).await;
        assert!(f.session.is_done());
        assert_eq!(active_connections(&f.scheduler).await, 0);
    }

    #[tokio::test]
    async fn max_responses_ends_session() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            while let Ok((n, peer)) = echo.recv_from(&mut buf).await {
                // Two replies per request; only the first may reach the client.
                let _ = echo.send_to(&buf[..n], peer).await;
                let _ = echo.send_to(&buf[..n], peer).await;
            }
        });

        let f = open(
            echo_addr,
            SessionLimits {
                max_responses: 1,
                ..limits()
            },
        )
        .await;

        assert!(f.session.send(Bytes::from_static(b"ping")));

        let mut buf = [0u8; 64];
        let (n, _) = time::timeout(Duration::from_secs(2), f.client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"ping");

        wait_done(&f.done).await;
        assert!(!f.session.send(Bytes::from_static(b"again")));
        assert_eq!(active_connections(&f.scheduler).await, 0);

        let second = time::timeout(Duration::from_millis(100), f.client.recv_from(&mut buf)).await;
        assert!(second.is_err());
    }
}
