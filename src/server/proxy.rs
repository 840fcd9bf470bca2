//! Bidirectional byte copier between a client and a backend.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::core::Target;
use crate::net::BoxedStream;
use crate::scheduler::SchedulerHandle;

pub const BUFFER_SIZE: usize = 16 * 1024;

/// How often buffered byte counts are pushed to the scheduler.
pub const STATS_PUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyOptions {
    /// Idle limit while reading from the client.
    pub client_idle: Option<Duration>,
    /// Idle limit while reading from the backend.
    pub backend_idle: Option<Duration>,
}

/// Why a proxied connection ended.
#[derive(Debug)]
pub enum ProxyEnd {
    ClientClosed,
    BackendClosed,
    /// The backend's liveness signal fired.
    BackendDown,
    Error(io::Error),
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    /// Client to backend.
    Tx,
    /// Backend to client.
    Rx,
}

/// Accumulates byte counts and flushes them at most once per interval.
/// Remaining bytes are flushed on drop.
struct TrafficMeter<'a> {
    scheduler: &'a SchedulerHandle,
    target: &'a Target,
    direction: Direction,
    pending: u64,
    last_flush: Instant,
}

impl<'a> TrafficMeter<'a> {
    fn new(scheduler: &'a SchedulerHandle, target: &'a Target, direction: Direction) -> Self {
        Self {
            scheduler,
            target,
            direction,
            pending: 0,
            last_flush: Instant::now(),
        }
    }

    fn add(&mut self, bytes: usize) {
        self.pending += bytes as u64;
        if self.last_flush.elapsed() >= STATS_PUSH_INTERVAL {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.pending > 0 {
            let _ = match self.direction {
                Direction::Tx => self.scheduler.increment_tx(self.target, self.pending),
                Direction::Rx => self.scheduler.increment_rx(self.target, self.pending),
            };
            self.pending = 0;
        }
        self.last_flush = Instant::now();
    }
}

impl Drop for TrafficMeter<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}

async fn copy_half<R, W>(
    mut from: R,
    mut to: W,
    idle: Option<Duration>,
    mut meter: TrafficMeter<'_>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = match idle {
            Some(limit) => time::timeout(limit, from.read(&mut buf))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "idle timeout"))??,
            None => from.read(&mut buf).await?,
        };
        if n == 0 {
            let _ = to.shutdown().await;
            return Ok(());
        }
        to.write_all(&buf[..n]).await?;
        meter.add(n);
    }
}

/// Copy in both directions until either side finishes, fails, idles out,
/// or `alive` is cancelled. Both streams are closed on return.
pub async fn proxy(
    client: BoxedStream,
    backend: BoxedStream,
    scheduler: &SchedulerHandle,
    target: &Target,
    opts: ProxyOptions,
    alive: Option<CancellationToken>,
) -> ProxyEnd {
    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = tokio::io::split(backend);

    let upstream = copy_half(
        client_read,
        backend_write,
        opts.client_idle,
        TrafficMeter::new(scheduler, target, Direction::Tx),
    );
    let downstream = copy_half(
        backend_read,
        client_write,
        opts.backend_idle,
        TrafficMeter::new(scheduler, target, Direction::Rx),
    );
    let backend_down = async {
        match &alive {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        r = upstream => match r {
            Ok(()) => ProxyEnd::ClientClosed,
            Err(e) => ProxyEnd::Error(e),
        },
        r = downstream => match r {
            Ok(()) => ProxyEnd::BackendClosed,
            Err(e) => ProxyEnd::Error(e),
        },
        _ = backend_down => ProxyEnd::BackendDown,
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;
    use crate::scheduler::test_util::{start, wait_for_backends};

    #[tokio::test]
    async fn copies_both_ways_until_client_closes() {
        let scheduler = start(&["127.0.0.1:1000"]);
        let target = wait_for_backends(&scheduler, 1).await[0].target.clone();

        let (client, mut client_peer) = duplex(1024);
        let (backend, mut backend_peer) = duplex(1024);

        let proxied = tokio::spawn({
            let scheduler = scheduler.clone();
            async move {
                proxy(
                    Box::new(client),
                    Box::new(backend),
                    &scheduler,
                    &target,
                    ProxyOptions::default(),
                    None,
                )
                .await
            }
        });

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        backend_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        backend_peer.write_all(b"pong").await.unwrap();
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client_peer);
        assert!(matches!(proxied.await.unwrap(), ProxyEnd::ClientClosed));
    }

    #[tokio::test]
    async fn idle_backend_times_out() {
        let scheduler = start(&["127.0.0.1:1000"]);
        let target = wait_for_backends(&scheduler, 1).await[0].target.clone();

        let (client, _client_peer) = duplex(64);
        let (backend, _backend_peer) = duplex(64);
        let opts = ProxyOptions {
            client_idle: None,
            backend_idle: Some(Duration::from_millis(50)),
        };

        let end = proxy(Box::new(client), Box::new(backend), &scheduler, &target, opts, None).await;
        match end {
            ProxyEnd::Error(e) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
            other => panic!("unexpected end {:?}", other),
        }
    }

    #[tokio::test]
    async fn liveness_signal_ends_proxy() {
        let scheduler = start(&["127.0.0.1:1000"]);
        let target = wait_for_backends(&scheduler, 1).await[0].target.clone();

        let (client, _client_peer) = duplex(64);
        let (backend, _backend_peer) = duplex(64);
        let alive = CancellationToken::new();
        alive.cancel();

        let end = proxy(
            Box::new(client),
            Box::new(backend),
            &scheduler,
            &target,
            ProxyOptions::default(),
            Some(alive),
        )
        .await;
        assert!(matches!(end, ProxyEnd::BackendDown));
    }
}
