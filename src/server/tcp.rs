//! TCP and TLS server.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;

use crate::config::{BackendTlsConfig, Protocol, ServerConfig};
use crate::core::Context;
use crate::net::access::AccessPolicy;
use crate::net::connection::{ClientGuard, ConnectionId};
use crate::net::listener::Listener;
use crate::net::prefixed::PrefixedStream;
use crate::net::tls::{self, TlsError};
use crate::net::{proxy_protocol, sni, BoxedStream};
use crate::scheduler::{SchedulerError, SchedulerHandle};
use crate::server::proxy::{self, ProxyEnd, ProxyOptions};
use crate::server::{check_proxy_protocol, ServerCore, ServerError};
use crate::stats::{ServerStats, StatsHandle};

/// Pause after a failed accept, e.g. on file descriptor exhaustion.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
enum ConnectionError {
    #[error("client i/o: {0}")]
    Client(#[source] io::Error),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("dial {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Tls(#[from] TlsError),
}

struct BackendTls {
    connector: TlsConnector,
    cfg: BackendTlsConfig,
}

/// Per-connection settings shared by every client task.
struct Handler {
    name: String,
    scheduler: SchedulerHandle,
    sni_timeout: Option<Duration>,
    acceptor: Option<TlsAcceptor>,
    backend_tls: Option<BackendTls>,
    proxy_protocol: bool,
    connect_timeout: Option<Duration>,
    opts: ProxyOptions,
    close_on_failure: bool,
}

/// A running TCP or TLS server.
pub struct TcpServer {
    name: String,
    local_addr: SocketAddr,
    scheduler: SchedulerHandle,
    stats: StatsHandle,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl TcpServer {
    pub async fn start(name: &str, cfg: &ServerConfig) -> Result<Self, ServerError> {
        let acceptor = match (cfg.protocol, &cfg.tls) {
            (Protocol::Tls, Some(tls_cfg)) => Some(tls::build_acceptor(tls_cfg)?),
            (Protocol::Tls, None) => {
                return Err(ServerError::Config(
                    "protocol tls requires a [tls] section".to_string(),
                ))
            }
            _ => None,
        };
        let backend_tls = match &cfg.backends_tls {
            Some(btls) => Some(BackendTls {
                connector: tls::build_connector(btls)?,
                cfg: btls.clone(),
            }),
            None => None,
        };
        let access = cfg.access.as_ref().map(AccessPolicy::new).transpose()?;
        let proxy_protocol = check_proxy_protocol(cfg)?;

        let listener = Listener::bind(&cfg.bind).await?;
        let local_addr = listener.local_addr();

        let stop = CancellationToken::new();
        let core = ServerCore::start(name, cfg, &stop)?;

        let handler = Arc::new(Handler {
            name: name.to_string(),
            scheduler: core.scheduler.clone(),
            sni_timeout: cfg
                .sni
                .as_ref()
                .map(|s| Duration::from_millis(s.read_timeout_ms.max(1))),
            acceptor,
            backend_tls,
            proxy_protocol,
            connect_timeout: cfg.connection.backend_connection_timeout(),
            opts: ProxyOptions {
                client_idle: cfg.connection.client_idle_timeout(),
                backend_idle: cfg.connection.backend_idle_timeout(),
            },
            close_on_failure: cfg.close_on_failure,
        });

        let accept_loop = AcceptLoop {
            listener,
            handler,
            access,
            stats: core.stats.clone(),
            max_connections: cfg.connection.max_connections(),
            clients: HashMap::new(),
        };
        let task = tokio::spawn(accept_loop.run(stop.clone()));

        tracing::info!(server = %name, address = %local_addr, protocol = ?cfg.protocol, "Server started");

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

    /// Stop accepting, drop every client and stop the scheduler.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct AcceptLoop {
    listener: Listener,
    handler: Arc<Handler>,
    access: Option<AccessPolicy>,
    stats: StatsHandle,
    max_connections: Option<usize>,
    clients: HashMap<ConnectionId, AbortHandle>,
}

impl AcceptLoop {
    async fn run(mut self, stop: CancellationToken) {
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                Some(id) = closed_rx.recv() => {
                    self.clients.remove(&id);
                    self.stats.connections(self.clients.len() as u64);
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer, id)) => self.on_accept(stream, peer, id, &closed_tx),
                    Err(e) => {
                        tracing::warn!(server = %self.handler.name, error = %e, "Accept failed");
                        time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        for client in self.clients.values() {
            client.abort();
        }
        self.handler.scheduler.stop();
        tracing::info!(server = %self.handler.name, dropped = self.clients.len(), "Server stopped");
    }

    fn on_accept(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        id: ConnectionId,
        closed: &mpsc::UnboundedSender<ConnectionId>,
    ) {
        if let Some(access) = &self.access {
            if !access.allows(peer.ip()) {
                tracing::debug!(server = %self.handler.name, peer = %peer, "Client denied by access rules");
                return;
            }
        }

        if let Some(max) = self.max_connections {
            if self.clients.len() >= max {
                tracing::warn!(server = %self.handler.name, peer = %peer, max, "Too many connections");
                return;
            }
        }

        let guard = ClientGuard::new(id, closed.clone());
        let handler = self.handler.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            handler.handle(stream, peer, id).await;
        });
        self.clients.insert(id, task.abort_handle());
        self.stats.connections(self.clients.len() as u64);
    }
}

impl Handler {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr, id: ConnectionId) {
        if let Err(e) = self.serve(stream, peer, id).await {
            tracing::warn!(server = %self.name, connection_id = %id, peer = %peer, error = %e, "Closing client connection");
        }
    }

    async fn serve(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        id: ConnectionId,
    ) -> Result<(), ConnectionError> {
        let local = stream.local_addr().map_err(ConnectionError::Client)?;

        let mut sni_name = None;
        let mut client: BoxedStream = match self.sni_timeout {
            Some(timeout) => {
                let (name, prefix) = sni::sniff(&mut stream, timeout)
                    .await
                    .map_err(ConnectionError::Client)?;
                sni_name = name;
                Box::new(PrefixedStream::new(prefix, stream))
            }
            None => Box::new(stream),
        };

        if let Some(acceptor) = &self.acceptor {
            let tls = bounded(self.opts.client_idle, "tls handshake", acceptor.accept(client))
                .await
                .map_err(ConnectionError::Client)?;
            if sni_name.is_none() {
                sni_name = tls.get_ref().1.server_name().map(str::to_ascii_lowercase);
            }
            client = Box::new(tls);
        }

        let ctx = Context::new(peer).with_sni(sni_name);
        let elected = self.scheduler.take_backend(ctx).await?;
        let backend = &elected.backend;
        let target = &backend.target;

        let backend_stream = match self.dial(backend, peer, local).await {
            Ok(s) => s,
            Err(e) => {
                let _ = self.scheduler.increment_refused(target);
                return Err(e);
            }
        };

        let _guard = self.scheduler.connection_guard(target)?;
        tracing::debug!(server = %self.name, connection_id = %id, peer = %peer, backend = %target, "Proxying");

        let alive = self.close_on_failure.then(|| elected.alive.clone());
        let end = proxy::proxy(client, backend_stream, &self.scheduler, target, self.opts, alive).await;
        match end {
            ProxyEnd::Error(e) => {
                tracing::debug!(server = %self.name, connection_id = %id, backend = %target, error = %e, "Proxy ended with error")
            }
            ProxyEnd::BackendDown => {
                tracing::info!(server = %self.name, connection_id = %id, backend = %target, "Backend went down, connection closed")
            }
            ProxyEnd::ClientClosed | ProxyEnd::BackendClosed => {
                tracing::debug!(server = %self.name, connection_id = %id, backend = %target, end = ?end, "Proxy finished")
            }
        }
        Ok(())
    }

    async fn dial(
        &self,
        backend: &crate::core::Backend,
        peer: SocketAddr,
        local: SocketAddr,
    ) -> Result<BoxedStream, ConnectionError> {
        let address = backend.address();
        let dial_err = |source: io::Error| ConnectionError::Dial {
            target: address.clone(),
            source,
        };

        let connect = TcpStream::connect(address.as_str());
        let mut stream = bounded(self.connect_timeout, "connect", connect)
            .await
            .map_err(&dial_err)?;
        let _ = stream.set_nodelay(true);

        if self.proxy_protocol {
            let header = proxy_protocol::header_v1(peer, local);
            stream.write_all(header.as_bytes()).await.map_err(&dial_err)?;
        }

        match &self.backend_tls {
            Some(btls) => {
                let name = tls::server_name(&btls.cfg, backend.sni.as_deref(), &backend.target.host)?;
                let handshake = btls.connector.connect(name, stream);
                let tls_stream = bounded(self.connect_timeout, "backend tls handshake", handshake)
                    .await
                    .map_err(&dial_err)?;
                Ok(Box::new(tls_stream))
            }
            None => Ok(Box::new(stream)),
        }
    }
}

/// Run `fut` under `limit`; an elapsed limit is a `TimedOut` error naming `what`.
async fn bounded<F, T>(limit: Option<Duration>, what: &'static str, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => time::timeout(limit, fut).await.map_err(|_| {
            io::Error::new(io::ErrorKind::TimedOut, format!("{} timed out", what))
        })?,
        None => fut.await,
    }
}
