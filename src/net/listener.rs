//! TCP listener.
//!
//! # Responsibilities
//! - Bind to the configured address
//! - Accept incoming TCP connections and label them
//! - Report accept errors without closing the listener

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};

use crate::net::connection::ConnectionId;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to accept: {0}")]
    Accept(#[source] std::io::Error),
}

/// A bound TCP listener.
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind to `address`.
    pub async fn bind(address: &str) -> Result<Self, ListenerError> {
        let bind_error = |source| ListenerError::Bind {
            address: address.to_string(),
            source,
        };
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| bind_error(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;

        let inner = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = inner.local_addr().map_err(bind_error)?;

        tracing::info!(address = %local_addr, "Listener bound");

        Ok(Self { inner, local_addr })
    }

    /// Accept a new connection and assign it an id.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionId), ListenerError> {
        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;
        let id = ConnectionId::new();

        tracing::debug!(
            connection_id = %id,
            peer_addr = %addr,
            "Connection accepted"
        );

        Ok((stream, addr, id))
    }

    /// Address actually bound, with the real port when `:0` was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_bound_port() {
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        assert_ne!(listener.local_addr().port(), 0);

        let client = TcpStream::connect(listener.local_addr());
        let (accepted, client) = tokio::join!(listener.accept(), client);
        let (_, peer, _) = accepted.unwrap();
        assert_eq!(peer, client.unwrap().local_addr().unwrap());
    }

    #[tokio::test]
    async fn rejects_unparsable_address() {
        let err = Listener::bind("not-an-address").await.err().unwrap();
        assert!(matches!(err, ListenerError::Bind { .. }));
        assert!(err.to_string().contains("not-an-address"));
    }
}
