//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (bind, accept, connection ids)
//!     → access.rs (allow / deny by client address)
//!     → sni.rs (peek ClientHello, replay through prefixed.rs)
//!     → tls.rs (optional TLS termination)
//!     → hand off to the proxy
//!
//! Outgoing backend connection
//!     → tls.rs (optional backend TLS)
//!     → proxy_protocol.rs (optional PROXY v1 header)
//! ```
//!
//! # Design Decisions
//! - Sniffed bytes are replayed, never consumed, so TLS handshakes see the full hello
//! - Access checks run before any election or dial
//! - All stream layers are boxed behind one `ProxyStream` trait object

pub mod access;
pub mod connection;
pub mod listener;
pub mod prefixed;
pub mod proxy_protocol;
pub mod sni;
pub mod tls;

use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional byte stream the proxy can relay.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

/// Boxed stream after optional sniffing and TLS layers.
pub type BoxedStream = Box<dyn ProxyStream>;
