//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (gauges and counters per server and backend)
//!
//! Consumers:
//!     → stdout / stderr log stream
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Reporting functions never block and never fail the caller
//! - `RUST_LOG` overrides the configured log level
//! - Without an installed exporter the metric macros are no-ops

pub mod logging;
pub mod metrics;
