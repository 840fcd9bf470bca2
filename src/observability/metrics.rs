//! Metrics collection and exposition.
//!
//! # Metrics
//! - `netbalancer_server_active_connections` (gauge): current clients per server
//! - `netbalancer_server_rx_bytes_total` / `_tx_bytes_total` (gauge): server traffic
//! - `netbalancer_server_rx_bytes_per_second` / `_tx_bytes_per_second` (gauge)
//! - `netbalancer_backend_live` (gauge): 1=live, 0=dead
//! - `netbalancer_backend_active_connections` (gauge)
//! - `netbalancer_backend_total_connections` (gauge)
//! - `netbalancer_backend_refused_connections` (gauge)
//! - `netbalancer_backend_rx_bytes_total` / `_tx_bytes_total` (gauge)
//! - `netbalancer_backend_rx_bytes_per_second` / `_tx_bytes_per_second` (gauge)
//!
//! Backend totals are owned by the scheduler and exported as gauges, so a
//! removed backend is reported by zeroing its series.

use std::net::SocketAddr;

use metrics::gauge;
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::core::{Backend, Target};
use crate::stats::ServerStats;

pub const SERVER_ACTIVE_CONNECTIONS: &str = "netbalancer_server_active_connections";
pub const SERVER_RX_BYTES_TOTAL: &str = "netbalancer_server_rx_bytes_total";
pub const SERVER_TX_BYTES_TOTAL: &str = "netbalancer_server_tx_bytes_total";
pub const SERVER_RX_BYTES_PER_SECOND: &str = "netbalancer_server_rx_bytes_per_second";
pub const SERVER_TX_BYTES_PER_SECOND: &str = "netbalancer_server_tx_bytes_per_second";
pub const BACKEND_LIVE: &str = "netbalancer_backend_live";
pub const BACKEND_ACTIVE_CONNECTIONS: &str = "netbalancer_backend_active_connections";
pub const BACKEND_TOTAL_CONNECTIONS: &str = "netbalancer_backend_total_connections";
pub const BACKEND_REFUSED_CONNECTIONS: &str = "netbalancer_backend_refused_connections";
pub const BACKEND_RX_BYTES_TOTAL: &str = "netbalancer_backend_rx_bytes_total";
pub const BACKEND_TX_BYTES_TOTAL: &str = "netbalancer_backend_tx_bytes_total";
pub const BACKEND_RX_BYTES_PER_SECOND: &str = "netbalancer_backend_rx_bytes_per_second";
pub const BACKEND_TX_BYTES_PER_SECOND: &str = "netbalancer_backend_tx_bytes_per_second";

/// Start the Prometheus exporter on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install prometheus exporter: {}", e))?;

    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

/// Record a liveness transition.
#[inline]
pub fn report_backend_live(server: &str, target: &Target, live: bool) {
    gauge!(BACKEND_LIVE, "server" => server.to_owned(), "backend" => target.to_string())
        .set(if live { 1.0 } else { 0.0 });
}

/// Record every counter of one backend.
pub fn report_backend(server: &str, backend: &Backend) {
    let labels = [
        ("server", server.to_owned()),
        ("backend", backend.target.to_string()),
    ];
    let s = &backend.stats;
    gauge!(BACKEND_LIVE, &labels).set(if s.live { 1.0 } else { 0.0 });
    gauge!(BACKEND_ACTIVE_CONNECTIONS, &labels).set(s.active_connections as f64);
    gauge!(BACKEND_TOTAL_CONNECTIONS, &labels).set(s.total_connections as f64);
    gauge!(BACKEND_REFUSED_CONNECTIONS, &labels).set(s.refused_connections as f64);
    gauge!(BACKEND_RX_BYTES_TOTAL, &labels).set(s.rx_bytes as f64);
    gauge!(BACKEND_TX_BYTES_TOTAL, &labels).set(s.tx_bytes as f64);
    gauge!(BACKEND_RX_BYTES_PER_SECOND, &labels).set(s.rx_second as f64);
    gauge!(BACKEND_TX_BYTES_PER_SECOND, &labels).set(s.tx_second as f64);
}

/// Zero every series of a backend that left the registry.
pub fn remove_backend(server: &str, target: &Target) {
    let labels = [("server", server.to_owned()), ("backend", target.to_string())];
    for name in [
        BACKEND_LIVE,
        BACKEND_ACTIVE_CONNECTIONS,
        BACKEND_TOTAL_CONNECTIONS,
        BACKEND_REFUSED_CONNECTIONS,
        BACKEND_RX_BYTES_TOTAL,
        BACKEND_TX_BYTES_TOTAL,
        BACKEND_RX_BYTES_PER_SECOND,
        BACKEND_TX_BYTES_PER_SECOND,
    ] {
        gauge!(name, &labels).set(0.0);
    }
}

/// Record aggregated server traffic.
pub fn report_server_stats(server: &str, stats: &ServerStats) {
    let labels = [("server", server.to_owned())];
    gauge!(SERVER_ACTIVE_CONNECTIONS, &labels).set(stats.active_connections as f64);
    gauge!(SERVER_RX_BYTES_TOTAL, &labels).set(stats.rx_total as f64);
    gauge!(SERVER_TX_BYTES_TOTAL, &labels).set(stats.tx_total as f64);
    gauge!(SERVER_RX_BYTES_PER_SECOND, &labels).set(stats.rx_second as f64);
    gauge!(SERVER_TX_BYTES_PER_SECOND, &labels).set(stats.tx_second as f64);
}

/// Zero the series of a stopped server and all of its backends.
pub fn remove_server<'a>(server: &str, targets: impl IntoIterator<Item = &'a Target>) {
    report_server_stats(server, &ServerStats::default());
    for target in targets {
        remove_backend(server, target);
    }
}
