//! netbalancer
//!
//! A TCP/UDP/TLS load balancer with pluggable discovery and health checks.
//!
//! # Architecture Overview
//!
//! ```text
//!                          ┌──────────────────────────────────────────────────┐
//!                          │                      SERVER                       │
//!   Client                 │  ┌──────────┐   ┌───────────┐   ┌─────────────┐   │
//!   ───────────────────────┼─▶│ listener │──▶│ access /  │──▶│  scheduler  │   │
//!                          │  │ tcp/udp  │   │ sni / tls │   │   (actor)   │   │
//!                          │  └──────────┘   └───────────┘   └──────┬──────┘   │
//!                          │                                        │          │
//!                          │        ┌───────────┐  ┌─────────────┐  │ elect    │
//!                          │        │ discovery │─▶│ healthcheck │──┤          │
//!                          │        └───────────┘  └─────────────┘  ▼          │
//!   ◀──────────────────────┼──────────────── proxy ◀──────────── backend ◀─────┼── Backend
//!                          │                                                   │
//!                          │   stats ─▶ metrics (Prometheus)   tracing logs     │
//!                          └──────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use netbalancer::config::load_config;
use netbalancer::lifecycle::{wait_for_signal, Manager, Shutdown};
use netbalancer::observability::{logging::init_logging, metrics::init_metrics};

#[derive(Debug, Parser)]
#[command(name = "netbalancer", version, about = "TCP/UDP/TLS load balancer")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Overrides `logging.level` from the configuration.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("netbalancer: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("netbalancer: failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        servers = config.servers.len(),
        "netbalancer starting"
    );

    if config.observability.metrics_enabled {
        let started = config
            .observability
            .metrics_address
            .parse::<SocketAddr>()
            .map_err(|e| e.to_string())
            .and_then(init_metrics);
        if let Err(e) = started {
            tracing::error!(error = %e, "Metrics exporter disabled");
        }
    }

    let manager = Manager::start(&config).await;
    if manager.is_empty() {
        tracing::error!("No server could be started");
        return ExitCode::FAILURE;
    }

    let shutdown = Shutdown::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(signal) => tracing::info!(?signal, "Shutdown signal received"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signals"),
        }
        trigger.trigger();
    });

    manager.run_until(shutdown).await;
    tracing::info!("netbalancer stopped");
    ExitCode::SUCCESS
}
