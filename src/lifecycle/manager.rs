//! Starts and stops every configured server.

use std::collections::BTreeMap;

use crate::config::ProxyConfig;
use crate::core::Backend;
use crate::lifecycle::Shutdown;
use crate::server::{Server, ServerError};
use crate::stats::ServerStats;

/// The set of running servers, keyed by name.
#[derive(Default)]
pub struct Manager {
    servers: BTreeMap<String, Server>,
    failed: BTreeMap<String, String>,
}

impl Manager {
    /// Start every server in `config`. Servers that fail to start are
    /// logged and recorded, the rest keep running.
    pub async fn start(config: &ProxyConfig) -> Self {
        let mut manager = Manager::default();
        for (name, cfg) in &config.servers {
            if let Err(e) = manager.start_server(name, cfg).await {
                tracing::error!(server = %name, error = %e, "Server failed to start");
                manager.failed.insert(name.clone(), e.to_string());
            }
        }

        tracing::info!(
            running = manager.servers.len(),
            failed = manager.failed.len(),
            "Servers started"
        );
        manager
    }

    async fn start_server(
        &mut self,
        name: &str,
        cfg: &crate::config::ServerConfig,
    ) -> Result<(), ServerError> {
        if self.servers.contains_key(name) {
            return Err(ServerError::Config(format!("server {} already running", name)));
        }
        let server = Server::start(name, cfg).await?;
        self.servers.insert(name.to_string(), server);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Server> {
        self.servers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }

    /// Servers that failed to start, with the reason.
    pub fn failed(&self) -> &BTreeMap<String, String> {
        &self.failed
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Latest published stats of a server.
    pub fn stats(&self, name: &str) -> Option<ServerStats> {
        self.servers.get(name).map(Server::stats)
    }

    /// Current backends of a server, straight from its scheduler.
    pub async fn backends(&self, name: &str) -> Option<Vec<Backend>> {
        let server = self.servers.get(name)?;
        server.scheduler().backends().await.ok()
    }

    /// Stop every server.
    pub fn stop_all(&self) {
        for (name, server) in &self.servers {
            tracing::info!(server = %name, "Stopping server");
            server.stop();
        }
    }

    /// Keep the servers running until `shutdown` is triggered, then stop them.
    pub async fn run_until(self, shutdown: Shutdown) {
        shutdown.triggered().await;
        self.stop_all();
    }
}
