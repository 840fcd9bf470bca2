//! Per-server backend scheduler.
//!
//! # Data Flow
//! ```text
//! Discovery ──snapshots──┐
//! Healthcheck ──results──┤
//! Stats ────bandwidth────┼──▶ scheduler loop (owns Registry) ──▶ elections
//! Servers ───mailbox─────┘                                  └──▶ targets → healthcheck, stats
//! ```
//!
//! The loop is the only writer of backend state. Servers talk to it
//! through a cloneable [`SchedulerHandle`]; once stopped, every request
//! fails with [`SchedulerError::Stopped`].

mod actor;
pub mod state;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::core::{Backend, Context, Target};
use crate::discovery::Discovery;
use crate::health::Healthcheck;
use crate::load_balancer::{BalanceError, Balancer};
use crate::stats::{BandwidthStats, StatsHandle};

pub use state::{Elected, Registry};

/// Capacity of the discovery and health result channels.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler stopped")]
    Stopped,
    #[error(transparent)]
    Elect(#[from] BalanceError),
}

/// Counter operation on one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpAction {
    IncrementConnection,
    DecrementConnection,
    IncrementRefused,
    IncrementTx(u64),
    IncrementRx(u64),
}

#[derive(Debug)]
pub(crate) enum Message {
    Elect {
        ctx: Context,
        reply: oneshot::Sender<Result<Elected, BalanceError>>,
    },
    Op {
        target: Target,
        action: OpAction,
    },
    Backends {
        reply: oneshot::Sender<Vec<Backend>>,
    },
    Stop,
}

/// Everything a scheduler needs before it can start.
pub struct Scheduler {
    name: String,
    balancer: Box<dyn Balancer>,
    discovery: Discovery,
    healthcheck: Healthcheck,
    stats: StatsHandle,
    bandwidth: mpsc::UnboundedReceiver<BandwidthStats>,
    close_on_failure: bool,
}

impl Scheduler {
    pub fn new(
        name: impl Into<String>,
        balancer: Box<dyn Balancer>,
        discovery: Discovery,
        healthcheck: Healthcheck,
        stats: StatsHandle,
        bandwidth: mpsc::UnboundedReceiver<BandwidthStats>,
    ) -> Self {
        Self {
            name: name.into(),
            balancer,
            discovery,
            healthcheck,
            stats,
            bandwidth,
            close_on_failure: false,
        }
    }

    /// Signal open connections when their backend fails or disappears.
    pub fn close_on_failure(mut self, enabled: bool) -> Self {
        self.close_on_failure = enabled;
        self
    }

    /// Spawn discovery, healthcheck and the scheduler loop.
    pub fn start(self) -> SchedulerHandle {
        let (tx, mailbox) = mpsc::unbounded_channel();
        let (discovered_tx, discovered) = mpsc::channel(CHANNEL_CAPACITY);
        let (checks_tx, checks) = mpsc::channel(CHANNEL_CAPACITY);
        let (targets_tx, targets_rx) = mpsc::unbounded_channel();

        let components = CancellationToken::new();
        self.discovery.spawn(discovered_tx, components.child_token());
        self.healthcheck
            .spawn(targets_rx, checks_tx, components.child_token());

        let name: Arc<str> = Arc::from(self.name.as_str());
        let actor = actor::SchedulerActor {
            name: self.name,
            registry: Registry::new(self.close_on_failure),
            balancer: self.balancer,
            mailbox,
            discovered,
            checks,
            bandwidth: self.bandwidth,
            health_targets: targets_tx,
            stats: self.stats,
            components,
        };
        tokio::spawn(actor.run());

        SchedulerHandle { name, tx }
    }
}

/// Cloneable entry point to a running scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Message>,
}

impl SchedulerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Elect a backend for `ctx`.
    pub async fn take_backend(&self, ctx: Context) -> Result<Elected, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Elect { ctx, reply })?;
        Ok(rx.await.map_err(|_| SchedulerError::Stopped)??)
    }

    /// Snapshot of every registered backend.
    pub async fn backends(&self) -> Result<Vec<Backend>, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Backends { reply })?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }

    pub fn op(&self, target: &Target, action: OpAction) -> Result<(), SchedulerError> {
        self.send(Message::Op {
            target: target.clone(),
            action,
        })
    }

    pub fn increment_connection(&self, target: &Target) -> Result<(), SchedulerError> {
        self.op(target, OpAction::IncrementConnection)
    }

    pub fn decrement_connection(&self, target: &Target) -> Result<(), SchedulerError> {
        self.op(target, OpAction::DecrementConnection)
    }

    pub fn increment_refused(&self, target: &Target) -> Result<(), SchedulerError> {
        self.op(target, OpAction::IncrementRefused)
    }

    /// Bytes received from the backend.
    pub fn increment_rx(&self, target: &Target, bytes: u64) -> Result<(), SchedulerError> {
        self.op(target, OpAction::IncrementRx(bytes))
    }

    /// Bytes sent to the backend.
    pub fn increment_tx(&self, target: &Target, bytes: u64) -> Result<(), SchedulerError> {
        self.op(target, OpAction::IncrementTx(bytes))
    }

    /// Count a connection for `target` until the returned guard drops.
    pub fn connection_guard(
        &self,
        target: &Target,
    ) -> Result<BackendConnectionGuard, SchedulerError> {
        self.increment_connection(target)?;
        Ok(BackendConnectionGuard {
            scheduler: self.clone(),
            target: target.clone(),
        })
    }

    /// Ask the loop to stop. Idempotent.
    pub fn stop(&self) {
        let _ = self.tx.send(Message::Stop);
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, msg: Message) -> Result<(), SchedulerError> {
        self.tx.send(msg).map_err(|_| SchedulerError::Stopped)
    }
}

/// Decrements the backend's active connections on drop.
#[derive(Debug)]
pub struct BackendConnectionGuard {
    scheduler: SchedulerHandle,
    target: Target,
}

impl BackendConnectionGuard {
    pub fn target(&self) -> &Target {
        &self.target
    }
}

impl Drop for BackendConnectionGuard {
    fn drop(&mut self) {
        let _ = self.scheduler.decrement_connection(&self.target);
    }
}
