use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::{Backend, ReadWriteCount, Target};
use crate::health::CheckResult;
use crate::load_balancer::Balancer;
use crate::observability::metrics;
use crate::scheduler::state::{OpOutcome, Registry};
use crate::scheduler::{Message, OpAction};
use crate::stats::{BandwidthStats, StatsHandle};

/// Interval between backend pushes to the stats handler.
const BACKENDS_PUSH_INTERVAL: Duration = Duration::from_secs(2);

pub(crate) struct SchedulerActor {
    pub(crate) name: String,
    pub(crate) registry: Registry,
    pub(crate) balancer: Box<dyn Balancer>,
    pub(crate) mailbox: mpsc::UnboundedReceiver<Message>,
    pub(crate) discovered: mpsc::Receiver<Vec<Backend>>,
    pub(crate) checks: mpsc::Receiver<CheckResult>,
    pub(crate) bandwidth: mpsc::UnboundedReceiver<BandwidthStats>,
    pub(crate) health_targets: mpsc::UnboundedSender<Vec<Target>>,
    pub(crate) stats: StatsHandle,
    /// Parent of the discovery and healthcheck stop tokens.
    pub(crate) components: CancellationToken,
}

impl SchedulerActor {
    pub(crate) async fn run(mut self) {
        tracing::debug!(server = %self.name, "Scheduler starting");

        let mut push = time::interval_at(
            Instant::now() + BACKENDS_PUSH_INTERVAL,
            BACKENDS_PUSH_INTERVAL,
        );
        push.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.mailbox.recv() => match msg {
                    Some(Message::Stop) | None => break,
                    Some(msg) => self.handle(msg),
                },
                Some(snapshot) = self.discovered.recv() => self.on_discovery(snapshot),
                Some(result) = self.checks.recv() => self.on_check(result),
                Some(bw) = self.bandwidth.recv() => {
                    if let Some(backend) = self.registry.apply_bandwidth(&bw) {
                        metrics::report_backend(&self.name, backend);
                    }
                }
                _ = push.tick() => self.stats.backends(self.registry.backends()),
            }
        }

        self.shutdown();
    }

    fn handle(&mut self, msg: Message) {
        match msg {
            Message::Elect { ctx, reply } => {
                let result = self.registry.elect(self.balancer.as_mut(), &ctx);
                if let Err(e) = &result {
                    tracing::debug!(server = %self.name, client = %ctx.client_addr, error = %e, "Election failed");
                }
                let _ = reply.send(result);
            }
            Message::Backends { reply } => {
                let _ = reply.send(self.registry.backends());
            }
            Message::Op { target, action } => self.on_op(target, action),
            Message::Stop => {}
        }
    }

    fn on_op(&mut self, target: Target, action: OpAction) {
        let outcome = match action {
            OpAction::IncrementConnection => self.registry.increment_connection(&target),
            OpAction::DecrementConnection => self.registry.decrement_connection(&target),
            OpAction::IncrementRefused => self.registry.increment_refused(&target),
            OpAction::IncrementTx(n) => {
                self.stats.traffic(ReadWriteCount {
                    target,
                    count_read: 0,
                    count_write: n,
                });
                return;
            }
            OpAction::IncrementRx(n) => {
                self.stats.traffic(ReadWriteCount {
                    target,
                    count_read: n,
                    count_write: 0,
                });
                return;
            }
        };

        match outcome {
            OpOutcome::Untracked => {
                tracing::debug!(server = %self.name, target = %target, ?action, "Operation on unknown backend");
            }
            OpOutcome::Updated => {
                if let Some(backend) = self.registry.get(&target) {
                    metrics::report_backend(&self.name, backend);
                }
            }
            OpOutcome::Removed => {
                tracing::info!(server = %self.name, target = %target, "Drained backend removed");
                metrics::remove_backend(&self.name, &target);
                self.publish_targets();
            }
        }
    }

    fn on_discovery(&mut self, snapshot: Vec<Backend>) {
        let outcome = self.registry.apply_discovery(snapshot);
        if !outcome.is_structural() {
            return;
        }

        tracing::info!(
            server = %self.name,
            added = outcome.added.len(),
            removed = outcome.removed.len(),
            total = self.registry.len(),
            "Backends updated"
        );
        for target in &outcome.removed {
            metrics::remove_backend(&self.name, target);
        }
        for target in &outcome.added {
            if let Some(backend) = self.registry.get(target) {
                metrics::report_backend(&self.name, backend);
            }
        }
        self.publish_targets();
    }

    fn on_check(&mut self, result: CheckResult) {
        if !self.registry.apply_check_result(&result.target, result.live) {
            tracing::debug!(server = %self.name, target = %result.target, "Check result for unknown backend");
            return;
        }
        if result.live {
            tracing::info!(server = %self.name, target = %result.target, "Backend is up");
        } else {
            tracing::warn!(server = %self.name, target = %result.target, "Backend is down");
        }
        metrics::report_backend_live(&self.name, &result.target, result.live);
    }

    fn publish_targets(&self) {
        let targets = self.registry.targets();
        let _ = self.health_targets.send(targets.clone());
        self.stats.targets(targets);
    }

    fn shutdown(&mut self) {
        self.components.cancel();
        self.mailbox.close();
        let targets = self.registry.targets();
        metrics::remove_server(&self.name, &targets);
        tracing::info!(server = %self.name, "Scheduler stopped");
    }
}
