//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! scheduler ──target list──▶ Healthcheck (one worker per target)
//! worker: tick → check under timeout → LivenessTracker
//!         → CheckResult on transitions only ──▶ scheduler
//! ```
//!
//! Workers start live, matching how the scheduler registers new backends.

pub mod active;
pub mod state;

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::HealthcheckConfig;
use crate::core::Target;

pub use active::{Check, Outcome};
pub use state::LivenessTracker;

/// A liveness transition of one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub target: Target,
    pub live: bool,
}

/// Per-server healthcheck supervisor.
#[derive(Debug, Clone)]
pub struct Healthcheck {
    check: Option<Check>,
    interval: Duration,
    timeout: Duration,
    passes: u32,
    fails: u32,
}

impl Healthcheck {
    pub fn new(cfg: HealthcheckConfig) -> Self {
        Self {
            check: Check::from_kind(&cfg.kind),
            interval: Duration::from_millis(cfg.interval_ms.max(1)),
            timeout: Duration::from_millis(cfg.timeout_ms.max(1)),
            passes: cfg.passes,
            fails: cfg.fails,
        }
    }

    /// Follow target lists from `targets` and report transitions on `out`.
    pub fn spawn(
        self,
        targets: mpsc::UnboundedReceiver<Vec<Target>>,
        out: mpsc::Sender<CheckResult>,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(targets, out, stop))
    }

    async fn run(
        self,
        mut targets: mpsc::UnboundedReceiver<Vec<Target>>,
        out: mpsc::Sender<CheckResult>,
        stop: CancellationToken,
    ) {
        let Some(check) = self.check.clone() else {
            tracing::debug!("Healthcheck disabled");
            return;
        };

        let mut workers: HashMap<Target, CancellationToken> = HashMap::new();

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                list = targets.recv() => match list {
                    Some(list) => self.update_workers(&check, &mut workers, list, &out, &stop),
                    None => break,
                },
            }
        }

        for token in workers.values() {
            token.cancel();
        }
        tracing::debug!(check = check.name(), "Healthcheck stopped");
    }

    fn update_workers(
        &self,
        check: &Check,
        workers: &mut HashMap<Target, CancellationToken>,
        list: Vec<Target>,
        out: &mpsc::Sender<CheckResult>,
        stop: &CancellationToken,
    ) {
        workers.retain(|target, token| {
            let keep = list.contains(target);
            if !keep {
                token.cancel();
            }
            keep
        });

        for target in list {
            if workers.contains_key(&target) {
                continue;
            }
            let token = stop.child_token();
            let worker = Worker {
                target: target.clone(),
                check: check.clone(),
                interval: self.interval,
                timeout: self.timeout,
                tracker: LivenessTracker::new(self.passes, self.fails),
                out: out.clone(),
            };
            tokio::spawn(worker.run(token.clone()));
            workers.insert(target, token);
        }
    }
}

struct Worker {
    target: Target,
    check: Check,
    interval: Duration,
    timeout: Duration,
    tracker: LivenessTracker,
    out: mpsc::Sender<CheckResult>,
}

impl Worker {
    async fn run(mut self, stop: CancellationToken) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                _ = stop.cancelled() => return,
                outcome = self.check.run(&self.target, self.timeout) => outcome,
            };

            let success = match outcome {
                Outcome::Pass => true,
                Outcome::Fail(reason) => {
                    tracing::debug!(target = %self.target, check = self.check.name(), reason = %reason, "Check failed");
                    false
                }
                Outcome::Unknown(reason) => {
                    tracing::warn!(target = %self.target, check = self.check.name(), reason = %reason, "Check inconclusive");
                    continue;
                }
            };

            if let Some(live) = self.tracker.record(success) {
                let result = CheckResult {
                    target: self.target.clone(),
                    live,
                };
                if self.out.send(result).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthcheckKind;
    use tokio::net::TcpListener;

    fn config() -> HealthcheckConfig {
        HealthcheckConfig {
            kind: HealthcheckKind::Ping,
            interval_ms: 20,
            timeout_ms: 200,
            passes: 1,
            fails: 1,
        }
    }

    async fn recv(rx: &mut mpsc::Receiver<CheckResult>) -> CheckResult {
        time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no check result")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn reports_only_transitions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = Target::new("127.0.0.1", port.to_string());

        let (targets_tx, targets_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let stop = CancellationToken::new();
        let handle = Healthcheck::new(config()).spawn(targets_rx, out_tx, stop.clone());

        targets_tx.send(vec![target.clone()]).unwrap();

        // Live backend: several passing checks, nothing reported.
        let quiet = time::timeout(Duration::from_millis(100), out_rx.recv()).await;
        assert!(quiet.is_err());

        drop(listener);
        let down = recv(&mut out_rx).await;
        assert_eq!(down, CheckResult { target: target.clone(), live: false });

        let _listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let up = recv(&mut out_rx).await;
        assert_eq!(up, CheckResult { target, live: true });

        stop.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn removed_targets_stop_reporting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let target = Target::new("127.0.0.1", port.to_string());

        let (targets_tx, targets_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let stop = CancellationToken::new();
        Healthcheck::new(config()).spawn(targets_rx, out_tx, stop.clone());

        targets_tx.send(vec![target]).unwrap();
        assert!(!recv(&mut out_rx).await.live);

        targets_tx.send(vec![]).unwrap();
        let quiet = time::timeout(Duration::from_millis(150), out_rx.recv()).await;
        assert!(quiet.is_err());
        stop.cancel();
    }

    #[tokio::test]
    async fn none_kind_exits_immediately() {
        let (_targets_tx, targets_rx) = mpsc::unbounded_channel();
        let (out_tx, _out_rx) = mpsc::channel(1);
        let handle = Healthcheck::new(HealthcheckConfig::default()).spawn(
            targets_rx,
            out_tx,
            CancellationToken::new(),
        );
        handle.await.unwrap();
    }
}
