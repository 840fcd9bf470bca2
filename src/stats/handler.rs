//! Per-server statistics actor.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::{Backend, ReadWriteCount, Target};
use crate::observability::metrics;
use crate::stats::{BandwidthCounter, BandwidthStats};

/// Interval between rate computations.
pub const STATS_INTERVAL: Duration = Duration::from_secs(2);

/// Aggregated view of one server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    pub active_connections: u64,
    pub rx_total: u64,
    pub tx_total: u64,
    pub rx_second: u64,
    pub tx_second: u64,
    pub backends: Vec<Backend>,
}

#[derive(Debug)]
enum StatsEvent {
    Traffic(ReadWriteCount),
    Targets(Vec<Target>),
    Connections(u64),
    Backends(Vec<Backend>),
}

/// Cheap, cloneable input side of a [`StatsHandler`].
///
/// All methods are fire-and-forget; a stopped handler silently drops input.
#[derive(Debug, Clone)]
pub struct StatsHandle {
    tx: mpsc::UnboundedSender<StatsEvent>,
    latest: watch::Receiver<ServerStats>,
}

impl StatsHandle {
    pub fn traffic(&self, rw: ReadWriteCount) {
        if !rw.is_zero() {
            let _ = self.tx.send(StatsEvent::Traffic(rw));
        }
    }

    pub fn targets(&self, targets: Vec<Target>) {
        let _ = self.tx.send(StatsEvent::Targets(targets));
    }

    pub fn connections(&self, active: u64) {
        let _ = self.tx.send(StatsEvent::Connections(active));
    }

    pub fn backends(&self, backends: Vec<Backend>) {
        let _ = self.tx.send(StatsEvent::Backends(backends));
    }

    /// The most recently published server stats.
    pub fn snapshot(&self) -> ServerStats {
        self.latest.borrow().clone()
    }

    /// Watch channel of published server stats.
    pub fn subscribe(&self) -> watch::Receiver<ServerStats> {
        self.latest.clone()
    }
}

/// Owns the server-wide counter and one counter per tracked target.
pub struct StatsHandler {
    name: String,
    interval: Duration,
    server: BandwidthCounter,
    backends_counter: HashMap<Target, BandwidthCounter>,
    active_connections: u64,
    backends: Vec<Backend>,
    rx: mpsc::UnboundedReceiver<StatsEvent>,
    out: mpsc::UnboundedSender<BandwidthStats>,
    latest: watch::Sender<ServerStats>,
}

impl StatsHandler {
    /// Spawn the handler. Returns its input handle and the stream of
    /// per-target bandwidth snapshots meant for the scheduler.
    pub fn spawn(
        name: impl Into<String>,
        interval: Duration,
        stop: CancellationToken,
    ) -> (StatsHandle, mpsc::UnboundedReceiver<BandwidthStats>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (out, out_rx) = mpsc::unbounded_channel();
        let (latest, latest_rx) = watch::channel(ServerStats::default());

        let handler = StatsHandler {
            name: name.into(),
            interval,
            server: BandwidthCounter::new(),
            backends_counter: HashMap::new(),
            active_connections: 0,
            backends: Vec::new(),
            rx,
            out,
            latest,
        };
        tokio::spawn(handler.run(stop));

        (
            StatsHandle {
                tx,
                latest: latest_rx,
            },
            out_rx,
        )
    }

    async fn run(mut self, stop: CancellationToken) {
        tracing::debug!(server = %self.name, "Stats handler starting");

        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_tick = Instant::now();

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                event = self.rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                now = ticker.tick() => {
                    self.tick(now.duration_since(last_tick));
                    last_tick = now;
                }
            }
        }

        tracing::debug!(server = %self.name, "Stats handler stopped");
    }

    fn handle(&mut self, event: StatsEvent) {
        match event {
            StatsEvent::Traffic(rw) => {
                self.server.add(&rw);
                if let Some(counter) = self.backends_counter.get_mut(&rw.target) {
                    counter.add(&rw);
                }
            }
            StatsEvent::Targets(targets) => self.retarget(targets),
            StatsEvent::Connections(active) => self.active_connections = active,
            StatsEvent::Backends(backends) => self.backends = backends,
        }
    }

    fn retarget(&mut self, targets: Vec<Target>) {
        self.backends_counter.retain(|t, _| targets.contains(t));
        for target in targets {
            self.backends_counter.entry(target).or_default();
        }
    }

    fn tick(&mut self, elapsed: Duration) {
        for (target, counter) in &mut self.backends_counter {
            counter.tick(elapsed);
            let _ = self.out.send(counter.snapshot(Some(target.clone())));
        }

        self.server.tick(elapsed);
        let totals = self.server.snapshot(None);
        let stats = ServerStats {
            active_connections: self.active_connections,
            rx_total: totals.rx_total,
            tx_total: totals.tx_total,
            rx_second: totals.rx_second,
            tx_second: totals.tx_second,
            backends: self.backends.clone(),
        };
        metrics::report_server_stats(&self.name, &stats);
        self.latest.send_replace(stats);
    }
}
