//! Rolling bandwidth counter.

use std::time::Duration;

use crate::core::{ReadWriteCount, Target};

/// Totals and per-second rates of one counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BandwidthStats {
    /// `None` for the server-wide counter.
    pub target: Option<Target>,
    pub rx_total: u64,
    pub tx_total: u64,
    pub rx_second: u64,
    pub tx_second: u64,
}

/// Accumulates traffic deltas and turns them into rates on each tick.
#[derive(Debug, Clone, Default)]
pub struct BandwidthCounter {
    rx_total: u64,
    tx_total: u64,
    rx_at_tick: u64,
    tx_at_tick: u64,
    rx_second: u64,
    tx_second: u64,
}

impl BandwidthCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, rw: &ReadWriteCount) {
        self.rx_total = self.rx_total.saturating_add(rw.count_read);
        self.tx_total = self.tx_total.saturating_add(rw.count_write);
    }

    /// Close the current interval and recompute rates.
    pub fn tick(&mut self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return;
        }
        self.rx_second = ((self.rx_total - self.rx_at_tick) as f64 / secs) as u64;
        self.tx_second = ((self.tx_total - self.tx_at_tick) as f64 / secs) as u64;
        self.rx_at_tick = self.rx_total;
        self.tx_at_tick = self.tx_total;
    }

    pub fn snapshot(&self, target: Option<Target>) -> BandwidthStats {
        BandwidthStats {
            target,
            rx_total: self.rx_total,
            tx_total: self.tx_total,
            rx_second: self.rx_second,
            tx_second: self.tx_second,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rw(read: u64, write: u64) -> ReadWriteCount {
        ReadWriteCount {
            target: Target::new("a", "1"),
            count_read: read,
            count_write: write,
        }
    }

    #[test]
    fn rates_are_delta_over_interval() {
        let mut c = BandwidthCounter::new();
        c.add(&rw(4_000, 1_000));
        c.tick(Duration::from_secs(2));

        let s = c.snapshot(None);
        assert_eq!(s.rx_total, 4_000);
        assert_eq!(s.tx_total, 1_000);
        assert_eq!(s.rx_second, 2_000);
        assert_eq!(s.tx_second, 500);

        c.add(&rw(1_000, 0));
        c.tick(Duration::from_secs(2));
        let s = c.snapshot(None);
        assert_eq!(s.rx_total, 5_000);
        assert_eq!(s.rx_second, 500);
        assert_eq!(s.tx_second, 0);
    }

    #[test]
    fn zero_interval_keeps_rates() {
        let mut c = BandwidthCounter::new();
        c.add(&rw(10, 10));
        c.tick(Duration::from_secs(1));
        c.add(&rw(10, 10));
        c.tick(Duration::ZERO);
        assert_eq!(c.snapshot(None).rx_second, 10);
    }
}
