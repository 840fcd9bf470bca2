//! Traffic statistics subsystem.
//!
//! # Data Flow
//! ```text
//! scheduler ──ReadWriteCount──▶ StatsHandler ──┬─▶ server BandwidthCounter
//! scheduler ──Vec<Target>────▶       │          └─▶ per-target BandwidthCounter
//! server    ──client count───▶       │
//! scheduler ──Vec<Backend>───▶       │
//!                                    │ every 2s
//!                                    ├──BandwidthStats (per target)──▶ scheduler
//!                                    └──ServerStats──▶ watch channel, metrics
//! ```
//!
//! # Design Decisions
//! - One handler task per server owns every counter; nothing is shared
//! - Traffic for an untracked target still counts toward the server total
//! - Rates are `delta / elapsed seconds` over the measured tick interval

pub mod counter;
pub mod handler;

pub use counter::{BandwidthCounter, BandwidthStats};
pub use handler::{ServerStats, StatsHandle, StatsHandler};
