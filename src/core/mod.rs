//! Core data model shared by every subsystem.
//!
//! # Data Flow
//! ```text
//! discovery snapshot ──▶ Vec<Backend> (ephemeral copies)
//!                             │ merged field-by-field
//!                             ▼
//!                   scheduler registry: HashMap<Target, Backend>
//!                             │ cloned on election
//!                             ▼
//!                   proxy / session (Context + elected Backend)
//! ```
//!
//! # Design Decisions
//! - `Target` is the identity of a backend; everything else is mutable runtime state
//! - Backends are plain values; only the scheduler owns the authoritative copy
//! - Traffic is reported as `ReadWriteCount` deltas, never as running totals

pub mod backend;
pub mod context;
pub mod target;

pub use backend::{Backend, BackendStats};
pub use context::Context;
pub use target::{Target, TargetParseError};

/// A traffic delta observed on one backend connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadWriteCount {
    /// Backend the traffic belongs to.
    pub target: Target,
    /// Bytes read from the backend (towards the client).
    pub count_read: u64,
    /// Bytes written to the backend (from the client).
    pub count_write: u64,
}

impl ReadWriteCount {
    pub fn is_zero(&self) -> bool {
        self.count_read == 0 && self.count_write == 0
    }
}
