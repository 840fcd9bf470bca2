//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (manager.rs):
//!     Validated config → start each server → skip the ones that fail
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown triggered
//!
//! Shutdown (shutdown.rs):
//!     Trigger → Manager stops every server → schedulers stop discovery
//!     and healthchecks → clients dropped
//! ```
//!
//! # Design Decisions
//! - A failing server never prevents the others from starting
//! - Shutdown is a single token; every holder observes the same signal

pub mod manager;
pub mod shutdown;
pub mod signals;

pub use manager::Manager;
pub use shutdown::Shutdown;
pub use signals::{wait_for_signal, Signal};
