//! TCP/UDP/TLS load balancer library.

pub mod config;
pub mod core;
pub mod discovery;
pub mod health;
pub mod lifecycle;
pub mod load_balancer;
pub mod net;
pub mod observability;
pub mod scheduler;
pub mod server;
pub mod stats;

pub use config::schema::ProxyConfig;
pub use lifecycle::{Manager, Shutdown};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use server::Server;
