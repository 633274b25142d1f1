//! Library crate for recon-sched: recurring nmap/masscan scan scheduling for a fleet of scan agents.
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod materializer;
pub mod recurrence;
pub mod scheduler;
pub mod seed;
pub mod server;
pub mod store;
pub mod targets;
pub mod types;
pub mod validate;

pub use error::{Error, Result};
