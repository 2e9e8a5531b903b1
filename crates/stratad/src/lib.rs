//! stratad — the Strata daemon.
//!
//! Assembles every subsystem into one process:
//! - Entity store (redb)
//! - Scheduler
//! - Activator and its idle sweep
//! - Runner for the local node
//! - IP allocator, disk-lease, default-app and default-route controllers
//! - Ingress
//! - REST API

pub mod config;
pub mod daemon;

pub use config::{parse_duration, DaemonConfig, LogFormat};
pub use daemon::{open_store, Daemon};
