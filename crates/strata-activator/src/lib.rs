//! strata-activator — warm sandbox pools and the request-path decision
//! point.
//!
//! # Architecture
//!
//! ```text
//! request ──► Activator::acquire(app)
//!               │
//!               ├─ warm window with capacity ──► Lease (round-robin)
//!               │
//!               └─ none ──► per-app gate ──► create PENDING sandbox
//!                              (one in flight)        │
//!                                                     ▼
//!                           wait ◄── watch: sandbox RUNNING ──► window
//! ```
//!
//! # Components
//!
//! - **`strategy`** — auto (slot-based, scale to zero) and fixed concurrency
//! - **`pool`** — per-version windows, in-flight starts and crash backoff
//! - **`activator`** — leases, cold starts, idle sweep, min instances

pub mod activator;
pub mod error;
pub mod pool;
pub mod strategy;

pub use activator::{Activator, ActivatorConfig, Lease};
pub use error::{ActivatorError, ActivatorResult};
pub use pool::{PoolStats, VersionPool, Window};
pub use strategy::{Strategy, DEFAULT_REQUESTS_PER_INSTANCE, DEFAULT_SCALE_DOWN_DELAY};
