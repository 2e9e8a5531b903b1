//! strata-reconcile — the control loop runtime shared by every Strata
//! controller.
//!
//! # Architecture
//!
//! ```text
//! Controller<R: Reconciler>
//!   ├── watch(filter)      snapshot + live events, re-opened with backoff
//!   ├── requeue channel    delayed re-reads (RequeueAfter, failures)
//!   └── resync interval    periodic list of the filter
//! ```
//!
//! Reconcilers read the entity, decide, and write with the revision they
//! read. A conflict just means someone else moved first: the controller
//! requeues and the next pass sees the newer state.

pub mod backoff;
pub mod controller;
pub mod error;
pub mod retry;

pub use backoff::Backoff;
pub use controller::{Controller, Outcome, Reconciler};
pub use error::{ReconcileError, ReconcileResult};
pub use retry::{update_with_retry, DEFAULT_UPDATE_ATTEMPTS};
